//! Newline-delimited JSON framing.

use futures::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use serde::Serialize;

/// Reads one message per line.
pub struct NdjsonReader<R> {
    inner: R,
    line: String,
}

impl<R: AsyncBufRead + Unpin> NdjsonReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line: String::new(),
        }
    }

    /// Next non-blank line without its terminator, `None` at end of input.
    pub async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            self.line.clear();
            let n = self.inner.read_line(&mut self.line).await?;
            if n == 0 {
                return Ok(None);
            }
            let line = self.line.trim_end_matches(['\r', '\n']);
            if !line.trim().is_empty() {
                return Ok(Some(line.to_string()));
            }
        }
    }
}

/// Writes one message per line, flushing after each.
pub struct NdjsonWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> NdjsonWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_json_line<T: Serialize>(&mut self, value: &T) -> std::io::Result<()> {
        let mut buf = serde_json::to_vec(value)?;
        buf.push(b'\n');
        self.inner.write_all(&buf).await?;
        self.inner.flush().await
    }
}
