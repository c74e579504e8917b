//! JSON-RPC 2.0 over newline-delimited stdio.
//!
//! The loop multiplexes three sources: request lines (read on their own task),
//! replies of short calls (each handled on its own task), and wakeups from the
//! query engine's completion queue. Nothing the loop awaits ever waits on a
//! database, so a slow query never holds up other requests. Replies go out in
//! the order they become ready, not the order requests came in.

mod handler;
mod io;
mod protocol;

pub use handler::RpcHandler;
pub use io::{NdjsonReader, NdjsonWriter};
pub use protocol::{Request, Response, RpcError};

use futures::io::{AsyncBufRead, AsyncWrite};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use protocol::PARSE_ERROR;

enum Event {
    Line(String),
    InputClosed,
    Completions,
    Reply(Option<Response>),
}

/// Serve requests from `input` until it closes and every in-flight call has been answered.
pub async fn serve<R, W>(handler: Arc<RpcHandler>, input: R, output: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let mut writer = NdjsonWriter::new(output);
    let queue = Arc::clone(handler.engine().queue());

    let (line_tx, line_rx) = async_channel::bounded::<String>(64);
    smol::spawn(async move {
        let mut reader = NdjsonReader::new(input);
        loop {
            match reader.read_line().await {
                Ok(Some(line)) => {
                    if line_tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "failed to read request");
                    break;
                }
            }
        }
    })
    .detach();

    let (reply_tx, reply_rx) = async_channel::unbounded::<Option<Response>>();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let mut input_open = true;

    loop {
        if !input_open
            && in_flight.load(Ordering::SeqCst) == 0
            && reply_rx.is_empty()
            && queue.running_count() == 0
            && queue.completed_count() == 0
        {
            break;
        }

        let wakeups = smol::future::or(
            async {
                queue.notified().await;
                Event::Completions
            },
            async {
                match reply_rx.recv().await {
                    Ok(reply) => Event::Reply(reply),
                    Err(_) => Event::Reply(None),
                }
            },
        );
        let event = if input_open {
            smol::future::or(
                async {
                    match line_rx.recv().await {
                        Ok(line) => Event::Line(line),
                        Err(_) => Event::InputClosed,
                    }
                },
                wakeups,
            )
            .await
        } else {
            wakeups.await
        };

        match event {
            Event::Line(line) => {
                let message = match serde_json::from_str(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        let error = RpcError::new(PARSE_ERROR, format!("parse error: {e}"));
                        writer
                            .write_json_line(&Response::err(serde_json::Value::Null, error))
                            .await?;
                        continue;
                    }
                };
                let request = match Request::from_value(message) {
                    Ok(request) => request,
                    Err((id, error)) => {
                        writer.write_json_line(&Response::err(id, error)).await?;
                        continue;
                    }
                };

                in_flight.fetch_add(1, Ordering::SeqCst);
                let handler = Arc::clone(&handler);
                let reply_tx = reply_tx.clone();
                let in_flight = Arc::clone(&in_flight);
                smol::spawn(async move {
                    let reply = handler.handle(request).await;
                    let _ = reply_tx.send(reply).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                })
                .detach();
            }
            Event::InputClosed => {
                tracing::debug!("input closed, draining in-flight requests");
                input_open = false;
            }
            Event::Completions => {
                while let Some(query) = queue.pop() {
                    if let Some(response) = RpcHandler::completion_response(query) {
                        writer.write_json_line(&response).await?;
                    }
                }
            }
            Event::Reply(Some(response)) => writer.write_json_line(&response).await?,
            Event::Reply(None) => {}
        }
    }

    handler.engine().pool().close_all().await;
    Ok(())
}

/// Serve on the process's stdin and stdout.
pub async fn serve_stdio(handler: Arc<RpcHandler>) -> anyhow::Result<()> {
    let input = smol::io::BufReader::new(smol::Unblock::new(std::io::stdin()));
    let output = smol::Unblock::new(std::io::stdout());
    serve(handler, input, output).await
}
