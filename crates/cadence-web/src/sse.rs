//! Server-Sent Events for live scheduler lines.

use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::debug;

/// Create an SSE stream from a broadcast channel.
///
/// Subscribers that fall behind skip the lines they missed.
pub fn create_sse_stream(
    rx: tokio::sync::broadcast::Receiver<String>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let stream =
        BroadcastStream::new(rx).filter_map(|result: Result<String, BroadcastStreamRecvError>| {
            match result {
                Ok(line) => Some(Ok(Event::default().data(line))),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    debug!(skipped, "event subscriber lagged");
                    None
                }
            }
        });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
