use super::pipelines::worker::{CancelOnDrop, Submission, WorkerEvent};
use super::responses::{ChatCompletionChunk, ErrorResponse};
use super::script_filter::ScriptFilter;
use axum::response::sse::Event;
use flume::r#async::RecvStream;
use futures::{Stream, StreamExt};
use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tracing::{debug, warn};

#[derive(Debug, PartialEq)]
pub enum StreamingStatus {
    Uninitialized,
    Started,
    Interrupted,
    Stopped,
}

/// SSE body of a streaming chat completion.
///
/// Every worker fragment becomes one `chat.completion.chunk` event, followed by
/// exactly one terminal chunk with `finish_reason = "stop"`. A backend failure
/// ends the stream with a single `event: error` frame instead. Dropping the
/// streamer (client disconnect) cancels the job on the worker.
pub struct Streamer {
    rx: RecvStream<'static, WorkerEvent>,
    _guard: CancelOnDrop,
    pub status: StreamingStatus,
    id: String,
    created: u64,
    model: String,
    filter: Option<Arc<dyn ScriptFilter>>,
}

impl Streamer {
    pub fn new(
        submission: Submission,
        id: String,
        created: u64,
        model: String,
        filter: Option<Arc<dyn ScriptFilter>>,
    ) -> Self {
        Self {
            rx: submission.events.into_stream(),
            _guard: submission.guard,
            status: StreamingStatus::Uninitialized,
            id,
            created,
            model,
            filter,
        }
    }

    fn chunk(&self, content: String) -> Result<Event, axum::Error> {
        let content = match &self.filter {
            Some(filter) => filter.convert(&content),
            None => content,
        };
        Event::default().json_data(ChatCompletionChunk::content(
            self.id.clone(),
            self.created,
            self.model.clone(),
            content,
        ))
    }

    fn finish(&self) -> Result<Event, axum::Error> {
        Event::default().json_data(ChatCompletionChunk::finish(
            self.id.clone(),
            self.created,
            self.model.clone(),
        ))
    }

    fn error(error: ErrorResponse) -> Result<Event, axum::Error> {
        Event::default().event("error").json_data(error)
    }
}

impl Stream for Streamer {
    type Item = Result<Event, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if matches!(
            self.status,
            StreamingStatus::Stopped | StreamingStatus::Interrupted
        ) {
            return Poll::Ready(None);
        }

        match self.rx.poll_next_unpin(cx) {
            Poll::Ready(Some(event)) => match event {
                WorkerEvent::Fragment(text) => {
                    self.status = StreamingStatus::Started;
                    Poll::Ready(Some(self.chunk(text)))
                }
                WorkerEvent::Finished => {
                    self.status = StreamingStatus::Stopped;
                    Poll::Ready(Some(self.finish()))
                }
                // Only non-streaming jobs complete in one piece; tolerate it anyway.
                WorkerEvent::Completed { text, .. } => {
                    self.status = StreamingStatus::Started;
                    let chunk = self.chunk(text);
                    Poll::Ready(Some(chunk))
                }
                WorkerEvent::Failed(e) => {
                    warn!("[{}] stream failed: {}", self.id, e);
                    self.status = StreamingStatus::Stopped;
                    Poll::Ready(Some(Self::error(ErrorResponse::from(&e))))
                }
            },
            Poll::Ready(None) => {
                // Worker dropped the job without a terminal event.
                warn!("[{}] stream interrupted", self.id);
                self.status = StreamingStatus::Interrupted;
                Poll::Ready(Some(Self::error(ErrorResponse::new(
                    "stream interrupted",
                    "model_error",
                ))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        if matches!(
            self.status,
            StreamingStatus::Uninitialized | StreamingStatus::Started
        ) {
            debug!("[{}] client disconnected, cancelling generation", self.id);
        }
    }
}
