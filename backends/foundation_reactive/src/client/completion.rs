//! Single-fire completion signal.
//!
//! WHY: An exchange has many producers of a terminal outcome (the response
//! head, a decode failure, the peer closing, a failing request handler), but
//! its caller must observe exactly one.
//!
//! WHAT: `CompletionSink` (the producing side, shareable across tasks) and
//! `Completion` (the future the caller awaits).
//!
//! HOW: The sink owns a `oneshot::Sender` behind a mutex; completing takes
//! it out, so only the first completion can ever be delivered. Dropping the
//! `Completion` is cancellation: later completions are swallowed.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use super::HttpClientError;
use crate::sync::lock;

pub type Outcome<T> = Result<T, HttpClientError>;

pub struct CompletionSink<T> {
    sender: Mutex<Option<oneshot::Sender<Outcome<T>>>>,
}

/// Creates a linked sink and completion.
#[must_use]
pub fn completion<T>() -> (CompletionSink<T>, Completion<T>) {
    let (sender, receiver) = oneshot::channel();
    (
        CompletionSink {
            sender: Mutex::new(Some(sender)),
        },
        Completion { receiver },
    )
}

impl<T> CompletionSink<T> {
    /// Delivers success. Returns false when the sink had already fired.
    pub fn success(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    /// Delivers failure. Returns false when the sink had already fired.
    pub fn error(&self, err: HttpClientError) -> bool {
        self.complete(Err(err))
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        lock(&self.sender).is_none()
    }

    fn complete(&self, outcome: Outcome<T>) -> bool {
        let Some(sender) = lock(&self.sender).take() else {
            if let Err(err) = &outcome {
                tracing::debug!("Completion already fired, dropping late error: {err}");
            }
            return false;
        };
        if sender.send(outcome).is_err() {
            tracing::debug!("Completion fired after its subscriber went away");
        }
        true
    }
}

/// Resolves with the first outcome delivered to the linked sink, or
/// `ConnectionClosed` if the sink is dropped without firing.
pub struct Completion<T> {
    receiver: oneshot::Receiver<Outcome<T>>,
}

impl<T> Future for Completion<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(HttpClientError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}
