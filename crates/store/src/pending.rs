use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::FutureExt;

use crate::StoreError;

pub(crate) type Outcome = Result<(), StoreError>;

/// Outcome of a [`Record::save`](crate::Record::save).
///
/// Resolves `Ok` once the write is confirmed (by reconciliation, or at once
/// for no-op saves) and `Err` with the store's error when the write fails.
#[derive(Debug)]
#[must_use = "a pending write reports its failure only through this future"]
pub struct Pending(Inner);

#[derive(Debug)]
enum Inner {
    Ready(Option<Outcome>),
    Waiting(oneshot::Receiver<Outcome>),
}

impl Pending {
    pub(crate) fn channel() -> (oneshot::Sender<Outcome>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self(Inner::Waiting(rx)))
    }

    /// Already settled successfully.
    pub fn resolved() -> Self {
        Self(Inner::Ready(Some(Ok(()))))
    }
}

impl Future for Pending {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().0 {
            Inner::Ready(outcome) => Poll::Ready(outcome.take().unwrap_or(Err(StoreError::Abandoned))),
            // The sender only disappears unsent if the record itself is gone.
            Inner::Waiting(rx) => rx.poll_unpin(cx).map(|r| r.unwrap_or(Err(StoreError::Abandoned))),
        }
    }
}
