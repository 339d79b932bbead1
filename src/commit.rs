//! Hooks reporting the terminal outcome of a delivery to the retry layer.

use crossbeam_channel::{Receiver, Sender, bounded};

use crate::error::DeliveryError;

/// Receives exactly one of `commit` or `rollback` per delivered chunk.
pub trait CommitHandle: Send {
    /// The chunk reached a node (and was acknowledged, when acks are on).
    fn commit(self: Box<Self>);
    /// The chunk must be retried.
    fn rollback(self: Box<Self>, error: DeliveryError);
}

/// Terminal outcome reported through [`commit_channel`].
#[derive(Debug)]
pub enum ChunkOutcome {
    Committed,
    RolledBack(DeliveryError),
}

impl ChunkOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, ChunkOutcome::Committed)
    }

    pub fn into_result(self) -> Result<(), DeliveryError> {
        match self {
            ChunkOutcome::Committed => Ok(()),
            ChunkOutcome::RolledBack(err) => Err(err),
        }
    }
}

struct ChannelHandle {
    tx: Sender<ChunkOutcome>,
}

impl CommitHandle for ChannelHandle {
    fn commit(self: Box<Self>) {
        let _ = self.tx.send(ChunkOutcome::Committed);
    }

    fn rollback(self: Box<Self>, error: DeliveryError) {
        let _ = self.tx.send(ChunkOutcome::RolledBack(error));
    }
}

/// A handle that forwards its outcome to the returned receiver.
pub fn commit_channel() -> (Box<dyn CommitHandle>, Receiver<ChunkOutcome>) {
    let (tx, rx) = bounded(1);
    (Box::new(ChannelHandle { tx }), rx)
}

struct FnHandle<F>(F);

impl<F> CommitHandle for FnHandle<F>
where
    F: FnOnce(Result<(), DeliveryError>) + Send,
{
    fn commit(self: Box<Self>) {
        (self.0)(Ok(()))
    }

    fn rollback(self: Box<Self>, error: DeliveryError) {
        (self.0)(Err(error))
    }
}

/// A handle that calls `f` with the outcome.
pub fn commit_fn<F>(f: F) -> Box<dyn CommitHandle>
where
    F: FnOnce(Result<(), DeliveryError>) + Send + 'static,
{
    Box::new(FnHandle(f))
}
