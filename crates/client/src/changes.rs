use std::pin::Pin;
use std::task::{Context, Poll};

use flowsync_common::crdt::GraphSnapshot;
use futures_util::Stream;
use tokio::sync::mpsc;

/// Snapshots of the session's graph: the state at subscription time, then one
/// per visible change. Ends when the session closes.
pub struct DocumentChanges {
    receiver: mpsc::UnboundedReceiver<GraphSnapshot>,
}

impl DocumentChanges {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<GraphSnapshot>) -> Self {
        Self { receiver }
    }
}

impl Stream for DocumentChanges {
    type Item = GraphSnapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
