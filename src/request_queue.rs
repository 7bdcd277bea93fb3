use crate::wire::RequestMessage;
use tokio::sync::mpsc;
use tracing::trace;

/// What travels on the queue: retransmission requests, terminated by a distinguished stop item.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum QueueItem {
    Request(RequestMessage),
    Stop,
}

/// Producer side of the retransmission request queue.
///
/// The multicast reader, the BOP timer and the retransmission receiver all push onto this; the
///  requester drains it in FIFO order. Pushing never blocks, so it is safe while holding the
///  tracker-map lock. After `shutdown`, further pushes are silently dropped.
#[derive(Clone)]
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<QueueItem>,
}

impl RequestQueue {
    pub fn new() -> (RequestQueue, RequestQueueReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RequestQueue { tx }, RequestQueueReceiver { rx })
    }

    pub fn push(&self, request: RequestMessage) {
        trace!("enqueueing {:?}", request);
        if self.tx.send(QueueItem::Request(request)).is_err() {
            trace!("request queue is shut down, dropping {:?}", request);
        }
    }

    /// Makes the requester exit after draining everything enqueued before this call.
    ///  Idempotent.
    pub fn shutdown(&self) {
        self.tx.send(QueueItem::Stop).ok();
    }
}

/// Consumer side, exclusively owned by the requester task.
pub struct RequestQueueReceiver {
    rx: mpsc::UnboundedReceiver<QueueItem>,
}

impl RequestQueueReceiver {
    /// The next request in FIFO order, or `None` once the queue was shut down.
    pub async fn recv(&mut self) -> Option<RequestMessage> {
        match self.rx.recv().await {
            Some(QueueItem::Request(request)) => Some(request),
            Some(QueueItem::Stop) | None => None,
        }
    }

    /// Non-blocking variant for assertions on queue contents.
    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<RequestMessage> {
        match self.rx.try_recv() {
            Ok(QueueItem::Request(request)) => Some(request),
            _ => None,
        }
    }
}
