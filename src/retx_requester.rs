//! The retransmission requester: one task draining the request queue in FIFO order and
//!  writing each request envelope to the TCP connection.
//!
//! A failed write is fatal to the session - the connection to the sender is gone, and with it
//!  any chance of repairing products. Queue shutdown ends the task cleanly after everything
//!  already enqueued has been flushed.

use crate::receiver::{SessionOutcome, SessionShared};
use crate::request_queue::RequestQueueReceiver;
use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tracing::trace;

pub(crate) async fn run(mut write_half: OwnedWriteHalf, mut queue_rx: RequestQueueReceiver, shared: Arc<SessionShared>) -> SessionOutcome {
    let mut buf = BytesMut::with_capacity(crate::wire::FmtpHeader::SERIALIZED_LEN);

    while let Some(request) = queue_rx.recv().await {
        buf.clear();
        request.ser(&mut buf);

        if let Err(e) = write_half.write_all(&buf).await {
            return SessionOutcome::TransientIo(format!("writing retransmission request failed: {}", e));
        }
        trace!("sent {:?}", request);

        shared.note_request_written(&request).await;
    }

    SessionOutcome::Shutdown
}
