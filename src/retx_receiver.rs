//! The retransmission receiver: one task reading framed FMTP messages from the TCP connection
//!  to the sender and merging them into the shared session state.
//!
//! Dispatch mirrors the multicast reader but with retransmission flags; two sender-initiated
//!  message kinds exist only here: whole missed products delivered as retransmitted
//!  BOP/DATA/EOP sequences (the backlog path), and per-product rejections.

use crate::receiver::{SessionOutcome, SessionShared};
use crate::safe_converter::SafeCast;
use crate::wire::{BopMessage, Flags, FmtpHeader};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

pub(crate) async fn run(mut read_half: OwnedReadHalf, shared: Arc<SessionShared>, mut shutdown_rx: watch::Receiver<bool>) -> SessionOutcome {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return SessionOutcome::Shutdown,
            result = read_frame(&mut read_half) => match result {
                Ok(Some((header, payload))) => dispatch_frame(&shared, &header, &payload).await,
                Ok(None) => return SessionOutcome::TransientIo("sender closed the retransmission connection".to_string()),
                Err(e) => return SessionOutcome::TransientIo(format!("retransmission connection failed: {}", e)),
            }
        }
    }
}

/// One framed message: the fixed header followed by exactly `payload_len` bytes. `None` on a
///  clean EOF.
async fn read_frame(read_half: &mut OwnedReadHalf) -> anyhow::Result<Option<(FmtpHeader, Vec<u8>)>> {
    let mut header_buf = [0u8; FmtpHeader::SERIALIZED_LEN];
    match read_half.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let header = FmtpHeader::deser(&mut header_buf.as_slice())?;

    let mut payload = vec![0u8; header.payload_len.safe_cast()];
    read_half.read_exact(&mut payload).await?;

    Ok(Some((header, payload)))
}

async fn dispatch_frame(shared: &SessionShared, header: &FmtpHeader, payload: &[u8]) {
    trace!("received retransmission frame {:?}", header);

    if header.flags == Flags::RETX_REJ {
        shared.handle_reject(header.prod_index).await;
        return;
    }
    if !header.flags.contains(Flags::RETX_DATA) {
        warn!("frame without retransmission flags on the TCP path - dropping: {:?}", header);
        return;
    }

    if header.flags.contains(Flags::BOP) {
        let bop = match BopMessage::deser(&mut &payload[..]) {
            Ok(bop) => bop,
            Err(e) => {
                debug!("dropping retransmitted BOP with malformed payload for product #{}: {:#}", header.prod_index, e);
                return;
            }
        };
        shared.handle_bop(header, &bop, true).await;
    }
    else if header.flags.contains(Flags::EOP) {
        shared.handle_eop(header, true).await;
    }
    else {
        shared.handle_data(header, payload, true).await;
    }
}
