//! The multicast reader: one task blocking on the UDP multicast socket, classifying each
//!  packet and dispatching it into the shared session state.

use crate::receiver::{SessionOutcome, SessionShared};
use crate::wire::{BopMessage, Flags, FmtpHeader, MAX_PACKET_LEN};
use anyhow::Context;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

/// Binds a UDP socket to the group's port and joins the group on the given local interface.
///
/// SO_REUSEADDR is set so that several receivers on one host can follow the same feed.
pub fn create_mcast_socket(group: SocketAddrV4, interface_addr: Ipv4Addr) -> anyhow::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("creating multicast socket")?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port())).into())
        .with_context(|| format!("binding multicast socket to port {}", group.port()))?;
    if group.ip().is_multicast() {
        socket.join_multicast_v4(group.ip(), &interface_addr)
            .with_context(|| format!("joining group {:?} on interface {:?}", group.ip(), interface_addr))?;
    }
    socket.set_nonblocking(true)?;

    Ok(UdpSocket::from_std(socket.into())?)
}

pub(crate) async fn run(socket: UdpSocket, shared: Arc<SessionShared>, mut shutdown_rx: watch::Receiver<bool>) -> SessionOutcome {
    info!("multicast reader listening on {:?}", socket.local_addr().ok());

    let mut buf = vec![0u8; MAX_PACKET_LEN];
    let mut num_malformed: u64 = 0;

    loop {
        let num_read = tokio::select! {
            _ = shutdown_rx.changed() => {
                if num_malformed > 0 {
                    info!("multicast reader dropped {} malformed packets this session", num_malformed);
                }
                return SessionOutcome::Shutdown;
            }
            result = socket.recv_from(&mut buf) => match result {
                Ok((num_read, _from)) => num_read,
                Err(e) => return SessionOutcome::TransientIo(format!("multicast socket failed: {}", e)),
            }
        };

        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "mcast_packet", ?correlation_id);

        if !dispatch_packet(&shared, &buf[..num_read]).instrument(span).await {
            num_malformed += 1;
        }
    }
}

/// Classifies one multicast packet and routes it. Returns `false` for malformed packets.
pub(crate) async fn dispatch_packet(shared: &SessionShared, packet: &[u8]) -> bool {
    let (header, payload) = match FmtpHeader::decode_packet(packet) {
        Ok(decoded) => decoded,
        Err(e) => {
            debug!("dropping malformed multicast packet ({} bytes): {:#}", packet.len(), e);
            return false;
        }
    };

    trace!("received {:?}", header);

    if header.is_retransmitted() || header.flags.contains(Flags::RETX_REQ) {
        warn!("packet with retransmission flags on the multicast path - dropping: {:?}", header);
        return false;
    }

    if header.flags.contains(Flags::BOP) {
        let bop = match BopMessage::deser(&mut &payload[..]) {
            Ok(bop) => bop,
            Err(e) => {
                debug!("dropping BOP with malformed payload for product #{}: {:#}", header.prod_index, e);
                return false;
            }
        };
        shared.handle_bop(&header, &bop, false).await;
    }
    else if header.flags.contains(Flags::EOP) {
        shared.handle_eop(&header, false).await;
    }
    else {
        shared.handle_data(&header, payload, false).await;
    }

    true
}
