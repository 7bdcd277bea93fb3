//! Control channel between a downstream receiver and the sender: length-prefixed, tagged
//!  messages over a dedicated TCP connection.
//!
//! Framing: `message length (u32 BE), tag (u8), body`. Three client-initiated operations:
//!
//! * `SUBSCRIBE` - presents the feed name and a shared-secret digest; the reply carries the
//!   multicast group to join and the endpoint for the retransmission connection
//! * `REQUEST_MISSED` - fire-and-forget, asks the sender to deliver one product by index over
//!   the retransmission connection
//! * `REQUEST_BACKLOG` - fire-and-forget, asks for every product between two signatures (or
//!   from a time horizon when no previous session left a signature)
//!
//! Sender-initiated traffic (retransmitted blocks, whole missed products, per-product
//!  rejections) does not travel here - it arrives as FMTP frames on the retransmission
//!  connection.

use crate::safe_converter::{PrecheckedCast, SafeCast};
use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::TryFromPrimitive;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// A control message must fit comfortably into memory on both sides.
const MAX_MESSAGE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
enum MessageTag {
    Subscribe = 1,
    SubscribeReply = 2,
    RequestMissed = 3,
    RequestBacklog = 4,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum SubscribeStatus {
    Granted = 0,
    Unauthorized = 1,
    UnknownFeed = 2,
}

/// What the sender tells a granted subscriber about the session.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct McastInfo {
    /// multicast group the receiver must join
    pub mcast_group: SocketAddrV4,
    /// where to connect for retransmissions
    pub retx_endpoint: SocketAddr,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SubscribeRequest {
    pub feed: String,
    pub nonce: [u8; 16],
    /// `SHA-256(secret || nonce)`
    pub digest: [u8; 32],
}

impl SubscribeRequest {
    pub fn new(feed: impl Into<String>, secret: &[u8]) -> SubscribeRequest {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);

        SubscribeRequest {
            feed: feed.into(),
            digest: digest(secret, &nonce),
            nonce,
        }
    }

    /// Sender-side check of the shared secret.
    pub fn verify(&self, secret: &[u8]) -> bool {
        self.digest == digest(secret, &self.nonce)
    }
}

fn digest(secret: &[u8], nonce: &[u8; 16]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(nonce);
    hasher.finalize().into()
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SubscribeReply {
    pub status: SubscribeStatus,
    /// present iff the subscription was granted
    pub mcast_info: Option<McastInfo>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BacklogRequest {
    /// where the previous session left off; `None` asks for the time horizon instead
    pub from_signature: Option<[u8; 16]>,
    /// signature of the first product of the running session
    pub to_signature: [u8; 16],
    pub time_offset: Duration,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ControlMessage {
    Subscribe(SubscribeRequest),
    SubscribeReply(SubscribeReply),
    RequestMissed { prod_index: u32 },
    RequestBacklog(BacklogRequest),
}

impl ControlMessage {
    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            ControlMessage::Subscribe(request) => {
                buf.put_u8(MessageTag::Subscribe as u8);
                put_string(buf, &request.feed);
                buf.put_slice(&request.nonce);
                buf.put_slice(&request.digest);
            }
            ControlMessage::SubscribeReply(reply) => {
                buf.put_u8(MessageTag::SubscribeReply as u8);
                buf.put_u8(reply.status as u8);
                if let Some(info) = &reply.mcast_info {
                    buf.put_u32(info.mcast_group.ip().to_bits());
                    buf.put_u16(info.mcast_group.port());
                    put_socket_addr(buf, info.retx_endpoint);
                }
            }
            ControlMessage::RequestMissed { prod_index } => {
                buf.put_u8(MessageTag::RequestMissed as u8);
                buf.put_u32(*prod_index);
            }
            ControlMessage::RequestBacklog(request) => {
                buf.put_u8(MessageTag::RequestBacklog as u8);
                match &request.from_signature {
                    None => buf.put_u8(0),
                    Some(signature) => {
                        buf.put_u8(1);
                        buf.put_slice(signature);
                    }
                }
                buf.put_slice(&request.to_signature);
                buf.put_u32(request.time_offset.as_secs().prechecked_cast());
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ControlMessage> {
        let tag = MessageTag::try_from(buf.try_get_u8()?)?;

        match tag {
            MessageTag::Subscribe => {
                let feed = try_get_string(buf)?;
                let nonce = try_get_array::<16>(buf)?;
                let digest = try_get_array::<32>(buf)?;
                Ok(ControlMessage::Subscribe(SubscribeRequest { feed, nonce, digest }))
            }
            MessageTag::SubscribeReply => {
                let status = SubscribeStatus::try_from(buf.try_get_u8()?)?;
                let mcast_info = if status == SubscribeStatus::Granted {
                    let group_ip: Ipv4Addr = buf.try_get_u32()?.into();
                    let group_port = buf.try_get_u16()?;
                    let retx_endpoint = try_get_socket_addr(buf)?;
                    Some(McastInfo {
                        mcast_group: SocketAddrV4::new(group_ip, group_port),
                        retx_endpoint,
                    })
                }
                else {
                    None
                };
                Ok(ControlMessage::SubscribeReply(SubscribeReply { status, mcast_info }))
            }
            MessageTag::RequestMissed => Ok(ControlMessage::RequestMissed { prod_index: buf.try_get_u32()? }),
            MessageTag::RequestBacklog => {
                let from_signature = match buf.try_get_u8()? {
                    0 => None,
                    1 => Some(try_get_array::<16>(buf)?),
                    other => bail!("invalid from-signature marker {}", other),
                };
                let to_signature = try_get_array::<16>(buf)?;
                let time_offset = Duration::from_secs(buf.try_get_u32()?.safe_cast());
                Ok(ControlMessage::RequestBacklog(BacklogRequest { from_signature, to_signature, time_offset }))
            }
        }
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = buf.try_get_usize_varint()?;
    if len > MAX_MESSAGE_LEN {
        bail!("string of length {} exceeds the message size limit", len);
    }
    if buf.remaining() < len {
        bail!("truncated string: {} bytes declared, {} available", len, buf.remaining());
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    Ok(String::from_utf8(raw)?)
}

fn try_get_array<const N: usize>(buf: &mut impl Buf) -> anyhow::Result<[u8; N]> {
    if buf.remaining() < N {
        bail!("truncated message: {} bytes needed, {} available", N, buf.remaining());
    }
    let mut result = [0u8; N];
    buf.copy_to_slice(&mut result);
    Ok(result)
}

fn put_socket_addr(buf: &mut BytesMut, addr: SocketAddr) {
    match addr {
        SocketAddr::V4(addr) => {
            buf.put_u8(4);
            buf.put_u32(addr.ip().to_bits());
            buf.put_u16(addr.port());
        }
        SocketAddr::V6(addr) => {
            buf.put_u8(6);
            buf.put_u128(addr.ip().to_bits());
            buf.put_u16(addr.port());
        }
    }
}

fn try_get_socket_addr(buf: &mut impl Buf) -> anyhow::Result<SocketAddr> {
    match buf.try_get_u8()? {
        4 => {
            let ip: Ipv4Addr = buf.try_get_u32()?.into();
            let port = buf.try_get_u16()?;
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        6 => {
            let ip: std::net::Ipv6Addr = buf.try_get_u128()?.into();
            let port = buf.try_get_u16()?;
            Ok(SocketAddr::V6(std::net::SocketAddrV6::new(ip, port, 0, 0)))
        }
        other => bail!("invalid address family marker {}", other),
    }
}

pub async fn write_message(stream: &mut (impl AsyncWrite + Unpin), message: &ControlMessage) -> anyhow::Result<()> {
    let mut body = BytesMut::new();
    message.ser(&mut body);

    let mut framed = BytesMut::with_capacity(4 + body.len());
    framed.put_u32(body.len().prechecked_cast());
    framed.put_slice(&body);

    stream.write_all(&framed).await?;
    Ok(())
}

pub async fn read_message(stream: &mut (impl AsyncRead + Unpin)) -> anyhow::Result<ControlMessage> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let message_len: usize = u32::from_be_bytes(len_buf).safe_cast();

    if message_len > MAX_MESSAGE_LEN {
        bail!("control message of {} bytes exceeds the limit of {} - closing the connection", message_len, MAX_MESSAGE_LEN);
    }

    let mut message_buf = vec![0u8; message_len];
    stream.read_exact(&mut message_buf).await?;
    ControlMessage::deser(&mut message_buf.as_slice())
}

/// Outcome of a subscribe call that reached the sender.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SubscribeOutcome {
    Granted(McastInfo),
    Refused(SubscribeStatus),
}

/// Client side of the control channel. One instance per session iteration.
pub struct ControlClient {
    stream: TcpStream,
    rpc_timeout: Duration,
    rpc_timeout_is_success: bool,
}

impl ControlClient {
    pub async fn connect(sender_addr: SocketAddr, rpc_timeout: Duration, rpc_timeout_is_success: bool) -> anyhow::Result<ControlClient> {
        let stream = tokio::time::timeout(rpc_timeout, TcpStream::connect(sender_addr)).await??;
        debug!("control channel connected to {:?}", sender_addr);

        Ok(ControlClient {
            stream,
            rpc_timeout,
            rpc_timeout_is_success,
        })
    }

    pub async fn subscribe(&mut self, feed: &str, secret: &[u8]) -> anyhow::Result<SubscribeOutcome> {
        let request = ControlMessage::Subscribe(SubscribeRequest::new(feed, secret));

        let reply = tokio::time::timeout(self.rpc_timeout, async {
            write_message(&mut self.stream, &request).await?;
            read_message(&mut self.stream).await
        }).await??;

        match reply {
            ControlMessage::SubscribeReply(SubscribeReply { status: SubscribeStatus::Granted, mcast_info: Some(info) }) => {
                Ok(SubscribeOutcome::Granted(info))
            }
            ControlMessage::SubscribeReply(SubscribeReply { status, .. }) => Ok(SubscribeOutcome::Refused(status)),
            other => bail!("expected a subscribe reply, got {:?}", other),
        }
    }

    pub async fn request_missed(&mut self, prod_index: u32) -> anyhow::Result<()> {
        self.fire_and_forget(&ControlMessage::RequestMissed { prod_index }).await
    }

    pub async fn request_backlog(&mut self, request: BacklogRequest) -> anyhow::Result<()> {
        self.fire_and_forget(&ControlMessage::RequestBacklog(request)).await
    }

    async fn fire_and_forget(&mut self, message: &ControlMessage) -> anyhow::Result<()> {
        match tokio::time::timeout(self.rpc_timeout, write_message(&mut self.stream, message)).await {
            Ok(result) => result,
            Err(_elapsed) if self.rpc_timeout_is_success => {
                // the sender may or may not have observed the call; treating this as success
                //  mirrors the at-most-once contract of these operations
                warn!("control call timed out after {:?}, continuing: {:?}", self.rpc_timeout, message);
                Ok(())
            }
            Err(elapsed) => Err(elapsed.into()),
        }
    }
}
