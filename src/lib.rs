//! Downstream receiver for FMTP, a reliable multicast file transfer protocol:
//!  one sender multicasts a sequence of identified data products over UDP, and
//!  every receiver repairs its own losses over a dedicated TCP connection back
//!  to the sender.
//!
//! ## Design goals
//!
//! * Products (files or in-memory blobs) are identified two ways: by a
//!   sender-assigned, monotonically increasing *product index* (valid within a
//!   session, wrap-around defined by a recency window), and by a 16-byte
//!   content *signature* (valid across sessions and restarts)
//! * The multicast path is strictly best-effort; all recovery is pulled by the
//!   receiver. A receiver that detects a gap asks the sender to retransmit the
//!   missing pieces over TCP, so one slow receiver never holds back the group
//! * Loss of the opening marker of a product (the BOP) is bounded by a timer
//!   derived from the measured round trip to the sender - a product whose BOP
//!   never shows up is abandoned, not waited on forever
//! * A persistent per-source memory bridges restarts: the signature of the
//!   last delivered product lets a fresh session ask the sender for the
//!   backlog that accumulated while the receiver was down
//!
//! ## Packet format
//!
//! Every multicast packet and every TCP retransmission frame starts with the
//!  same 16-byte header, all fields in network byte order:
//!
//! ```ascii
//! 0:  product index (u32) - sender-assigned, monotonically increasing
//! 4:  sequence (u32) - byte offset of this block within the product
//! 8:  payload length (u16) - number of payload bytes following the header
//! 10: flags (u16)
//! 12: reserved (u32) - must be zero
//! ```
//!
//! Flag bits:
//!
//! ```ascii
//! 0x0001  BOP - begin of product, payload carries product metadata
//! 0x0002  EOP - end of product, no payload
//! 0x0008  retransmission request (receiver to sender, TCP only)
//! 0x0010  retransmitted data
//! 0x0020  retransmission end (receiver to sender after a repaired product)
//! 0x0040  retransmission reject - sender declares the product unrecoverable
//! ```
//!
//! The BOP payload is `total size (u64), signature (16 bytes), payload length
//!  of interior blocks (u16), metadata length (u16), metadata (UTF-8, at most
//!  1024 bytes)`.
//!
//! Packets are at most 1460 bytes so that neither the multicast path nor the
//!  TCP retransmission path fragments them.
//!
//! ## Control plane
//!
//! Subscription and backlog requests run over a separate TCP connection with
//!  length-prefixed, tagged messages - see [`control`]. The subscribe reply
//!  tells the receiver which multicast group to join and where to connect for
//!  retransmissions.

pub mod bop_timer;
pub mod config;
pub mod control;
pub mod mcast_receiver;
pub mod notifier;
pub mod product_tracker;
pub mod receiver;
pub mod request_queue;
pub mod retx_receiver;
pub mod retx_requester;
pub mod rtt;
pub mod safe_converter;
pub mod session_memory;
pub mod supervisor;
pub mod wire;
