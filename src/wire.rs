use crate::safe_converter::{PrecheckedCast, SafeCast};
use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use std::fmt::Debug;

/// Maximum size of a packet on the wire, chosen so that neither the multicast path nor the
///  TCP retransmission path fragments it.
pub const MAX_PACKET_LEN: usize = 1460;

/// Maximum length of the UTF-8 product identifier carried in a BOP.
pub const MAX_METADATA_LEN: usize = 1024;

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct Flags: u16 {
        const BOP       = 0x0001;
        const EOP       = 0x0002;
        const RETX_REQ  = 0x0008;
        const RETX_DATA = 0x0010;
        const RETX_END  = 0x0020;
        const RETX_REJ  = 0x0040;
    }
}

/// The fixed header that starts every multicast packet and every TCP retransmission frame.
///
/// This codec is the only place in the crate that is aware of byte order.
#[derive(Clone, Eq, PartialEq)]
pub struct FmtpHeader {
    pub prod_index: u32,
    /// byte offset of this block within the product; zero for BOP and EOP
    pub seq_num: u32,
    pub payload_len: u16,
    pub flags: Flags,
}

impl Debug for FmtpHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FMTP{{#{}@{}+{}:{:?}}}", self.prod_index, self.seq_num, self.payload_len, self.flags)
    }
}

impl FmtpHeader {
    pub const SERIALIZED_LEN: usize = 16;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.prod_index);
        buf.put_u32(self.seq_num);
        buf.put_u16(self.payload_len);
        buf.put_u16(self.flags.bits());
        buf.put_u32(0); // reserved
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FmtpHeader> {
        let prod_index = buf.try_get_u32()?;
        let seq_num = buf.try_get_u32()?;
        let payload_len = buf.try_get_u16()?;
        let raw_flags = buf.try_get_u16()?;
        let _reserved = buf.try_get_u32()?;

        let Some(flags) = Flags::from_bits(raw_flags) else {
            bail!("unrecognized flag bits {:#06x}", raw_flags);
        };
        if flags.contains(Flags::BOP | Flags::EOP) {
            bail!("BOP and EOP set simultaneously");
        }
        if flags.contains(Flags::RETX_REJ) && flags != Flags::RETX_REJ {
            bail!("reject combined with other flags: {:?}", flags);
        }

        Ok(FmtpHeader {
            prod_index,
            seq_num,
            payload_len,
            flags,
        })
    }

    /// Decodes a whole packet: header plus bounds-checked payload slice.
    pub fn decode_packet(packet: &[u8]) -> anyhow::Result<(FmtpHeader, &[u8])> {
        let mut buf = packet;
        let header = Self::deser(&mut buf)?;
        if SafeCast::<usize>::safe_cast(header.payload_len) > buf.len() {
            bail!("payload length {} exceeds packet remainder {}", header.payload_len, buf.len());
        }
        let payload = &buf[..SafeCast::<usize>::safe_cast(header.payload_len)];
        Ok((header, payload))
    }

    pub fn is_retransmitted(&self) -> bool {
        self.flags.intersects(Flags::RETX_DATA | Flags::RETX_END | Flags::RETX_REJ)
    }
}

/// The metadata payload of a BOP packet.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BopMessage {
    pub total_size: u64,
    pub signature: [u8; 16],
    /// length of interior data blocks; the last block of a product may be shorter
    pub payload_len: u16,
    /// UTF-8 product identifier, at most [`MAX_METADATA_LEN`] bytes
    pub metadata: String,
}

impl BopMessage {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.total_size);
        buf.put_slice(&self.signature);
        buf.put_u16(self.payload_len);
        buf.put_u16(self.metadata.len().prechecked_cast());
        buf.put_slice(self.metadata.as_bytes());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<BopMessage> {
        let total_size = buf.try_get_u64()?;
        let mut signature = [0u8; 16];
        if buf.remaining() < signature.len() {
            bail!("BOP payload too short for signature");
        }
        buf.copy_to_slice(&mut signature);
        let payload_len = buf.try_get_u16()?;
        let metadata_len: usize = buf.try_get_u16()?.safe_cast();

        if metadata_len > MAX_METADATA_LEN {
            bail!("metadata length {} exceeds maximum of {}", metadata_len, MAX_METADATA_LEN);
        }
        if buf.remaining() < metadata_len {
            bail!("BOP payload too short for metadata of length {}", metadata_len);
        }
        let mut raw_metadata = vec![0u8; metadata_len];
        buf.copy_to_slice(&mut raw_metadata);
        let metadata = String::from_utf8(raw_metadata)?;

        Ok(BopMessage {
            total_size,
            signature,
            payload_len,
            metadata,
        })
    }

    pub fn serialized_len(&self) -> usize {
        8 + 16 + 2 + 2 + self.metadata.len()
    }
}

/// A retransmission request. All four kinds share the 16-byte header as their envelope,
///  distinguished by flag combinations; none carries a payload.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RequestMessage {
    MissingBop { prod_index: u32 },
    MissingData { prod_index: u32, seq_num: u32, data_len: u16 },
    MissingEop { prod_index: u32 },
    /// Tells the sender that the product is repaired and its retransmission state can be freed.
    RetxEnd { prod_index: u32 },
}

impl RequestMessage {
    pub fn prod_index(&self) -> u32 {
        match *self {
            RequestMessage::MissingBop { prod_index } => prod_index,
            RequestMessage::MissingData { prod_index, .. } => prod_index,
            RequestMessage::MissingEop { prod_index } => prod_index,
            RequestMessage::RetxEnd { prod_index } => prod_index,
        }
    }

    pub fn to_header(&self) -> FmtpHeader {
        match *self {
            RequestMessage::MissingBop { prod_index } => FmtpHeader {
                prod_index,
                seq_num: 0,
                payload_len: 0,
                flags: Flags::RETX_REQ | Flags::BOP,
            },
            RequestMessage::MissingData { prod_index, seq_num, data_len } => FmtpHeader {
                prod_index,
                seq_num,
                payload_len: data_len,
                flags: Flags::RETX_REQ,
            },
            RequestMessage::MissingEop { prod_index } => FmtpHeader {
                prod_index,
                seq_num: 0,
                payload_len: 0,
                flags: Flags::RETX_REQ | Flags::EOP,
            },
            RequestMessage::RetxEnd { prod_index } => FmtpHeader {
                prod_index,
                seq_num: 0,
                payload_len: 0,
                flags: Flags::RETX_REQ | Flags::RETX_END,
            },
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.to_header().ser(buf);
    }

    pub fn from_header(header: &FmtpHeader) -> anyhow::Result<RequestMessage> {
        let kind = header.flags & !Flags::RETX_REQ;
        if !header.flags.contains(Flags::RETX_REQ) {
            bail!("not a retransmission request: {:?}", header.flags);
        }

        if kind == Flags::BOP {
            Ok(RequestMessage::MissingBop { prod_index: header.prod_index })
        }
        else if kind == Flags::EOP {
            Ok(RequestMessage::MissingEop { prod_index: header.prod_index })
        }
        else if kind == Flags::RETX_END {
            Ok(RequestMessage::RetxEnd { prod_index: header.prod_index })
        }
        else if kind.is_empty() {
            Ok(RequestMessage::MissingData {
                prod_index: header.prod_index,
                seq_num: header.seq_num,
                data_len: header.payload_len,
            })
        }
        else {
            bail!("unrecognized request kind: {:?}", header.flags)
        }
    }
}

/// Wrap-around aware comparison of product indices: `candidate` counts as newer than
///  `reference` iff it lies at most `window` steps ahead in the cyclic u32 space.
pub fn index_is_ahead(candidate: u32, reference: u32, window: u32) -> bool {
    let distance = candidate.wrapping_sub(reference);
    distance != 0 && distance <= window
}
