use crate::notifier::CompletedProduct;
use crate::safe_converter::SafeCast;
use crate::wire::BopMessage;
use anyhow::bail;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use std::fmt::Debug;
use tokio::time::Instant;
use tracing::trace;

/// What happened to a data block offered to a tracker.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RecordOutcome {
    /// the block was new and its bytes were written into the product buffer
    First,
    /// the block had already been received on the other path; nothing was written
    Duplicate,
    /// offset or length disagree with the product geometry; nothing was written
    OutOfRange,
}

/// Reception state of one in-flight product.
///
/// The geometry is fixed at creation from the BOP: `total_size` bytes, delivered in blocks of
///  `payload_len` at offsets that are multiples of `payload_len`, the last block possibly
///  shorter. A block's bit is set iff its bytes have been written into the buffer; duplicate
///  arrivals neither rewrite bytes nor clear bits, which makes the multicast and the
///  retransmission path idempotent against each other.
pub struct ProductTracker {
    prod_index: u32,
    total_size: u64,
    signature: [u8; 16],
    metadata: String,
    /// length of interior blocks; immutable, from the BOP
    payload_len: u16,

    buffer: BytesMut,
    blocks_received: Vec<bool>,
    num_received: usize,
    highest_seq: Option<u32>,

    num_retx_requests: u32,
    /// whether any part of this product arrived via the retransmission path
    repaired: bool,
    eop_received: bool,
    created_at: Instant,
}

impl Debug for ProductTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tracker{{#{}: {}/{} blocks, eop: {}}}",
               self.prod_index, self.num_received, self.blocks_received.len(), self.eop_received)
    }
}

impl ProductTracker {
    pub fn new(prod_index: u32, bop: &BopMessage, buffer: BytesMut) -> anyhow::Result<ProductTracker> {
        if buffer.len().safe_cast() != bop.total_size {
            bail!("destination buffer has {} bytes for a product of {}", buffer.len(), bop.total_size);
        }
        if bop.payload_len == 0 && bop.total_size > 0 {
            bail!("zero payload length for a non-empty product");
        }

        let num_blocks = if bop.total_size == 0 {
            0
        }
        else {
            bop.total_size.div_ceil(bop.payload_len.safe_cast()) as usize
        };

        Ok(ProductTracker {
            prod_index,
            total_size: bop.total_size,
            signature: bop.signature,
            metadata: bop.metadata.clone(),
            payload_len: bop.payload_len,
            buffer,
            blocks_received: vec![false; num_blocks],
            num_received: 0,
            highest_seq: None,
            num_retx_requests: 0,
            repaired: false,
            eop_received: false,
            created_at: Instant::now(),
        })
    }

    pub fn prod_index(&self) -> u32 {
        self.prod_index
    }

    pub fn signature(&self) -> [u8; 16] {
        self.signature
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn highest_seq(&self) -> Option<u32> {
        self.highest_seq
    }

    /// The block length the geometry dictates for `seq`, or `None` if `seq` is not a valid
    ///  block offset of this product.
    fn expected_block_len(&self, seq: u32) -> Option<u16> {
        let seq: u64 = seq.safe_cast();
        if seq >= self.total_size || seq % SafeCast::<u64>::safe_cast(self.payload_len) != 0 {
            return None;
        }

        let remaining = self.total_size - seq;
        Some(remaining.min(self.payload_len.safe_cast()) as u16)
    }

    pub fn record_block(&mut self, seq: u32, data: &[u8]) -> RecordOutcome {
        let Some(expected_len) = self.expected_block_len(seq) else {
            return RecordOutcome::OutOfRange;
        };
        if data.len() != expected_len.safe_cast() {
            return RecordOutcome::OutOfRange;
        }

        let block = (seq / self.payload_len as u32) as usize;
        if self.blocks_received[block] {
            trace!("product #{}: block at {} already present", self.prod_index, seq);
            return RecordOutcome::Duplicate;
        }

        let offset = seq as usize;
        self.buffer[offset..offset + data.len()].copy_from_slice(data);
        self.blocks_received[block] = true;
        self.num_received += 1;
        if self.highest_seq.map(|h| seq > h).unwrap_or(true) {
            self.highest_seq = Some(seq);
        }

        RecordOutcome::First
    }

    /// All unfilled block coordinates with offset strictly below `seq`.
    pub fn missing_before(&self, seq: u32) -> impl Iterator<Item = (u32, u16)> + '_ {
        let upper = (seq as u64).min(self.total_size);
        self.blocks_received
            .iter()
            .enumerate()
            .take_while(move |(block, _)| (*block as u64) * (self.payload_len as u64) < upper)
            .filter(|(_, received)| !**received)
            .map(|(block, _)| {
                let offset = block as u32 * self.payload_len as u32;
                (offset, self.expected_block_len(offset).expect("block index is in range"))
            })
    }

    /// All unfilled block coordinates of the product.
    pub fn missing_all(&self) -> impl Iterator<Item = (u32, u16)> + '_ {
        self.missing_before(u32::MAX)
    }

    /// idempotent
    pub fn mark_eop(&mut self) {
        self.eop_received = true;
    }

    pub fn eop_received(&self) -> bool {
        self.eop_received
    }

    pub fn note_retx_request(&mut self) {
        self.num_retx_requests += 1;
    }

    pub fn num_retx_requests(&self) -> u32 {
        self.num_retx_requests
    }

    pub fn mark_repaired(&mut self) {
        self.repaired = true;
    }

    pub fn was_repaired(&self) -> bool {
        self.repaired || self.num_retx_requests > 0
    }

    pub fn is_complete(&self) -> bool {
        self.eop_received && self.num_received == self.blocks_received.len()
    }

    fn into_completed(self) -> CompletedProduct {
        CompletedProduct {
            prod_index: self.prod_index,
            signature: self.signature,
            metadata: self.metadata,
            data: self.buffer.freeze(),
        }
    }
}

/// All in-flight products of one session, keyed by product index.
#[derive(Default)]
pub struct TrackerMap {
    trackers: FxHashMap<u32, ProductTracker>,
}

impl TrackerMap {
    pub fn create(&mut self, prod_index: u32, bop: &BopMessage, buffer: BytesMut) -> anyhow::Result<()> {
        if self.trackers.contains_key(&prod_index) {
            bail!("duplicate tracker for product #{}", prod_index);
        }

        let tracker = ProductTracker::new(prod_index, bop, buffer)?;
        self.trackers.insert(prod_index, tracker);
        Ok(())
    }

    pub fn get(&self, prod_index: u32) -> Option<&ProductTracker> {
        self.trackers.get(&prod_index)
    }

    pub fn get_mut(&mut self, prod_index: u32) -> Option<&mut ProductTracker> {
        self.trackers.get_mut(&prod_index)
    }

    pub fn contains(&self, prod_index: u32) -> bool {
        self.trackers.contains_key(&prod_index)
    }

    pub fn remove(&mut self, prod_index: u32) -> Option<ProductTracker> {
        self.trackers.remove(&prod_index)
    }

    /// Removes and returns the product iff it is complete; a product leaves the map through
    ///  here exactly once.
    pub fn finalize(&mut self, prod_index: u32) -> Option<CompletedProduct> {
        if !self.get(prod_index).map(ProductTracker::is_complete).unwrap_or(false) {
            return None;
        }
        self.trackers.remove(&prod_index).map(ProductTracker::into_completed)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (u32, ProductTracker)> + '_ {
        self.trackers.drain()
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn bop(total_size: u64, payload_len: u16) -> BopMessage {
        BopMessage {
            total_size,
            signature: [7; 16],
            payload_len,
            metadata: "test-product".to_string(),
        }
    }

    fn buffer(size: usize) -> BytesMut {
        let mut buf = BytesMut::with_capacity(size);
        buf.resize(size, 0);
        buf
    }

    #[test]
    fn test_perfect_delivery() {
        let mut tracker = ProductTracker::new(7, &bop(3000, 1200), buffer(3000)).unwrap();

        assert_eq!(tracker.record_block(0, &[1; 1200]), RecordOutcome::First);
        assert_eq!(tracker.record_block(1200, &[2; 1200]), RecordOutcome::First);
        assert_eq!(tracker.record_block(2400, &[3; 600]), RecordOutcome::First);
        assert!(!tracker.is_complete());

        tracker.mark_eop();
        assert!(tracker.is_complete());

        let product = tracker.into_completed();
        assert_eq!(product.prod_index, 7);
        assert_eq!(&product.data[..1200], &[1; 1200][..]);
        assert_eq!(&product.data[1200..2400], &[2; 1200][..]);
        assert_eq!(&product.data[2400..], &[3; 600][..]);
    }

    #[test]
    fn test_duplicates_do_not_rewrite() {
        let mut tracker = ProductTracker::new(7, &bop(3000, 1200), buffer(3000)).unwrap();

        assert_eq!(tracker.record_block(1200, &[2; 1200]), RecordOutcome::First);
        // the same block arriving again on the other path: first writer wins
        assert_eq!(tracker.record_block(1200, &[9; 1200]), RecordOutcome::Duplicate);
        assert_eq!(&tracker.buffer[1200..2400], &[2; 1200][..]);
    }

    #[rstest]
    #[case::unaligned_offset(600, 1200)]
    #[case::beyond_end(3600, 1200)]
    #[case::interior_block_short(0, 600)]
    #[case::interior_block_long(0, 1201)]
    #[case::last_block_full_length(2400, 1200)]
    fn test_out_of_range(#[case] seq: u32, #[case] len: usize) {
        let mut tracker = ProductTracker::new(7, &bop(3000, 1200), buffer(3000)).unwrap();
        assert_eq!(tracker.record_block(seq, &vec![0; len]), RecordOutcome::OutOfRange);
        assert_eq!(tracker.num_received, 0);
    }

    #[test]
    fn test_trailing_short_block() {
        let mut tracker = ProductTracker::new(7, &bop(3000, 1200), buffer(3000)).unwrap();
        assert_eq!(tracker.record_block(2400, &[3; 600]), RecordOutcome::First);
    }

    #[test]
    fn test_missing_before() {
        let mut tracker = ProductTracker::new(7, &bop(3000, 1200), buffer(3000)).unwrap();
        tracker.record_block(2400, &[3; 600]);

        let missing: Vec<_> = tracker.missing_before(2400).collect();
        assert_eq!(missing, vec![(0, 1200), (1200, 1200)]);

        tracker.record_block(0, &[1; 1200]);
        let missing: Vec<_> = tracker.missing_before(2400).collect();
        assert_eq!(missing, vec![(1200, 1200)]);

        // bounded by what has arrived, not by the product end
        let missing: Vec<_> = tracker.missing_before(1200).collect();
        assert_eq!(missing, vec![]);

        let all: Vec<_> = tracker.missing_all().collect();
        assert_eq!(all, vec![(1200, 1200)]);
    }

    #[test]
    fn test_empty_product_completes_on_eop() {
        let mut tracker = ProductTracker::new(3, &bop(0, 1200), buffer(0)).unwrap();
        assert!(!tracker.is_complete());
        tracker.mark_eop();
        assert!(tracker.is_complete());
    }

    #[test]
    fn test_create_rejects_bad_geometry() {
        assert!(ProductTracker::new(1, &bop(3000, 0), buffer(3000)).is_err());
        assert!(ProductTracker::new(1, &bop(3000, 1200), buffer(100)).is_err());
    }

    #[test]
    fn test_map_duplicate_create() {
        let mut map = TrackerMap::default();
        map.create(7, &bop(3000, 1200), buffer(3000)).unwrap();
        assert!(map.create(7, &bop(3000, 1200), buffer(3000)).is_err());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_finalize_only_when_complete_and_only_once() {
        let mut map = TrackerMap::default();
        map.create(7, &bop(1200, 1200), buffer(1200)).unwrap();

        assert!(map.finalize(7).is_none());

        let tracker = map.get_mut(7).unwrap();
        tracker.record_block(0, &[5; 1200]);
        assert!(map.finalize(7).is_none());

        map.get_mut(7).unwrap().mark_eop();
        let product = map.finalize(7).expect("complete product must finalize");
        assert_eq!(product.signature, [7; 16]);

        assert!(map.finalize(7).is_none());
        assert!(map.is_empty());
    }
}
