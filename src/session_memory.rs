use crate::safe_converter::PrecheckedCast;
use crate::wire::index_is_ahead;
use anyhow::{bail, Context};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const MAGIC: &[u8; 8] = b"FMTPSM01";

/// The widest window for which the wrap-around index comparison is well defined.
const INDEX_HALF_SPACE: u32 = (1 << 31) - 1;

/// Durable per-(sender, feed) receiver state bridging process restarts.
///
/// Two things survive: the signature of the last product delivered to the product queue, which
///  anchors the next session's backlog request, and a bounded queue of product indices that
///  were detected missing but not yet requested - so a crash between "detected" and "requested"
///  does not lose the request.
///
/// Products complete in repair order, not index order, so the signature is stored together
///  with its product index and only ever advances: a completion for an older index than the
///  stored one leaves the anchor untouched.
///
/// Every update rewrites the whole record: serialize to a temp file in the same directory,
///  fsync, rename over the old record, fsync the directory. The on-disk state is therefore
///  always either the previous or the new value, never a partial write.
pub struct SessionMemory {
    path: PathBuf,
    /// signature and index of the newest delivered product
    last_delivery: Option<([u8; 16], u32)>,
    missed: VecDeque<u32>,
    max_missed: usize,
}

impl SessionMemory {
    pub fn open(dir: &Path, source_id: &str, feed: &str, max_missed: usize) -> anyhow::Result<SessionMemory> {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating session memory directory {:?}", dir))?;

        let path = dir.join(format!("{}_{}.state", sanitize(source_id), sanitize(feed)));

        let mut memory = SessionMemory {
            path,
            last_delivery: None,
            missed: VecDeque::new(),
            max_missed,
        };

        match fs::read(&memory.path) {
            Ok(raw) => {
                memory.load(&raw)?;
                debug!("loaded session memory from {:?}: last signature {}, {} missed indices",
                       memory.path, memory.last_delivery.is_some(), memory.missed.len());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no session memory at {:?} - starting fresh", memory.path);
            }
            Err(e) => return Err(e).with_context(|| format!("reading session memory {:?}", memory.path)),
        }

        Ok(memory)
    }

    pub fn last_signature(&self) -> Option<[u8; 16]> {
        self.last_delivery.map(|(signature, _)| signature)
    }

    /// Atomically replaces the last-delivered signature. The anchor only ever advances:
    ///  completions arriving out of index order (a repaired product finishing after its
    ///  successors) never rewrite it backwards, and it is never cleared.
    pub fn set_last_signature(&mut self, signature: [u8; 16], prod_index: u32) -> anyhow::Result<()> {
        if let Some((last_signature, last_index)) = self.last_delivery {
            if last_signature == signature && last_index == prod_index {
                return Ok(());
            }
            if !index_is_ahead(prod_index, last_index, INDEX_HALF_SPACE) {
                debug!("product #{} completed after its successor #{} - keeping the newer signature", prod_index, last_index);
                return Ok(());
            }
        }
        self.last_delivery = Some((signature, prod_index));
        self.persist()
    }

    pub fn enqueue_missed(&mut self, prod_index: u32) -> anyhow::Result<()> {
        if self.missed.contains(&prod_index) {
            return Ok(());
        }
        if self.missed.len() == self.max_missed {
            let dropped = self.missed.pop_front();
            warn!("missed-index queue is full, dropping oldest entry {:?}", dropped);
        }
        self.missed.push_back(prod_index);
        self.persist()
    }

    pub fn dequeue_missed(&mut self) -> anyhow::Result<Option<u32>> {
        match self.missed.pop_front() {
            None => Ok(None),
            Some(prod_index) => {
                self.persist()?;
                Ok(Some(prod_index))
            }
        }
    }

    /// Removes an index once its request has actually been written to the sender.
    pub fn remove_missed(&mut self, prod_index: u32) -> anyhow::Result<()> {
        let len_before = self.missed.len();
        self.missed.retain(|i| *i != prod_index);
        if self.missed.len() == len_before {
            return Ok(());
        }
        self.persist()
    }

    pub fn num_missed(&self) -> usize {
        self.missed.len()
    }

    fn load(&mut self, raw: &[u8]) -> anyhow::Result<()> {
        let mut buf = raw;

        if buf.len() < MAGIC.len() || &buf[..MAGIC.len()] != MAGIC {
            bail!("session memory {:?} has an unrecognized format", self.path);
        }
        buf.advance(MAGIC.len());

        self.last_delivery = match buf.try_get_u8()? {
            0 => None,
            1 => {
                let mut signature = [0u8; 16];
                if buf.remaining() < signature.len() {
                    bail!("session memory {:?} is truncated", self.path);
                }
                buf.copy_to_slice(&mut signature);
                let prod_index = buf.try_get_u32()?;
                Some((signature, prod_index))
            }
            other => bail!("session memory {:?}: invalid signature marker {}", self.path, other),
        };

        let num_missed = buf.try_get_u32()? as usize;
        self.missed.clear();
        for _ in 0..num_missed {
            self.missed.push_back(buf.try_get_u32()?);
        }

        Ok(())
    }

    fn persist(&self) -> anyhow::Result<()> {
        let mut buf = BytesMut::new();
        buf.put_slice(MAGIC);
        match &self.last_delivery {
            None => buf.put_u8(0),
            Some((signature, prod_index)) => {
                buf.put_u8(1);
                buf.put_slice(signature);
                buf.put_u32(*prod_index);
            }
        }
        buf.put_u32(self.missed.len().prechecked_cast());
        for prod_index in &self.missed {
            buf.put_u32(*prod_index);
        }

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("creating {:?}", tmp_path))?;
            std::io::Write::write_all(&mut file, &buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("replacing {:?}", self.path))?;

        // make the rename itself durable where the platform supports syncing a directory
        if let Some(dir) = self.path.parent() {
            if let Ok(dir_file) = fs::File::open(dir) {
                dir_file.sync_all().ok();
            }
        }

        Ok(())
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_memory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let memory = SessionMemory::open(dir.path(), "10.0.0.1:38800", "wx/grib2", 16).unwrap();
        assert_eq!(memory.last_signature(), None);
        assert_eq!(memory.num_missed(), 0);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let mut memory = SessionMemory::open(dir.path(), "sender", "feed", 16).unwrap();
        memory.set_last_signature([3; 16], 3).unwrap();
        memory.enqueue_missed(8).unwrap();
        memory.enqueue_missed(9).unwrap();
        drop(memory);

        let mut memory = SessionMemory::open(dir.path(), "sender", "feed", 16).unwrap();
        assert_eq!(memory.last_signature(), Some([3; 16]));
        assert_eq!(memory.dequeue_missed().unwrap(), Some(8));
        assert_eq!(memory.dequeue_missed().unwrap(), Some(9));
        assert_eq!(memory.dequeue_missed().unwrap(), None);
    }

    #[test]
    fn test_dequeue_is_durable() {
        let dir = tempfile::tempdir().unwrap();

        let mut memory = SessionMemory::open(dir.path(), "sender", "feed", 16).unwrap();
        memory.enqueue_missed(8).unwrap();
        memory.enqueue_missed(9).unwrap();
        assert_eq!(memory.dequeue_missed().unwrap(), Some(8));
        drop(memory);

        // the dequeued entry must not come back after a crash
        let mut memory = SessionMemory::open(dir.path(), "sender", "feed", 16).unwrap();
        assert_eq!(memory.dequeue_missed().unwrap(), Some(9));
        assert_eq!(memory.dequeue_missed().unwrap(), None);
    }

    #[test]
    fn test_remove_missed() {
        let dir = tempfile::tempdir().unwrap();

        let mut memory = SessionMemory::open(dir.path(), "sender", "feed", 16).unwrap();
        memory.enqueue_missed(8).unwrap();
        memory.enqueue_missed(9).unwrap();
        memory.remove_missed(8).unwrap();
        memory.remove_missed(100).unwrap();
        drop(memory);

        let mut memory = SessionMemory::open(dir.path(), "sender", "feed", 16).unwrap();
        assert_eq!(memory.dequeue_missed().unwrap(), Some(9));
        assert_eq!(memory.dequeue_missed().unwrap(), None);
    }

    #[test]
    fn test_missed_queue_is_bounded() {
        let dir = tempfile::tempdir().unwrap();

        let mut memory = SessionMemory::open(dir.path(), "sender", "feed", 3).unwrap();
        for prod_index in 0..5 {
            memory.enqueue_missed(prod_index).unwrap();
        }
        assert_eq!(memory.num_missed(), 3);
        // the oldest entries were dropped
        assert_eq!(memory.dequeue_missed().unwrap(), Some(2));
    }

    #[test]
    fn test_duplicate_missed_index_is_kept_once() {
        let dir = tempfile::tempdir().unwrap();

        let mut memory = SessionMemory::open(dir.path(), "sender", "feed", 16).unwrap();
        memory.enqueue_missed(8).unwrap();
        memory.enqueue_missed(8).unwrap();
        assert_eq!(memory.num_missed(), 1);
    }

    #[test]
    fn test_signature_only_advances() {
        let dir = tempfile::tempdir().unwrap();

        let mut memory = SessionMemory::open(dir.path(), "sender", "feed", 16).unwrap();
        memory.set_last_signature([10; 16], 10).unwrap();
        // product 9 was repaired over TCP and completed after its successor
        memory.set_last_signature([9; 16], 9).unwrap();
        assert_eq!(memory.last_signature(), Some([10; 16]));
        drop(memory);

        // the older signature must not have reached the disk either
        let mut memory = SessionMemory::open(dir.path(), "sender", "feed", 16).unwrap();
        assert_eq!(memory.last_signature(), Some([10; 16]));

        memory.set_last_signature([11; 16], 11).unwrap();
        assert_eq!(memory.last_signature(), Some([11; 16]));
    }

    #[test]
    fn test_signature_advances_across_index_wrap() {
        let dir = tempfile::tempdir().unwrap();

        let mut memory = SessionMemory::open(dir.path(), "sender", "feed", 16).unwrap();
        memory.set_last_signature([1; 16], u32::MAX - 1).unwrap();
        // the index space wrapped: 2 is ahead of u32::MAX - 1
        memory.set_last_signature([2; 16], 2).unwrap();
        assert_eq!(memory.last_signature(), Some([2; 16]));
    }

    #[test]
    fn test_no_temp_residue() {
        let dir = tempfile::tempdir().unwrap();

        let mut memory = SessionMemory::open(dir.path(), "sender", "feed", 16).unwrap();
        memory.set_last_signature([1; 16], 1).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].ends_with(".state"));
    }

    #[test]
    fn test_corrupt_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut memory = SessionMemory::open(dir.path(), "sender", "feed", 16).unwrap();
        memory.set_last_signature([1; 16], 1).unwrap();
        let path = memory.path.clone();
        drop(memory);

        fs::write(&path, b"garbage").unwrap();
        assert!(SessionMemory::open(dir.path(), "sender", "feed", 16).is_err());
    }

    #[test]
    fn test_signatures_of_distinct_feeds_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();

        let mut a = SessionMemory::open(dir.path(), "sender", "feed-a", 16).unwrap();
        let mut b = SessionMemory::open(dir.path(), "sender", "feed-b", 16).unwrap();
        a.set_last_signature([1; 16], 1).unwrap();
        b.set_last_signature([2; 16], 2).unwrap();

        let a = SessionMemory::open(dir.path(), "sender", "feed-a", 16).unwrap();
        assert_eq!(a.last_signature(), Some([1; 16]));
    }
}
