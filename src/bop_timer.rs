use rustc_hash::FxHashMap;
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

/// What a deadline is waiting for.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum WaitKind {
    /// the opening marker of a product whose index was seen only as a gap
    Bop,
    /// the closing marker of a product whose blocks are all present
    Eop,
}

/// Deadline bookkeeping for products whose BOP (or trailing EOP) has not been seen yet.
///
/// A BOP deadline is armed when a gap in the product indices is detected; if the
///  (retransmitted) BOP arrives in time the deadline is cancelled, otherwise the product is
///  given up. An EOP deadline is armed when a product is complete except for its closing
///  marker - the marker is normally in flight right behind the last block, so the wait is one
///  round trip before a retransmission is requested.
///
/// This type only tracks deadlines - expiry handling is driven by whoever awaits
///  [`next_expired`](BopTimer::next_expired).
///
/// NB: There is exactly one consumer of expirations per session; schedule/cancel may be called
///  from any task.
pub struct BopTimer {
    deadlines: Mutex<FxHashMap<(u32, WaitKind), Instant>>,
    changed: Notify,
}

impl BopTimer {
    pub fn new() -> BopTimer {
        BopTimer {
            deadlines: Mutex::new(FxHashMap::default()),
            changed: Notify::new(),
        }
    }

    /// Arms a deadline. A product that already has an earlier deadline of the same kind
    ///  keeps it.
    pub fn schedule(&self, prod_index: u32, kind: WaitKind, deadline: Instant) {
        let mut deadlines = self.deadlines.lock().unwrap();
        let entry = deadlines.entry((prod_index, kind)).or_insert(deadline);
        if deadline < *entry {
            *entry = deadline;
        }
        trace!("armed {:?} deadline for product #{}", kind, prod_index);
        drop(deadlines);

        self.changed.notify_one();
    }

    /// Disarms a deadline, typically because the awaited packet arrived. Unknown indices are
    ///  ignored.
    pub fn cancel(&self, prod_index: u32, kind: WaitKind) {
        let was_armed = self.deadlines.lock().unwrap().remove(&(prod_index, kind)).is_some();
        if was_armed {
            trace!("cancelled {:?} deadline for product #{}", kind, prod_index);
            self.changed.notify_one();
        }
    }

    pub fn cancel_all_for(&self, prod_index: u32) {
        self.deadlines.lock().unwrap().retain(|(index, _), _| *index != prod_index);
        self.changed.notify_one();
    }

    /// Waits until some deadline passes and returns what expired, removing the deadline.
    pub async fn next_expired(&self) -> (u32, WaitKind) {
        loop {
            let earliest = self.earliest();

            match earliest {
                None => self.changed.notified().await,
                Some((key, deadline)) => {
                    tokio::select! {
                        _ = sleep_until(deadline) => {
                            // the deadline may have been cancelled or tightened while sleeping
                            let mut deadlines = self.deadlines.lock().unwrap();
                            if deadlines.get(&key).map(|d| *d <= Instant::now()).unwrap_or(false) {
                                deadlines.remove(&key);
                                debug!("{:?} deadline expired for product #{}", key.1, key.0);
                                return key;
                            }
                        }
                        _ = self.changed.notified() => {}
                    }
                }
            }
        }
    }

    fn earliest(&self) -> Option<((u32, WaitKind), Instant)> {
        self.deadlines.lock().unwrap()
            .iter()
            .min_by_key(|(_, deadline)| **deadline)
            .map(|(key, deadline)| (*key, *deadline))
    }

    pub fn clear(&self) {
        self.deadlines.lock().unwrap().clear();
        self.changed.notify_one();
    }
}

impl Default for BopTimer {
    fn default() -> Self {
        Self::new()
    }
}
