//! The place where one reception session comes together: the state shared by all worker tasks,
//!  the dispatch logic for arriving packets (on either path), and the harness that spawns and
//!  stops the workers.
//!
//! All per-product bookkeeping lives behind one lock ([`SessionState`]); dispatch for a single
//!  product index is therefore serial, while the multicast and the retransmission path may
//!  interleave freely across indices. Requests are pushed onto the queue while holding that
//!  lock (pushing never blocks); durable session-memory updates and calls into the receiving
//!  application happen outside it.

use crate::bop_timer::{BopTimer, WaitKind};
use crate::config::DownstreamConfig;
use crate::notifier::{CompletedProduct, DeliveryFailure, ProductQueue, RecvNotifier};
use crate::product_tracker::{RecordOutcome, TrackerMap};
use crate::request_queue::{RequestQueue, RequestQueueReceiver};
use crate::rtt::RttEstimator;
use crate::session_memory::SessionMemory;
use crate::wire::{index_is_ahead, BopMessage, FmtpHeader, RequestMessage};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// How a worker task (and ultimately a whole session iteration) ended.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SessionOutcome {
    /// `stop()` was requested - a clean end, not an error
    Shutdown,
    /// a socket failed; the session is aborted and retried after a nap
    TransientIo(String),
    /// the sender refused the subscription - retrying will not help
    SubscriptionRefused(String),
    /// an unrecoverable local error
    SystemError(String),
}

impl SessionOutcome {
    fn severity(&self) -> u8 {
        match self {
            SessionOutcome::Shutdown => 0,
            SessionOutcome::TransientIo(_) => 1,
            SessionOutcome::SubscriptionRefused(_) => 2,
            SessionOutcome::SystemError(_) => 3,
        }
    }

    pub fn worst(self, other: SessionOutcome) -> SessionOutcome {
        if other.severity() > self.severity() {
            other
        }
        else {
            self
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WorkerKind {
    McastReader,
    RetxRequester,
    RetxReceiver,
    BopTimer,
}

/// Mutable per-session bookkeeping, everything guarded by one lock.
struct SessionState {
    trackers: TrackerMap,
    /// indices whose BOP was never seen; placeholders until the retransmitted BOP arrives
    missing_bop: FxHashSet<u32>,
    /// EOP arrival per index - kept outside the trackers so that an EOP arriving before its
    ///  BOP is not lost
    eop_seen: FxHashMap<u32, bool>,
    /// products given up on; their late packets are dropped silently
    aborted: FxHashSet<u32>,
    /// highest index for which a BOP was accepted or a placeholder registered
    last_index: Option<u32>,
    /// when the first retransmission request per product was written, for the RTT estimate
    request_sent_at: FxHashMap<u32, Instant>,
}

/// Everything the worker tasks of one session share. Workers hold an `Arc` of this plus the
///  handles they need (queue receiver, socket halves) - no worker holds a supervisor
///  reference.
pub(crate) struct SessionShared {
    pub config: Arc<DownstreamConfig>,
    pub notifier: Arc<dyn RecvNotifier>,
    pub product_queue: Arc<dyn ProductQueue>,
    pub memory: Arc<Mutex<SessionMemory>>,
    pub queue: RequestQueue,
    pub timer: BopTimer,
    rtt: std::sync::Mutex<RttEstimator>,
    state: Mutex<SessionState>,
    /// fires once, with the signature of the first multicast BOP, to trigger the backlog
    ///  request
    first_arrival: std::sync::Mutex<Option<oneshot::Sender<[u8; 16]>>>,
}

impl SessionShared {
    pub fn new(
        config: Arc<DownstreamConfig>,
        notifier: Arc<dyn RecvNotifier>,
        product_queue: Arc<dyn ProductQueue>,
        memory: Arc<Mutex<SessionMemory>>,
        queue: RequestQueue,
        first_arrival: oneshot::Sender<[u8; 16]>,
    ) -> SessionShared {
        let rtt = RttEstimator::new(config.initial_rtt, config.bop_timeout_multiplier, config.link_speed_bits_per_sec);

        SessionShared {
            config,
            notifier,
            product_queue,
            memory,
            queue,
            timer: BopTimer::new(),
            rtt: std::sync::Mutex::new(rtt),
            state: Mutex::new(SessionState {
                trackers: TrackerMap::default(),
                missing_bop: FxHashSet::default(),
                eop_seen: FxHashMap::default(),
                aborted: FxHashSet::default(),
                last_index: None,
                request_sent_at: FxHashMap::default(),
            }),
            first_arrival: std::sync::Mutex::new(Some(first_arrival)),
        }
    }

    fn bop_timeout_deadline(&self) -> Instant {
        Instant::now() + self.rtt.lock().unwrap().bop_timeout()
    }

    /// A BOP arrived, on either path. Creates the tracker, resolves the placeholder, detects
    ///  index gaps, and possibly fires the backlog trigger.
    pub async fn handle_bop(&self, header: &FmtpHeader, bop: &BopMessage, via_retx: bool) {
        let prod_index = header.prod_index;

        // cheap pre-checks before involving the receiving application
        {
            let state = self.state.lock().await;
            if state.aborted.contains(&prod_index) {
                debug!("BOP for aborted product #{} - dropping", prod_index);
                return;
            }
            if state.trackers.contains(prod_index) {
                trace!("BOP for already tracked product #{} - dropping", prod_index);
                return;
            }
            if !via_retx && !state.missing_bop.contains(&prod_index) {
                if let Some(last) = state.last_index {
                    if !index_is_ahead(prod_index, last, self.config.recency_window) {
                        debug!("BOP for already seen product #{} - dropping", prod_index);
                        return;
                    }
                }
            }
        }

        let buffer = match self.notifier.on_bop(prod_index, bop.total_size, bop.signature, &bop.metadata).await {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!("receiving application rejected product #{}: {:#}", prod_index, e);
                self.discard_product_state(prod_index).await;
                return;
            }
        };

        let mut completed = None;
        let mut gap_indices = Vec::new();
        {
            let mut state = self.state.lock().await;

            // the other path may have created the tracker while the notifier ran
            if state.trackers.contains(prod_index) {
                trace!("BOP for product #{} raced its duplicate - dropping", prod_index);
                return;
            }

            let was_awaited = state.missing_bop.remove(&prod_index);
            if via_retx && !was_awaited {
                debug!("retransmitted BOP for product #{} outside the missing set - accepting as missed-product delivery", prod_index);
            }
            self.timer.cancel(prod_index, WaitKind::Bop);

            let eop_already_seen = state.eop_seen.get(&prod_index) == Some(&true);

            if let Err(e) = state.trackers.create(prod_index, bop, buffer) {
                warn!("cannot track product #{}: {:#}", prod_index, e);
                state.aborted.insert(prod_index);
                return;
            }
            let tracker = state.trackers.get_mut(prod_index).expect("just created");
            if via_retx {
                tracker.mark_repaired();
            }

            if eop_already_seen {
                // the whole product was multicast before we could follow it: request every block
                tracker.mark_eop();
                let missing: Vec<_> = tracker.missing_all().collect();
                for (seq_num, data_len) in missing {
                    tracker.note_retx_request();
                    self.queue.push(RequestMessage::MissingData { prod_index, seq_num, data_len });
                }
            }
            state.eop_seen.insert(prod_index, eop_already_seen);

            debug!("now tracking product #{} ({} bytes, {:?})", prod_index, bop.total_size, bop.metadata);

            // gap detection: everything between the previous front and this BOP is missing
            if let Some(last) = state.last_index {
                if index_is_ahead(prod_index, last, self.config.recency_window) {
                    let cap = self.config.max_persisted_missed as u32;
                    let gap_len = prod_index.wrapping_sub(last) - 1;
                    let mut i = if gap_len > cap {
                        warn!("gap of {} products before #{} - requesting only the most recent {}", gap_len, prod_index, cap);
                        prod_index.wrapping_sub(cap)
                    }
                    else {
                        last.wrapping_add(1)
                    };
                    while i != prod_index {
                        if !state.trackers.contains(i) && !state.missing_bop.contains(&i) && !state.aborted.contains(&i) {
                            gap_indices.push(i);
                        }
                        i = i.wrapping_add(1);
                    }
                    state.last_index = Some(prod_index);
                }
            }
            else {
                state.last_index = Some(prod_index);
            }

            self.register_missing(&mut state, &gap_indices);

            if state.trackers.get(prod_index).map(|t| t.is_complete()).unwrap_or(false) {
                completed = self.take_completed(&mut state, prod_index);
            }
        }

        if !via_retx {
            if let Some(tx) = self.first_arrival.lock().unwrap().take() {
                tx.send(bop.signature).ok();
            }
        }

        self.persist_missing(&gap_indices).await;

        if let Some((product, repaired)) = completed {
            self.deliver_product(product, repaired).await;
        }
    }

    /// A data block arrived, on either path.
    pub async fn handle_data(&self, header: &FmtpHeader, payload: &[u8], via_retx: bool) {
        let prod_index = header.prod_index;
        let seq_num = header.seq_num;

        let mut completed = None;
        let mut register = Vec::new();
        {
            let mut state = self.state.lock().await;
            if state.aborted.contains(&prod_index) {
                trace!("data for aborted product #{} - dropping", prod_index);
                return;
            }

            if !state.trackers.contains(prod_index) {
                if via_retx {
                    warn!("retransmitted data for unknown product #{} - dropping", prod_index);
                    return;
                }
                if state.missing_bop.contains(&prod_index) {
                    trace!("data for product #{} whose BOP is already being requested - dropping", prod_index);
                    return;
                }

                // data without a BOP is unusable, but it tells us the product exists
                let plausible = match state.last_index {
                    None => true,
                    Some(last) => index_is_ahead(prod_index, last, self.config.recency_window),
                };
                if plausible {
                    register.push(prod_index);
                    self.register_missing(&mut state, &register);
                }
                else {
                    debug!("data for stale product #{} - dropping", prod_index);
                }
            }
            else {
                let timeout_deadline = self.bop_timeout_deadline();
                let tracker = state.trackers.get_mut(prod_index).expect("checked above");

                let prev_highest = tracker.highest_seq();
                let was_full = tracker.missing_all().next().is_none();

                match tracker.record_block(seq_num, payload) {
                    RecordOutcome::OutOfRange => {
                        warn!("block at {}+{} does not fit product #{} - dropping", seq_num, payload.len(), prod_index);
                        return;
                    }
                    RecordOutcome::Duplicate => {
                        trace!("block at {} for product #{} arrived twice - second one ignored", seq_num, prod_index);
                    }
                    RecordOutcome::First => {
                        if via_retx {
                            tracker.mark_repaired();
                        }
                        else {
                            // everything skipped over between the previous front and this block
                            //  is missing on the multicast path
                            let missing: Vec<_> = tracker.missing_before(seq_num)
                                .filter(|(s, _)| prev_highest.map(|h| *s > h).unwrap_or(true))
                                .collect();
                            for (seq_num, data_len) in missing {
                                tracker.note_retx_request();
                                self.queue.push(RequestMessage::MissingData { prod_index, seq_num, data_len });
                            }
                        }

                        if !was_full && !tracker.eop_received() && tracker.missing_all().next().is_none() {
                            // all blocks are in; give the closing marker one timeout to show up
                            self.timer.schedule(prod_index, WaitKind::Eop, timeout_deadline);
                        }
                    }
                }

                if via_retx {
                    if let Some(sent_at) = state.request_sent_at.remove(&prod_index) {
                        self.rtt.lock().unwrap().add_sample(sent_at.elapsed());
                    }
                }

                if state.trackers.get(prod_index).map(|t| t.is_complete()).unwrap_or(false) {
                    completed = self.take_completed(&mut state, prod_index);
                }
            }
        }

        self.persist_missing(&register).await;

        if let Some((product, repaired)) = completed {
            self.deliver_product(product, repaired).await;
        }
    }

    /// An EOP arrived, on either path.
    pub async fn handle_eop(&self, header: &FmtpHeader, via_retx: bool) {
        let prod_index = header.prod_index;

        let mut completed = None;
        let mut register = Vec::new();
        {
            let mut state = self.state.lock().await;
            if state.aborted.contains(&prod_index) {
                trace!("EOP for aborted product #{} - dropping", prod_index);
                return;
            }

            state.eop_seen.insert(prod_index, true);

            if let Some(tracker) = state.trackers.get_mut(prod_index) {
                tracker.mark_eop();
                if via_retx {
                    tracker.mark_repaired();
                }
                self.timer.cancel(prod_index, WaitKind::Eop);

                if tracker.is_complete() {
                    completed = self.take_completed(&mut state, prod_index);
                }
            }
            else if !via_retx && !state.missing_bop.contains(&prod_index) {
                let plausible = match state.last_index {
                    None => true,
                    Some(last) => index_is_ahead(prod_index, last, self.config.recency_window),
                };
                if plausible {
                    register.push(prod_index);
                    self.register_missing(&mut state, &register);
                }
            }
            else if via_retx && !state.trackers.contains(prod_index) {
                warn!("retransmitted EOP for unknown product #{} - dropping", prod_index);
            }
        }

        self.persist_missing(&register).await;

        if let Some((product, repaired)) = completed {
            self.deliver_product(product, repaired).await;
        }
    }

    /// The sender declared the product unrecoverable.
    pub async fn handle_reject(&self, prod_index: u32) {
        info!("sender rejected retransmission of product #{}", prod_index);
        self.abort_product(prod_index, DeliveryFailure::SenderRejected).await;
    }

    /// A BOP deadline fired: the product is lost.
    pub async fn on_bop_deadline(&self, prod_index: u32) {
        self.abort_product(prod_index, DeliveryFailure::BopTimeout).await;
    }

    /// An EOP deadline fired: all blocks are present but the closing marker never came.
    pub async fn on_eop_deadline(&self, prod_index: u32) {
        let mut state = self.state.lock().await;
        if let Some(tracker) = state.trackers.get_mut(prod_index) {
            if !tracker.eop_received() {
                debug!("product #{} is complete except for its EOP - requesting it", prod_index);
                tracker.note_retx_request();
                self.queue.push(RequestMessage::MissingEop { prod_index });
            }
        }
    }

    /// Called by the requester once a request has actually been written to the sender.
    pub async fn note_request_written(&self, request: &RequestMessage) {
        let prod_index = request.prod_index();

        if !matches!(request, RequestMessage::RetxEnd { .. }) {
            let mut state = self.state.lock().await;
            state.request_sent_at.entry(prod_index).or_insert_with(Instant::now);
        }

        if matches!(request, RequestMessage::MissingBop { .. }) {
            // the index is no longer "detected but not requested"
            if let Err(e) = self.memory.lock().await.remove_missed(prod_index) {
                warn!("cannot update session memory for product #{}: {:#}", prod_index, e);
            }
        }
    }

    /// Gives up on a product: all state is removed, late packets will be dropped, the
    ///  receiving application is told.
    pub async fn abort_product(&self, prod_index: u32, reason: DeliveryFailure) {
        let had_state = {
            let mut state = self.state.lock().await;
            let had_placeholder = state.missing_bop.remove(&prod_index);
            let had_tracker = state.trackers.remove(prod_index).is_some();
            state.eop_seen.remove(&prod_index);
            state.request_sent_at.remove(&prod_index);
            state.aborted.insert(prod_index);
            had_placeholder || had_tracker
        };
        self.timer.cancel_all_for(prod_index);

        if let Err(e) = self.memory.lock().await.remove_missed(prod_index) {
            warn!("cannot update session memory for product #{}: {:#}", prod_index, e);
        }

        if had_state {
            warn!("giving up on product #{}: {:?}", prod_index, reason);
            self.notifier.on_delivery_failed(prod_index, reason).await;
        }
    }

    /// Removes all bookkeeping for a product without notifying anyone - for products the
    ///  receiving application itself refused.
    async fn discard_product_state(&self, prod_index: u32) {
        {
            let mut state = self.state.lock().await;
            state.missing_bop.remove(&prod_index);
            state.eop_seen.remove(&prod_index);
            state.aborted.insert(prod_index);
        }
        self.timer.cancel_all_for(prod_index);
        if let Err(e) = self.memory.lock().await.remove_missed(prod_index) {
            warn!("cannot update session memory for product #{}: {:#}", prod_index, e);
        }
    }

    /// Reports every product the session leaves unfinished, then clears all deadline state.
    pub async fn abort_all_unfinished(&self) {
        let unfinished: Vec<u32> = {
            let mut state = self.state.lock().await;
            let mut unfinished: Vec<u32> = state.trackers.drain().map(|(prod_index, _)| prod_index).collect();
            unfinished.extend(state.missing_bop.drain());
            state.eop_seen.clear();
            state.request_sent_at.clear();
            unfinished
        };
        self.timer.clear();

        for prod_index in unfinished {
            self.notifier.on_delivery_failed(prod_index, DeliveryFailure::SessionEnded).await;
        }
    }

    /// Registers placeholders for products known only by their index: request their BOP, arm
    ///  the deadline. Durable persistence happens separately, outside the state lock.
    fn register_missing(&self, state: &mut SessionState, prod_indices: &[u32]) {
        let deadline = self.bop_timeout_deadline();
        for prod_index in prod_indices {
            debug!("BOP of product #{} is missing - requesting it", prod_index);
            state.missing_bop.insert(*prod_index);
            self.queue.push(RequestMessage::MissingBop { prod_index: *prod_index });
            self.timer.schedule(*prod_index, WaitKind::Bop, deadline);
        }
    }

    async fn persist_missing(&self, prod_indices: &[u32]) {
        if prod_indices.is_empty() {
            return;
        }
        let mut memory = self.memory.lock().await;
        for prod_index in prod_indices {
            if let Err(e) = memory.enqueue_missed(*prod_index) {
                warn!("cannot persist missed product #{}: {:#}", prod_index, e);
            }
        }
    }

    fn take_completed(&self, state: &mut SessionState, prod_index: u32) -> Option<(CompletedProduct, bool)> {
        let repaired = state.trackers.get(prod_index).map(|t| t.was_repaired()).unwrap_or(false);
        let product = state.trackers.finalize(prod_index)?;

        state.eop_seen.remove(&prod_index);
        state.request_sent_at.remove(&prod_index);
        self.timer.cancel_all_for(prod_index);

        Some((product, repaired))
    }

    async fn deliver_product(&self, product: CompletedProduct, repaired: bool) {
        let prod_index = product.prod_index;
        let signature = product.signature;
        info!("product #{} complete ({} bytes) - handing it to the product queue", prod_index, product.data.len());

        if repaired {
            self.queue.push(RequestMessage::RetxEnd { prod_index });
        }

        if let Err(e) = self.product_queue.insert(product).await {
            warn!("product queue rejected product #{}: {:#}", prod_index, e);
            return;
        }

        if let Err(e) = self.memory.lock().await.set_last_signature(signature, prod_index) {
            warn!("cannot persist last signature after product #{}: {:#}", prod_index, e);
        }
    }

    #[cfg(test)]
    async fn tracked(&self, prod_index: u32) -> bool {
        self.state.lock().await.trackers.contains(prod_index)
    }

    #[cfg(test)]
    async fn is_missing_bop(&self, prod_index: u32) -> bool {
        self.state.lock().await.missing_bop.contains(&prod_index)
    }
}

/// The worker tasks of one session iteration plus the channel their terminal outcomes arrive
///  on. The supervisor waits on that channel and stops the set when the first worker dies.
pub(crate) struct WorkerSet {
    pub completion_rx: mpsc::UnboundedReceiver<(WorkerKind, SessionOutcome)>,
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerSet {
    pub fn spawn(
        shared: Arc<SessionShared>,
        mcast_socket: UdpSocket,
        retx_stream: TcpStream,
        queue_rx: RequestQueueReceiver,
    ) -> WorkerSet {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (retx_read, retx_write) = retx_stream.into_split();

        let handles = vec![
            spawn_worker(WorkerKind::McastReader, completion_tx.clone(),
                         crate::mcast_receiver::run(mcast_socket, shared.clone(), shutdown_rx.clone())),
            spawn_worker(WorkerKind::RetxRequester, completion_tx.clone(),
                         crate::retx_requester::run(retx_write, queue_rx, shared.clone())),
            spawn_worker(WorkerKind::RetxReceiver, completion_tx.clone(),
                         crate::retx_receiver::run(retx_read, shared.clone(), shutdown_rx.clone())),
            spawn_worker(WorkerKind::BopTimer, completion_tx,
                         run_timer(shared, shutdown_rx)),
        ];

        WorkerSet {
            completion_rx,
            handles,
            shutdown_tx,
        }
    }

    /// Cooperative stop: signal, unblock the queue, then join everything. Safe to call after
    ///  some workers have already terminated. Returns the terminal outcomes that were still
    ///  pending on the completion channel.
    pub async fn stop(mut self, shared: &SessionShared) -> Vec<(WorkerKind, SessionOutcome)> {
        self.shutdown_tx.send(true).ok();
        shared.queue.shutdown();

        for handle in self.handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("worker ended abnormally: {:#}", e);
                }
            }
        }

        let mut outcomes = Vec::new();
        while let Ok(outcome) = self.completion_rx.try_recv() {
            outcomes.push(outcome);
        }
        outcomes
    }
}

fn spawn_worker(
    kind: WorkerKind,
    completion_tx: mpsc::UnboundedSender<(WorkerKind, SessionOutcome)>,
    work: impl std::future::Future<Output = SessionOutcome> + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let outcome = work.await;
        debug!("worker {:?} terminated: {:?}", kind, outcome);
        completion_tx.send((kind, outcome)).ok();
    })
}

/// The deadline worker: aborts products whose BOP never came, requests EOPs that never came.
async fn run_timer(shared: Arc<SessionShared>, mut shutdown_rx: watch::Receiver<bool>) -> SessionOutcome {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return SessionOutcome::Shutdown,
            expired = shared.timer.next_expired() => {
                let (prod_index, kind) = expired;
                match kind {
                    WaitKind::Bop => shared.on_bop_deadline(prod_index).await,
                    WaitKind::Eop => shared.on_eop_deadline(prod_index).await,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Flags;
    use async_trait::async_trait;
    use bytes::BytesMut;

    struct RecordingNotifier {
        failures: std::sync::Mutex<Vec<(u32, DeliveryFailure)>>,
    }

    #[async_trait]
    impl RecvNotifier for RecordingNotifier {
        async fn on_bop(&self, _prod_index: u32, total_size: u64, _signature: [u8; 16], _metadata: &str) -> anyhow::Result<BytesMut> {
            let mut buf = BytesMut::with_capacity(total_size as usize);
            buf.resize(total_size as usize, 0);
            Ok(buf)
        }

        async fn on_delivery_failed(&self, prod_index: u32, reason: DeliveryFailure) {
            self.failures.lock().unwrap().push((prod_index, reason));
        }
    }

    struct RecordingQueue {
        products: std::sync::Mutex<Vec<CompletedProduct>>,
    }

    #[async_trait]
    impl ProductQueue for RecordingQueue {
        async fn insert(&self, product: CompletedProduct) -> anyhow::Result<()> {
            self.products.lock().unwrap().push(product);
            Ok(())
        }

        async fn most_recent_signature(&self) -> Option<[u8; 16]> {
            self.products.lock().unwrap().last().map(|p| p.signature)
        }
    }

    struct Harness {
        shared: Arc<SessionShared>,
        queue_rx: crate::request_queue::RequestQueueReceiver,
        notifier: Arc<RecordingNotifier>,
        products: Arc<RecordingQueue>,
        _first_rx: oneshot::Receiver<[u8; 16]>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::DownstreamConfig::new("127.0.0.1:38800".parse().unwrap(), "test", dir.path());

        let notifier = Arc::new(RecordingNotifier { failures: Default::default() });
        let products = Arc::new(RecordingQueue { products: Default::default() });
        let memory = SessionMemory::open(dir.path(), "sender", "test", 64).unwrap();
        let (queue, queue_rx) = RequestQueue::new();
        let (first_tx, first_rx) = oneshot::channel();

        let shared = Arc::new(SessionShared::new(
            Arc::new(config),
            notifier.clone(),
            products.clone(),
            Arc::new(Mutex::new(memory)),
            queue,
            first_tx,
        ));

        Harness {
            shared,
            queue_rx,
            notifier,
            products,
            _first_rx: first_rx,
            _dir: dir,
        }
    }

    fn bop_header(prod_index: u32, retx: bool) -> FmtpHeader {
        FmtpHeader {
            prod_index,
            seq_num: 0,
            payload_len: 0,
            flags: if retx { Flags::BOP | Flags::RETX_DATA } else { Flags::BOP },
        }
    }

    fn data_header(prod_index: u32, seq_num: u32, len: u16, retx: bool) -> FmtpHeader {
        FmtpHeader {
            prod_index,
            seq_num,
            payload_len: len,
            flags: if retx { Flags::RETX_DATA } else { Flags::empty() },
        }
    }

    fn eop_header(prod_index: u32, retx: bool) -> FmtpHeader {
        FmtpHeader {
            prod_index,
            seq_num: 0,
            payload_len: 0,
            flags: if retx { Flags::EOP | Flags::RETX_DATA } else { Flags::EOP },
        }
    }

    fn bop(signature_byte: u8) -> BopMessage {
        BopMessage {
            total_size: 3000,
            signature: [signature_byte; 16],
            payload_len: 1200,
            metadata: "test-product".to_string(),
        }
    }

    #[tokio::test]
    async fn test_perfect_delivery_sends_no_requests() {
        let mut h = harness();

        h.shared.handle_bop(&bop_header(7, false), &bop(7), false).await;
        h.shared.handle_data(&data_header(7, 0, 1200, false), &[1; 1200], false).await;
        h.shared.handle_data(&data_header(7, 1200, 1200, false), &[2; 1200], false).await;
        h.shared.handle_data(&data_header(7, 2400, 600, false), &[3; 600], false).await;
        h.shared.handle_eop(&eop_header(7, false), false).await;

        let products = h.products.products.lock().unwrap();
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].prod_index, 7);
        assert_eq!(&products[0].data[..1200], &[1; 1200][..]);
        assert_eq!(&products[0].data[2400..], &[3; 600][..]);
        drop(products);

        assert_eq!(h.queue_rx.try_recv(), None);
        assert!(!h.shared.tracked(7).await);
    }

    #[tokio::test]
    async fn test_missing_interior_block_is_requested_and_repaired() {
        let mut h = harness();

        h.shared.handle_bop(&bop_header(7, false), &bop(7), false).await;
        h.shared.handle_data(&data_header(7, 0, 1200, false), &[1; 1200], false).await;
        // seq 1200 is dropped on the multicast path
        h.shared.handle_data(&data_header(7, 2400, 600, false), &[3; 600], false).await;

        assert_eq!(h.queue_rx.try_recv(), Some(RequestMessage::MissingData { prod_index: 7, seq_num: 1200, data_len: 1200 }));
        assert_eq!(h.queue_rx.try_recv(), None);

        h.shared.handle_eop(&eop_header(7, false), false).await;
        assert!(h.products.products.lock().unwrap().is_empty());

        h.shared.handle_data(&data_header(7, 1200, 1200, true), &[2; 1200], true).await;

        let products = h.products.products.lock().unwrap();
        assert_eq!(products.len(), 1);
        assert_eq!(&products[0].data[1200..2400], &[2; 1200][..]);
        drop(products);

        // the sender is told it can free its retransmission state
        assert_eq!(h.queue_rx.try_recv(), Some(RequestMessage::RetxEnd { prod_index: 7 }));
    }

    #[tokio::test]
    async fn test_duplicate_arrival_on_both_paths_is_idempotent() {
        let mut h = harness();

        h.shared.handle_bop(&bop_header(7, false), &bop(7), false).await;
        h.shared.handle_data(&data_header(7, 0, 1200, false), &[1; 1200], false).await;
        h.shared.handle_data(&data_header(7, 2400, 600, false), &[3; 600], false).await;
        assert_eq!(h.queue_rx.try_recv(), Some(RequestMessage::MissingData { prod_index: 7, seq_num: 1200, data_len: 1200 }));

        // the block arrives via retransmission first, then late via multicast
        h.shared.handle_data(&data_header(7, 1200, 1200, true), &[2; 1200], true).await;
        h.shared.handle_data(&data_header(7, 1200, 1200, false), &[9; 1200], false).await;
        h.shared.handle_eop(&eop_header(7, false), false).await;

        let products = h.products.products.lock().unwrap();
        assert_eq!(products.len(), 1);
        // whichever arrived first won
        assert_eq!(&products[0].data[1200..2400], &[2; 1200][..]);
    }

    #[tokio::test]
    async fn test_bop_gap_registers_placeholders() {
        let mut h = harness();

        h.shared.handle_bop(&bop_header(7, false), &bop(7), false).await;
        // indices 8 and 9 were never seen: their BOPs are requested
        h.shared.handle_bop(&bop_header(10, false), &bop(10), false).await;

        assert_eq!(h.queue_rx.try_recv(), Some(RequestMessage::MissingBop { prod_index: 8 }));
        assert_eq!(h.queue_rx.try_recv(), Some(RequestMessage::MissingBop { prod_index: 9 }));
        assert!(h.shared.is_missing_bop(8).await);
        assert!(h.shared.is_missing_bop(9).await);

        // the retransmitted BOP resolves the placeholder
        h.shared.handle_bop(&bop_header(8, true), &bop(8), true).await;
        assert!(h.shared.tracked(8).await);
        assert!(!h.shared.is_missing_bop(8).await);
    }

    #[tokio::test]
    async fn test_data_without_tracker_requests_bop() {
        let mut h = harness();

        h.shared.handle_data(&data_header(12, 0, 1200, false), &[1; 1200], false).await;

        assert_eq!(h.queue_rx.try_recv(), Some(RequestMessage::MissingBop { prod_index: 12 }));
        assert!(h.shared.is_missing_bop(12).await);

        // further data for the same product does not re-request
        h.shared.handle_data(&data_header(12, 1200, 1200, false), &[2; 1200], false).await;
        assert_eq!(h.queue_rx.try_recv(), None);
    }

    #[tokio::test]
    async fn test_retx_bop_after_eop_requests_all_blocks() {
        let mut h = harness();

        // the whole product was multicast before the receiver could follow it
        h.shared.handle_eop(&eop_header(5, false), false).await;
        assert_eq!(h.queue_rx.try_recv(), Some(RequestMessage::MissingBop { prod_index: 5 }));

        h.shared.handle_bop(&bop_header(5, true), &bop(5), true).await;
        assert_eq!(h.queue_rx.try_recv(), Some(RequestMessage::MissingData { prod_index: 5, seq_num: 0, data_len: 1200 }));
        assert_eq!(h.queue_rx.try_recv(), Some(RequestMessage::MissingData { prod_index: 5, seq_num: 1200, data_len: 1200 }));
        assert_eq!(h.queue_rx.try_recv(), Some(RequestMessage::MissingData { prod_index: 5, seq_num: 2400, data_len: 600 }));

        h.shared.handle_data(&data_header(5, 0, 1200, true), &[1; 1200], true).await;
        h.shared.handle_data(&data_header(5, 1200, 1200, true), &[2; 1200], true).await;
        h.shared.handle_data(&data_header(5, 2400, 600, true), &[3; 600], true).await;

        assert_eq!(h.products.products.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_abort_drops_state_and_notifies() {
        let mut h = harness();

        h.shared.handle_data(&data_header(15, 0, 1200, false), &[1; 1200], false).await;
        assert_eq!(h.queue_rx.try_recv(), Some(RequestMessage::MissingBop { prod_index: 15 }));

        h.shared.on_bop_deadline(15).await;

        let failures = h.notifier.failures.lock().unwrap();
        assert_eq!(failures.as_slice(), &[(15, DeliveryFailure::BopTimeout)]);
        drop(failures);

        // late packets for the aborted product are dropped without new requests
        h.shared.handle_data(&data_header(15, 1200, 1200, false), &[2; 1200], false).await;
        h.shared.handle_bop(&bop_header(15, false), &bop(15), false).await;
        assert_eq!(h.queue_rx.try_recv(), None);
        assert!(!h.shared.tracked(15).await);
    }

    #[tokio::test]
    async fn test_sender_reject_aborts_product() {
        let mut h = harness();

        h.shared.handle_data(&data_header(20, 0, 1200, false), &[1; 1200], false).await;
        h.shared.handle_reject(20).await;

        let failures = h.notifier.failures.lock().unwrap();
        assert_eq!(failures.as_slice(), &[(20, DeliveryFailure::SenderRejected)]);
    }

    #[tokio::test]
    async fn test_eop_deadline_requests_missing_eop() {
        let mut h = harness();

        h.shared.handle_bop(&bop_header(12, false), &bop(12), false).await;
        h.shared.handle_data(&data_header(12, 0, 1200, false), &[1; 1200], false).await;
        h.shared.handle_data(&data_header(12, 1200, 1200, false), &[2; 1200], false).await;
        h.shared.handle_data(&data_header(12, 2400, 600, false), &[3; 600], false).await;
        // the EOP never arrives; the deadline worker fires
        h.shared.on_eop_deadline(12).await;

        assert_eq!(h.queue_rx.try_recv(), Some(RequestMessage::MissingEop { prod_index: 12 }));

        h.shared.handle_eop(&eop_header(12, true), true).await;
        assert_eq!(h.products.products.lock().unwrap().len(), 1);
        assert_eq!(h.queue_rx.try_recv(), Some(RequestMessage::RetxEnd { prod_index: 12 }));
    }

    #[tokio::test]
    async fn test_last_signature_follows_completions() {
        let h = harness();

        h.shared.handle_bop(&bop_header(7, false), &bop(7), false).await;
        h.shared.handle_data(&data_header(7, 0, 1200, false), &[1; 1200], false).await;
        h.shared.handle_data(&data_header(7, 1200, 1200, false), &[2; 1200], false).await;
        h.shared.handle_data(&data_header(7, 2400, 600, false), &[3; 600], false).await;
        h.shared.handle_eop(&eop_header(7, false), false).await;

        assert_eq!(h.shared.memory.lock().await.last_signature(), Some([7; 16]));
    }

    #[tokio::test]
    async fn test_out_of_order_completion_keeps_newest_signature() {
        let h = harness();

        // product 10 completes on the multicast path first
        h.shared.handle_bop(&bop_header(10, false), &bop(10), false).await;
        h.shared.handle_data(&data_header(10, 0, 1200, false), &[1; 1200], false).await;
        h.shared.handle_data(&data_header(10, 1200, 1200, false), &[2; 1200], false).await;
        h.shared.handle_data(&data_header(10, 2400, 600, false), &[3; 600], false).await;
        h.shared.handle_eop(&eop_header(10, false), false).await;
        assert_eq!(h.shared.memory.lock().await.last_signature(), Some([10; 16]));

        // product 9, whose BOP was lost, arrives whole over the retransmission path afterwards
        h.shared.handle_bop(&bop_header(9, true), &bop(9), true).await;
        h.shared.handle_data(&data_header(9, 0, 1200, true), &[1; 1200], true).await;
        h.shared.handle_data(&data_header(9, 1200, 1200, true), &[2; 1200], true).await;
        h.shared.handle_data(&data_header(9, 2400, 600, true), &[3; 600], true).await;
        h.shared.handle_eop(&eop_header(9, true), true).await;

        assert_eq!(h.products.products.lock().unwrap().len(), 2);
        // the backlog anchor must not move backwards to the older product
        assert_eq!(h.shared.memory.lock().await.last_signature(), Some([10; 16]));
    }

    #[tokio::test]
    async fn test_abort_all_unfinished_on_stop() {
        let h = harness();

        h.shared.handle_bop(&bop_header(7, false), &bop(7), false).await;
        h.shared.handle_data(&data_header(9, 0, 1200, false), &[1; 1200], false).await;

        h.shared.abort_all_unfinished().await;

        let mut failures: Vec<u32> = h.notifier.failures.lock().unwrap().iter().map(|(i, _)| *i).collect();
        failures.sort();
        assert_eq!(failures, vec![7, 9]);
    }
}
