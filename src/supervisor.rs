//! Lifecycle of a downstream receiver: subscribe, run one reception session, and keep
//!  retrying with a bounded nap in between until stopped or a fatal error surfaces.
//!
//! The supervisor owns the session memory and all worker tasks of the running iteration.
//!  Workers report their terminal outcomes on a channel; the first non-shutdown outcome
//!  aborts the iteration, the remaining workers are stopped cooperatively, and the worst of
//!  all outcomes decides what happens next. Product-level failures never reach this level.

use crate::config::DownstreamConfig;
use crate::control::{BacklogRequest, ControlClient, SubscribeOutcome};
use crate::mcast_receiver;
use crate::notifier::{ProductQueue, RecvNotifier};
use crate::receiver::{SessionOutcome, SessionShared, WorkerSet};
use crate::request_queue::RequestQueue;
use crate::session_memory::SessionMemory;
use anyhow::{anyhow, Context};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SupervisorState {
    Initialized,
    Executing,
    Nap,
    Stopping,
    Stopped,
}

/// Manages one downstream session's lifecycle. Create, call [`run`](Self::run) once, and call
///  [`stop`](Self::stop) from anywhere to shut down cleanly.
pub struct DownstreamSupervisor {
    config: Arc<DownstreamConfig>,
    notifier: Arc<dyn RecvNotifier>,
    product_queue: Arc<dyn ProductQueue>,

    state_tx: watch::Sender<SupervisorState>,
    state_rx: watch::Receiver<SupervisorState>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl DownstreamSupervisor {
    pub fn new(
        config: DownstreamConfig,
        notifier: Arc<dyn RecvNotifier>,
        product_queue: Arc<dyn ProductQueue>,
    ) -> anyhow::Result<DownstreamSupervisor> {
        config.validate()?;

        let (state_tx, state_rx) = watch::channel(SupervisorState::Initialized);
        let (stop_tx, stop_rx) = watch::channel(false);

        Ok(DownstreamSupervisor {
            config: Arc::new(config),
            notifier,
            product_queue,
            state_tx,
            state_rx,
            stop_tx,
            stop_rx,
        })
    }

    pub fn state(&self) -> SupervisorState {
        *self.state_rx.borrow()
    }

    /// Requests a clean shutdown. Idempotent; may be called from any task, before or during
    ///  [`run`](Self::run).
    pub fn stop(&self) {
        self.stop_tx.send(true).ok();
    }

    /// Runs session iterations until stopped or fatally broken. Returns `Ok` on a requested
    ///  stop, `Err` with the worst outcome otherwise.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut stop_rx = self.stop_rx.clone();
        self.state_tx.send(SupervisorState::Executing).ok();

        let memory = SessionMemory::open(
            &self.config.session_memory_dir,
            &self.config.sender_addr.to_string(),
            &self.config.feed,
            self.config.max_persisted_missed,
        ).context("opening session memory")?;
        let memory = Arc::new(Mutex::new(memory));

        let final_outcome = loop {
            if *stop_rx.borrow() {
                break SessionOutcome::Shutdown;
            }

            let outcome = self.run_session_iteration(memory.clone(), &mut stop_rx).await;
            match outcome {
                SessionOutcome::Shutdown => break SessionOutcome::Shutdown,
                SessionOutcome::SubscriptionRefused(_) | SessionOutcome::SystemError(_) => break outcome,
                SessionOutcome::TransientIo(ref reason) => {
                    warn!("session iteration failed ({}) - napping for up to {:?}", reason, self.config.retry_nap);
                    self.state_tx.send(SupervisorState::Nap).ok();

                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_nap) => {}
                        _ = stop_rx.changed() => {}
                    }
                    if *stop_rx.borrow() {
                        break SessionOutcome::Shutdown;
                    }
                    self.state_tx.send(SupervisorState::Executing).ok();
                }
            }
        };

        self.state_tx.send(SupervisorState::Stopping).ok();
        // session memory closes when its last reference is dropped
        drop(memory);
        self.state_tx.send(SupervisorState::Stopped).ok();

        match final_outcome {
            SessionOutcome::Shutdown => {
                info!("downstream receiver stopped");
                Ok(())
            }
            outcome => Err(anyhow!("downstream receiver failed: {:?}", outcome)),
        }
    }

    /// One session iteration: subscribe, wire up sockets and workers, run until the first
    ///  worker dies or a stop is requested, then stop everything and fold the outcomes.
    async fn run_session_iteration(&self, memory: Arc<Mutex<SessionMemory>>, stop_rx: &mut watch::Receiver<bool>) -> SessionOutcome {
        let mut control = match ControlClient::connect(self.config.sender_addr, self.config.rpc_timeout, self.config.rpc_timeout_is_success).await {
            Ok(control) => control,
            Err(e) => return SessionOutcome::TransientIo(format!("cannot reach the sender: {:#}", e)),
        };

        let info = match control.subscribe(&self.config.feed, &self.config.secret).await {
            Ok(SubscribeOutcome::Granted(info)) => info,
            Ok(SubscribeOutcome::Refused(status)) => {
                return SessionOutcome::SubscriptionRefused(format!("sender refused feed {:?}: {:?}", self.config.feed, status));
            }
            Err(e) => return SessionOutcome::TransientIo(format!("subscribe failed: {:#}", e)),
        };
        info!("subscribed to feed {:?}: group {:?}, retransmissions from {:?}", self.config.feed, info.mcast_group, info.retx_endpoint);

        let mcast_socket = match mcast_receiver::create_mcast_socket(info.mcast_group, self.config.interface_addr) {
            Ok(socket) => socket,
            Err(e) => return SessionOutcome::TransientIo(format!("cannot join multicast group: {:#}", e)),
        };
        let retx_stream = match tokio::time::timeout(self.config.rpc_timeout, TcpStream::connect(info.retx_endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return SessionOutcome::TransientIo(format!("cannot connect for retransmissions: {:#}", e)),
            Err(_) => return SessionOutcome::TransientIo("retransmission connect timed out".to_string()),
        };

        // indices detected missing in an earlier run but never requested: ask for them now,
        //  before multicast traffic starts adding new ones
        let leftover = {
            let mut memory = memory.lock().await;
            let mut leftover = Vec::new();
            while let Ok(Some(prod_index)) = memory.dequeue_missed() {
                leftover.push(prod_index);
            }
            leftover
        };
        for prod_index in leftover {
            debug!("re-requesting product #{} missed before the restart", prod_index);
            if let Err(e) = control.request_missed(prod_index).await {
                return SessionOutcome::TransientIo(format!("requesting missed product #{} failed: {:#}", prod_index, e));
            }
        }

        let previous_signature = match memory.lock().await.last_signature() {
            Some(signature) => Some(signature),
            None => self.product_queue.most_recent_signature().await,
        };

        let (queue, queue_rx) = RequestQueue::new();
        let (first_arrival_tx, first_arrival_rx) = oneshot::channel();
        let shared = Arc::new(SessionShared::new(
            self.config.clone(),
            self.notifier.clone(),
            self.product_queue.clone(),
            memory,
            queue,
            first_arrival_tx,
        ));

        let mut workers = WorkerSet::spawn(shared.clone(), mcast_socket, retx_stream, queue_rx);

        // one-shot backlog request, fired by the first multicast arrival of this session
        let backlog_offset = self.config.backlog_time_offset;
        let backlog_handle = tokio::spawn(async move {
            let Ok(first_signature) = first_arrival_rx.await else {
                debug!("session ended before the first multicast arrival - no backlog request");
                return;
            };
            if previous_signature == Some(first_signature) {
                debug!("first arrival matches the previous session's last product - no backlog");
                return;
            }
            info!("requesting backlog up to the first arrival of this session");
            let request = BacklogRequest {
                from_signature: previous_signature,
                to_signature: first_signature,
                time_offset: backlog_offset,
            };
            if let Err(e) = control.request_backlog(request).await {
                warn!("backlog request failed: {:#}", e);
            }
        });

        let first_outcome = tokio::select! {
            _ = stop_rx.changed() => SessionOutcome::Shutdown,
            completion = workers.completion_rx.recv() => match completion {
                Some((kind, outcome)) => {
                    debug!("worker {:?} terminated first: {:?}", kind, outcome);
                    outcome
                }
                None => SessionOutcome::SystemError("completion channel closed unexpectedly".to_string()),
            }
        };

        let remaining = workers.stop(&shared).await;
        let folded = remaining.into_iter()
            .fold(first_outcome, |worst, (_, outcome)| worst.worst(outcome));

        shared.abort_all_unfinished().await;
        drop(shared); // releases the first-arrival trigger, letting the backlog task finish
        backlog_handle.await.ok();

        folded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{read_message, write_message, ControlMessage, SubscribeReply, SubscribeStatus};
    use crate::notifier::{AllocatingNotifier, MockProductQueue};
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn test_config(sender_addr: std::net::SocketAddr, dir: &std::path::Path) -> DownstreamConfig {
        let mut config = DownstreamConfig::new(sender_addr, "wx/test", dir);
        config.rpc_timeout = Duration::from_millis(500);
        config.retry_nap = Duration::from_millis(100);
        config
    }

    fn product_queue() -> Arc<MockProductQueue> {
        let mut queue = MockProductQueue::new();
        queue.expect_most_recent_signature().returning(|| None);
        queue.expect_insert().returning(|_| Ok(()));
        Arc::new(queue)
    }

    #[tokio::test]
    async fn test_unreachable_sender_naps_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        // a bound-then-dropped listener gives a port that refuses connections
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let supervisor = Arc::new(DownstreamSupervisor::new(
            test_config(format!("127.0.0.1:{}", port).parse().unwrap(), dir.path()),
            Arc::new(AllocatingNotifier),
            product_queue(),
        ).unwrap());

        let runner = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.run().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(supervisor.state(), SupervisorState::Executing | SupervisorState::Nap));

        supervisor.stop();
        let result = tokio::time::timeout(Duration::from_secs(5), runner).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_refused_subscription_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let sender_addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _request = read_message(&mut stream).await.unwrap();
            write_message(&mut stream, &ControlMessage::SubscribeReply(SubscribeReply {
                status: SubscribeStatus::UnknownFeed,
                mcast_info: None,
            })).await.unwrap();
        });

        let supervisor = DownstreamSupervisor::new(
            test_config(sender_addr, dir.path()),
            Arc::new(AllocatingNotifier),
            product_queue(),
        ).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), supervisor.run()).await.unwrap();
        assert!(result.is_err());
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_before_run() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = DownstreamSupervisor::new(
            test_config("127.0.0.1:1".parse().unwrap(), dir.path()),
            Arc::new(AllocatingNotifier),
            product_queue(),
        ).unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Initialized);

        supervisor.stop();
        assert!(supervisor.run().await.is_ok());
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }
}
