use anyhow::bail;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration of one downstream receiver.
///
/// The receiver learns the multicast group to join and the retransmission endpoint from the
///  subscribe reply; everything configured here is what it needs to get that far, plus the
///  tuning knobs of the reception machinery itself.
#[derive(Debug, Clone)]
pub struct DownstreamConfig {
    /// endpoint of the sender's control channel (subscription, backlog and missed-product
    ///  requests)
    pub sender_addr: SocketAddr,

    /// the feed to subscribe to, an opaque identifier agreed with the sender
    pub feed: String,

    /// shared secret presented during subscription
    pub secret: Vec<u8>,

    /// IPv4 address of the local interface that receives multicast packets. The unspecified
    ///  address lets the kernel choose.
    pub interface_addr: Ipv4Addr,

    /// Nominal speed of the slowest link between sender and receiver, in bits per second.
    ///
    /// This bounds the BOP timeout from below: however small the measured round trip gets, the
    ///  receiver never gives up on a product faster than one maximum-size packet takes to cross
    ///  the configured link. The default is far above any deployed hardware, making the floor
    ///  effectively zero until operators configure something real.
    pub link_speed_bits_per_sec: u64,

    /// seed for the round-trip estimate before any retransmission has been measured
    pub initial_rtt: Duration,

    /// The BOP timeout is this multiple of the current round-trip estimate.
    pub bop_timeout_multiplier: u32,

    /// how long a subscribe (or any other awaited control call) may take before the session
    ///  iteration is abandoned
    pub rpc_timeout: Duration,

    /// Whether a timed-out fire-and-forget control call counts as delivered. The sender is
    ///  not guaranteed to have observed the call either way; disabling this trades availability
    ///  for a retry.
    pub rpc_timeout_is_success: bool,

    /// upper bound for the pause between two session iterations after a transient failure
    pub retry_nap: Duration,

    /// Products whose index is at most this far ahead of the last one seen are considered
    ///  recent and recoverable; anything further away is treated as noise. Must be below 2^31
    ///  for the wrap-around comparison to be well defined.
    pub recency_window: u32,

    /// directory holding the per-(sender, feed) session memory files
    pub session_memory_dir: PathBuf,

    /// backlog horizon when no previous session left a signature behind
    pub backlog_time_offset: Duration,

    /// bound on the durable queue of missed-but-not-yet-requested product indices
    pub max_persisted_missed: usize,
}

impl DownstreamConfig {
    pub fn new(sender_addr: SocketAddr, feed: impl Into<String>, session_memory_dir: impl Into<PathBuf>) -> DownstreamConfig {
        DownstreamConfig {
            sender_addr,
            feed: feed.into(),
            secret: Vec::new(),
            interface_addr: Ipv4Addr::UNSPECIFIED,
            // upper bound of 18 Pbps - effectively "no floor" until configured
            link_speed_bits_per_sec: 18_000_000_000_000_000,
            initial_rtt: Duration::from_millis(50),
            bop_timeout_multiplier: 10,
            rpc_timeout: Duration::from_secs(25),
            rpc_timeout_is_success: true,
            retry_nap: Duration::from_secs(60),
            recency_window: (1 << 31) - 1,
            session_memory_dir: session_memory_dir.into(),
            backlog_time_offset: Duration::ZERO,
            max_persisted_missed: 4096,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.feed.is_empty() {
            bail!("feed must not be empty");
        }
        if !matches!(self.sender_addr.ip(), IpAddr::V4(_)) {
            bail!("sender address must be IPv4");
        }
        if self.link_speed_bits_per_sec == 0 {
            bail!("link speed must be positive");
        }
        if self.initial_rtt.is_zero() {
            bail!("initial RTT must be positive");
        }
        if self.bop_timeout_multiplier == 0 {
            bail!("BOP timeout multiplier must be positive");
        }
        if self.rpc_timeout.is_zero() {
            bail!("RPC timeout must be positive");
        }
        if self.retry_nap.is_zero() {
            bail!("retry nap must be positive");
        }
        if self.recency_window == 0 || self.recency_window > (1 << 31) {
            bail!("recency window must be in 1..=2^31");
        }
        if self.max_persisted_missed == 0 {
            bail!("missed-index queue bound must be positive");
        }

        Ok(())
    }
}
