use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;

/// Why a product the receiver had started (or was waiting) on will never be delivered.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeliveryFailure {
    /// the BOP never arrived, on either path, within the timeout
    BopTimeout,
    /// the sender declared the product unrecoverable
    SenderRejected,
    /// the session ended with the product incomplete
    SessionEnded,
}

/// A fully reassembled product, ready to be handed off.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CompletedProduct {
    pub prod_index: u32,
    pub signature: [u8; 16],
    pub metadata: String,
    pub data: Bytes,
}

/// Callbacks into the receiving application.
///
/// `on_bop` is invoked once per product when its opening marker arrives (on either path) and
///  must return the destination buffer for the product's bytes; returning an error skips the
///  product. `on_delivery_failed` reports products given up on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RecvNotifier: Send + Sync + 'static {
    async fn on_bop(&self, prod_index: u32, total_size: u64, signature: [u8; 16], metadata: &str) -> anyhow::Result<BytesMut>;

    async fn on_delivery_failed(&self, prod_index: u32, reason: DeliveryFailure);
}

/// The content-addressed store that completed products are handed to.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProductQueue: Send + Sync + 'static {
    async fn insert(&self, product: CompletedProduct) -> anyhow::Result<()>;

    /// signature of the most recently inserted product, if any
    async fn most_recent_signature(&self) -> Option<[u8; 16]>;
}

/// A notifier that allocates zeroed buffers and logs failures - sufficient for receivers that
///  only consume the product queue.
pub struct AllocatingNotifier;

#[async_trait]
impl RecvNotifier for AllocatingNotifier {
    async fn on_bop(&self, _prod_index: u32, total_size: u64, _signature: [u8; 16], _metadata: &str) -> anyhow::Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(total_size as usize);
        buf.resize(total_size as usize, 0);
        Ok(buf)
    }

    async fn on_delivery_failed(&self, prod_index: u32, reason: DeliveryFailure) {
        tracing::warn!("product #{} will not be delivered: {:?}", prod_index, reason);
    }
}
