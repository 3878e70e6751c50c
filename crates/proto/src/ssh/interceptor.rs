//! Packet interceptor fabric.
//!
//! Sub-protocols (key exchange, authentication, port forwarding, agent
//! forwarding) each own a slice of the opcode space for a bounded span of
//! time. Rather than a monolithic dispatcher, inbound payloads are offered
//! to an ordered chain of stateful interceptors; the first to claim a
//! packet consumes it, and an interceptor can remove itself from the chain
//! when its state machine completes. Packets no interceptor claims fall
//! through to the connection's default dispatch.

use async_trait::async_trait;
use skiff_platform::{SkiffError, SkiffResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, trace};

/// Per-step response timeout for key exchange, authentication, and global
/// requests. A peer that does not answer within this window is treated as
/// unresponsive and the connection fails.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// What an interceptor did with an offered packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptOutcome {
    /// The packet was fully handled; stop offering it.
    Consumed,
    /// The packet is not for this interceptor; offer it to the next one.
    PassThrough,
    /// The packet was handled and the interceptor's state machine is done;
    /// remove it from the chain.
    Finished,
}

/// A stateful consumer of inbound packets.
///
/// Interceptors are shared between the chain (driven by the reader task)
/// and the sub-protocol driver that installed them, so they take `&self`
/// and keep their state behind interior mutability.
#[async_trait]
pub trait PacketInterceptor: Send + Sync {
    /// Offers one inbound payload (opcode + body) to this interceptor.
    async fn intercept_packet(&self, payload: &[u8]) -> InterceptOutcome;

    /// Notifies the interceptor that the connection closed.
    ///
    /// Implementations must unblock any task waiting on their response slot
    /// by injecting the synthetic terminating packet.
    async fn on_connection_closed(&self);

    /// Short name for trace logging.
    fn name(&self) -> &'static str;
}

/// Ordered chain of interceptors.
pub struct InterceptorChain {
    interceptors: Mutex<Vec<Arc<dyn PacketInterceptor>>>,
}

impl Default for InterceptorChain {
    fn default() -> Self {
        Self::new()
    }
}

impl InterceptorChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self {
            interceptors: Mutex::new(Vec::new()),
        }
    }

    /// Appends an interceptor to the end of the chain.
    pub async fn push(&self, interceptor: Arc<dyn PacketInterceptor>) {
        trace!("Installing interceptor {}", interceptor.name());
        self.interceptors.lock().await.push(interceptor);
    }

    /// Offers a payload to the chain in insertion order.
    ///
    /// Returns `true` when some interceptor claimed the packet, `false`
    /// when the connection's default dispatch should handle it.
    pub async fn offer(&self, payload: &[u8]) -> bool {
        let mut interceptors = self.interceptors.lock().await;

        for idx in 0..interceptors.len() {
            let interceptor = Arc::clone(&interceptors[idx]);
            match interceptor.intercept_packet(payload).await {
                InterceptOutcome::Consumed => return true,
                InterceptOutcome::Finished => {
                    debug!("Interceptor {} finished", interceptor.name());
                    interceptors.remove(idx);
                    return true;
                }
                InterceptOutcome::PassThrough => {}
            }
        }

        false
    }

    /// Propagates connection close to every interceptor.
    pub async fn notify_closed(&self) {
        let interceptors = self.interceptors.lock().await;
        for interceptor in interceptors.iter() {
            interceptor.on_connection_closed().await;
        }
    }

    /// Number of installed interceptors (for tests/diagnostics).
    pub async fn len(&self) -> usize {
        self.interceptors.lock().await.len()
    }

    /// Returns true when no interceptors are installed.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

enum SlotMessage {
    Payload(Vec<u8>),
    Closed,
}

/// Bounded rendezvous slot holding one inbound packet for a waiting task.
///
/// The reader task delivers the packet an interceptor claimed; the
/// sub-protocol driver awaits it with the per-step response timeout. On
/// connection close a terminating message unblocks the waiter.
pub struct ResponseSlot {
    tx: mpsc::Sender<SlotMessage>,
    rx: Mutex<mpsc::Receiver<SlotMessage>>,
    closed: AtomicBool,
}

impl Default for ResponseSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseSlot {
    /// Creates an empty slot.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }

    /// Delivers a claimed packet to the waiting task.
    ///
    /// Blocks while a previous packet is still unconsumed, which
    /// backpressures the reader task for the duration of the rendezvous.
    pub async fn deliver(&self, payload: Vec<u8>) {
        let _ = self.tx.send(SlotMessage::Payload(payload)).await;
    }

    /// Injects the synthetic terminating packet on connection close.
    pub fn deliver_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.tx.try_send(SlotMessage::Closed);
    }

    /// Awaits the next delivered packet with the 5-second response timeout.
    ///
    /// # Errors
    ///
    /// - [`SkiffError::Timeout`] when the peer does not respond in time
    /// - [`SkiffError::Closed`] when the connection closed while waiting
    pub async fn await_response(&self, what: &str) -> SkiffResult<Vec<u8>> {
        if self.closed.load(Ordering::SeqCst) {
            // Drain a possibly queued packet first so a close racing a
            // delivery still hands the final packet to the waiter.
            let mut rx = self.rx.lock().await;
            if let Ok(SlotMessage::Payload(payload)) = rx.try_recv() {
                return Ok(payload);
            }
            return Err(SkiffError::Closed);
        }

        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(RESPONSE_TIMEOUT, rx.recv()).await {
            Err(_) => Err(SkiffError::Timeout(format!(
                "server did not respond to {}",
                what
            ))),
            Ok(None) | Ok(Some(SlotMessage::Closed)) => Err(SkiffError::Closed),
            Ok(Some(SlotMessage::Payload(payload))) => Ok(payload),
        }
    }
}

/// Closing capability handed to interceptors.
///
/// Interceptors that hit a fatal protocol failure must be able to bring
/// the connection down without holding a reference to the whole
/// connection; this small handle exposes exactly that.
#[derive(Clone)]
pub struct CloseHandle {
    tx: watch::Sender<bool>,
}

impl CloseHandle {
    /// Creates the handle and the receiver the connection's reader task
    /// watches.
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }

    /// Requests connection teardown.
    pub fn request_close(&self) {
        let _ = self.tx.send(true);
    }

    /// Returns true once teardown has been requested.
    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Creates another watcher for the close signal.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedInterceptor {
        claim_opcode: u8,
        finish_after: usize,
        seen: AtomicUsize,
        slot: ResponseSlot,
    }

    impl ScriptedInterceptor {
        fn new(claim_opcode: u8, finish_after: usize) -> Self {
            Self {
                claim_opcode,
                finish_after,
                seen: AtomicUsize::new(0),
                slot: ResponseSlot::new(),
            }
        }
    }

    #[async_trait]
    impl PacketInterceptor for ScriptedInterceptor {
        async fn intercept_packet(&self, payload: &[u8]) -> InterceptOutcome {
            if payload.first() != Some(&self.claim_opcode) {
                return InterceptOutcome::PassThrough;
            }
            let seen = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
            if seen >= self.finish_after {
                InterceptOutcome::Finished
            } else {
                InterceptOutcome::Consumed
            }
        }

        async fn on_connection_closed(&self) {
            self.slot.deliver_closed();
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    #[tokio::test]
    async fn test_chain_offers_in_order_and_stops_at_claim() {
        let chain = InterceptorChain::new();
        let first = Arc::new(ScriptedInterceptor::new(20, usize::MAX));
        let second = Arc::new(ScriptedInterceptor::new(20, usize::MAX));
        chain.push(first.clone()).await;
        chain.push(second.clone()).await;

        assert!(chain.offer(&[20, 1, 2]).await);
        assert_eq!(first.seen.load(Ordering::SeqCst), 1);
        // At most one interceptor observes each packet
        assert_eq!(second.seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_chain_pass_through_falls_to_default() {
        let chain = InterceptorChain::new();
        chain
            .push(Arc::new(ScriptedInterceptor::new(20, usize::MAX)))
            .await;

        assert!(!chain.offer(&[94, 0, 0, 0, 0]).await);
    }

    #[tokio::test]
    async fn test_finished_removes_interceptor() {
        let chain = InterceptorChain::new();
        chain.push(Arc::new(ScriptedInterceptor::new(52, 1))).await;

        assert_eq!(chain.len().await, 1);
        assert!(chain.offer(&[52]).await);
        assert_eq!(chain.len().await, 0);
        // Next identical packet falls through
        assert!(!chain.offer(&[52]).await);
    }

    #[tokio::test]
    async fn test_response_slot_rendezvous() {
        let slot = Arc::new(ResponseSlot::new());
        let waiter = {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move { slot.await_response("test").await })
        };

        slot.deliver(vec![31, 9]).await;
        assert_eq!(waiter.await.unwrap().unwrap(), vec![31, 9]);
    }

    #[tokio::test]
    async fn test_response_slot_close_unblocks_waiter() {
        let slot = Arc::new(ResponseSlot::new());
        let waiter = {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move { slot.await_response("test").await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        slot.deliver_closed();

        assert!(matches!(waiter.await.unwrap(), Err(SkiffError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_slot_times_out() {
        let slot = ResponseSlot::new();
        let err = slot.await_response("SSH_MSG_KEXDH_REPLY").await.unwrap_err();
        match err {
            SkiffError::Timeout(msg) => assert!(msg.contains("SSH_MSG_KEXDH_REPLY")),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_handle() {
        let (handle, mut rx) = CloseHandle::new();
        assert!(!handle.is_closed());

        handle.request_close();
        assert!(handle.is_closed());
        assert!(rx.changed().await.is_ok());
    }
}
