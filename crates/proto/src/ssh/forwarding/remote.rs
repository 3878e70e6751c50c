//! Remote port forwarding (tcpip-forward).
//!
//! [`RemotePortForwarder`] is a packet interceptor with two jobs:
//!
//! 1. Drive the "tcpip-forward" / "cancel-tcpip-forward" global requests.
//!    Global requests are serialized through a single in-flight slot;
//!    callers queue on it while another request is pending, and a closed
//!    connection aborts the wait.
//! 2. Accept inbound "forwarded-tcpip" channel opens, matching them
//!    against the registry of bound ports and handing accepted channels to
//!    the registered handler.

use crate::ssh::channel::{
    Channel, ChannelEvents, ChannelTable, OpenFailureReason, CHANNEL_MAX_PACKET,
    CHANNEL_WINDOW_DEFAULT,
};
use crate::ssh::forwarding::types::ForwardAddr;
use crate::ssh::interceptor::{CloseHandle, InterceptOutcome, PacketInterceptor, ResponseSlot};
use crate::ssh::message::MessageType;
use crate::ssh::transport::Transport;
use crate::ssh::wire::{put_bool, put_string, Reader};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use skiff_platform::{SkiffError, SkiffResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Handler for one remotely bound port.
#[async_trait]
pub trait ForwardedPortHandler: Send + Sync {
    /// The server confirmed the bind; `port` is the effective port (the
    /// server-assigned one when 0 was requested).
    async fn on_listening(&self, _addr: &str, _port: u32) -> SkiffResult<()> {
        Ok(())
    }

    /// A connection arrived on the bound port.
    ///
    /// Returning event handlers accepts the channel; returning a reason
    /// rejects it with that code.
    async fn accept(
        &self,
        connected: &ForwardAddr,
        originator: &ForwardAddr,
        channel: Arc<Channel>,
    ) -> Result<Arc<dyn ChannelEvents>, OpenFailureReason>;
}

/// The remote port forwarder interceptor.
pub struct RemotePortForwarder {
    transport: Arc<Transport>,
    channels: Arc<ChannelTable>,
    registry: RwLock<HashMap<u32, Arc<dyn ForwardedPortHandler>>>,
    /// Serializes global requests: held for the full request/response span.
    request_gate: Mutex<()>,
    awaiting_reply: AtomicBool,
    slot: ResponseSlot,
    close: CloseHandle,
    self_ref: Weak<RemotePortForwarder>,
}

impl RemotePortForwarder {
    /// Creates the forwarder.
    pub fn new(
        transport: Arc<Transport>,
        channels: Arc<ChannelTable>,
        close: CloseHandle,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            transport,
            channels,
            registry: RwLock::new(HashMap::new()),
            request_gate: Mutex::new(()),
            awaiting_reply: AtomicBool::new(false),
            slot: ResponseSlot::new(),
            close,
            self_ref: weak.clone(),
        })
    }

    fn registered_handler(&self, port: u32) -> Option<Arc<dyn ForwardedPortHandler>> {
        match self.registry.read() {
            Ok(registry) => registry.get(&port).cloned(),
            Err(_) => None,
        }
    }

    /// Number of bound ports (for tests/diagnostics).
    pub fn bound_ports(&self) -> usize {
        self.registry.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Acquires the single in-flight global request slot, aborting when the
    /// connection closes while queued.
    async fn acquire_gate(&self) -> SkiffResult<tokio::sync::MutexGuard<'_, ()>> {
        let mut closed = self.close.subscribe();
        if self.close.is_closed() {
            return Err(SkiffError::Closed);
        }

        tokio::select! {
            guard = self.request_gate.lock() => Ok(guard),
            _ = closed.changed() => Err(SkiffError::Closed),
        }
    }

    /// Asks the server to listen on `addr:port` and registers `handler` for
    /// inbound connections.
    ///
    /// Returns the effective port: when `port` is 0 the server-assigned
    /// port is read from the REQUEST_SUCCESS body.
    ///
    /// # Errors
    ///
    /// [`SkiffError::Protocol`] when the server answers REQUEST_FAILURE;
    /// timeout/closed errors as usual.
    pub async fn listen(
        &self,
        handler: Arc<dyn ForwardedPortHandler>,
        addr: &str,
        port: u32,
    ) -> SkiffResult<u32> {
        let _gate = self.acquire_gate().await?;

        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::GlobalRequest as u8);
        put_string(&mut buf, b"tcpip-forward");
        put_bool(&mut buf, true);
        put_string(&mut buf, addr.as_bytes());
        buf.put_u32(port);

        self.awaiting_reply.store(true, Ordering::SeqCst);
        let sent = self.transport.send_payload(&buf).await;
        let response = match sent {
            Ok(()) => self.slot.await_response("tcpip-forward").await,
            Err(e) => Err(e),
        };
        self.awaiting_reply.store(false, Ordering::SeqCst);
        let response = response?;

        match response.first().copied() {
            Some(op) if op == MessageType::RequestSuccess as u8 => {
                let bound_port = if port == 0 {
                    let mut reader = Reader::new(&response[1..]);
                    reader.take_u32("server-assigned port")?
                } else {
                    port
                };

                if let Ok(mut registry) = self.registry.write() {
                    registry.insert(bound_port, Arc::clone(&handler));
                }
                info!(addr = %addr, port = bound_port, "Remote forward bound");

                if let Err(e) = handler.on_listening(addr, bound_port).await {
                    warn!("Forward listening handler failed: {}", e);
                }
                Ok(bound_port)
            }
            Some(op) if op == MessageType::RequestFailure as u8 => Err(SkiffError::Protocol(
                format!("Server rejected tcpip-forward for {}:{}", addr, port),
            )),
            other => Err(SkiffError::Protocol(format!(
                "Unexpected global request reply opcode {:?}",
                other
            ))),
        }
    }

    /// Cancels a remote bind. Port 0 clears every registered bind.
    ///
    /// # Errors
    ///
    /// [`SkiffError::Protocol`] when the server answers REQUEST_FAILURE.
    pub async fn cancel(&self, addr: &str, port: u32) -> SkiffResult<()> {
        let _gate = self.acquire_gate().await?;

        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::GlobalRequest as u8);
        put_string(&mut buf, b"cancel-tcpip-forward");
        put_bool(&mut buf, true);
        put_string(&mut buf, addr.as_bytes());
        buf.put_u32(port);

        self.awaiting_reply.store(true, Ordering::SeqCst);
        let sent = self.transport.send_payload(&buf).await;
        let response = match sent {
            Ok(()) => self.slot.await_response("cancel-tcpip-forward").await,
            Err(e) => Err(e),
        };
        self.awaiting_reply.store(false, Ordering::SeqCst);
        let response = response?;

        match response.first().copied() {
            Some(op) if op == MessageType::RequestSuccess as u8 => {
                if let Ok(mut registry) = self.registry.write() {
                    if port == 0 {
                        registry.clear();
                    } else {
                        registry.remove(&port);
                    }
                }
                info!(addr = %addr, port, "Remote forward cancelled");
                Ok(())
            }
            Some(op) if op == MessageType::RequestFailure as u8 => Err(SkiffError::Protocol(
                format!("Server rejected cancel-tcpip-forward for {}:{}", addr, port),
            )),
            other => Err(SkiffError::Protocol(format!(
                "Unexpected global request reply opcode {:?}",
                other
            ))),
        }
    }

    async fn send_open_failure(&self, remote_channel: u32, reason: OpenFailureReason) {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenFailure as u8);
        buf.put_u32(remote_channel);
        buf.put_u32(reason.code());
        put_string(&mut buf, reason.description().as_bytes());
        put_string(&mut buf, b"");

        if let Err(e) = self.transport.send_payload(&buf).await {
            warn!("Failed to send channel open failure: {}", e);
        }
    }

    /// Handles one inbound "forwarded-tcpip" CHANNEL_OPEN.
    async fn handle_forwarded_open(&self, payload: Vec<u8>) -> SkiffResult<()> {
        let mut reader = Reader::new(&payload);
        let _opcode = reader.take_u8("message type")?;
        let _channel_type = reader.take_str("channel type")?;
        let remote_channel = reader.take_u32("sender channel")?;
        let _initial_window = reader.take_u32("initial window")?;
        let max_packet = reader.take_u32("maximum packet size")?;
        let addr_connected = reader.take_str("address connected")?;
        let port_connected = reader.take_u32("port connected")?;
        let originator_ip = reader.take_str("originator address")?;
        let originator_port = reader.take_u32("originator port")?;

        let Some(handler) = self.registered_handler(port_connected) else {
            debug!(
                port = port_connected,
                "forwarded-tcpip open for unregistered port"
            );
            self.send_open_failure(remote_channel, OpenFailureReason::AdministrativelyProhibited)
                .await;
            return Ok(());
        };

        let connected = ForwardAddr::new(addr_connected, port_connected);
        let originator = ForwardAddr::new(originator_ip, originator_port);
        let channel = self.channels.prepare_inbound(remote_channel, max_packet);

        match handler.accept(&connected, &originator, Arc::clone(&channel)).await {
            Ok(events) => {
                self.channels.install(Arc::clone(&channel), events);

                let mut buf = BytesMut::new();
                buf.put_u8(MessageType::ChannelOpenConfirmation as u8);
                buf.put_u32(remote_channel);
                buf.put_u32(channel.local_id());
                buf.put_u32(CHANNEL_WINDOW_DEFAULT);
                buf.put_u32(CHANNEL_MAX_PACKET);
                self.transport.send_payload(&buf).await?;

                debug!(
                    local = channel.local_id(),
                    remote = remote_channel,
                    origin = %originator,
                    "Accepted forwarded-tcpip channel"
                );
                Ok(())
            }
            Err(reason) => {
                self.send_open_failure(remote_channel, reason).await;
                Ok(())
            }
        }
    }
}

/// Returns the channel type of a CHANNEL_OPEN payload, when parseable.
fn channel_open_type(payload: &[u8]) -> Option<String> {
    let mut reader = Reader::new(payload);
    reader.take_u8("opcode").ok()?;
    reader.take_str("channel type").ok()
}

#[async_trait]
impl PacketInterceptor for RemotePortForwarder {
    async fn intercept_packet(&self, payload: &[u8]) -> InterceptOutcome {
        let Some(opcode) = payload.first().copied() else {
            return InterceptOutcome::PassThrough;
        };

        if (opcode == MessageType::RequestSuccess as u8
            || opcode == MessageType::RequestFailure as u8)
            && self.awaiting_reply.load(Ordering::SeqCst)
        {
            self.slot.deliver(payload.to_vec()).await;
            return InterceptOutcome::Consumed;
        }

        if opcode == MessageType::ChannelOpen as u8 {
            if channel_open_type(payload).as_deref() == Some("forwarded-tcpip") {
                // The accept callback is application code; run it off the
                // reader task.
                if let Some(me) = self.self_ref.upgrade() {
                    let payload = payload.to_vec();
                    tokio::spawn(async move {
                        if let Err(e) = me.handle_forwarded_open(payload).await {
                            warn!("forwarded-tcpip open failed: {}", e);
                        }
                    });
                }
                return InterceptOutcome::Consumed;
            }
        }

        InterceptOutcome::PassThrough
    }

    async fn on_connection_closed(&self) {
        self.slot.deliver_closed();
    }

    fn name(&self) -> &'static str {
        "remote-port-forwarder"
    }
}
