//! Channel multiplexing (RFC 4254).
//!
//! The connection owns a table mapping local channel numbers to a channel
//! operator plus an event handler. Local numbers are allocated
//! monotonically and never reused; an entry is removed (and its handler
//! dropped) when the channel closes or fails to open.
//!
//! Per-channel application logic lives behind [`ChannelEvents`]; this
//! module only provides the operator surface (data, EOF, close, requests,
//! window adjust) and the routing of CHANNEL_* messages.

use crate::ssh::interceptor::RESPONSE_TIMEOUT;
use crate::ssh::message::MessageType;
use crate::ssh::transport::Transport;
use crate::ssh::wire::{put_bool, put_string, Reader};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use skiff_platform::{SkiffError, SkiffResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

/// Default initial window size offered on new channels.
pub const CHANNEL_WINDOW_DEFAULT: u32 = 2_097_152;

/// Default maximum packet size offered on new channels.
pub const CHANNEL_MAX_PACKET: u32 = 32_768;

/// SSH_MSG_CHANNEL_OPEN_FAILURE reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFailureReason {
    /// SSH_OPEN_ADMINISTRATIVELY_PROHIBITED
    AdministrativelyProhibited,
    /// SSH_OPEN_CONNECT_FAILED
    ConnectFailed,
    /// SSH_OPEN_UNKNOWN_CHANNEL_TYPE
    UnknownChannelType,
    /// SSH_OPEN_RESOURCE_SHORTAGE
    ResourceShortage,
}

impl OpenFailureReason {
    /// Returns the wire reason code.
    pub fn code(&self) -> u32 {
        match self {
            OpenFailureReason::AdministrativelyProhibited => 1,
            OpenFailureReason::ConnectFailed => 2,
            OpenFailureReason::UnknownChannelType => 3,
            OpenFailureReason::ResourceShortage => 4,
        }
    }

    /// Returns a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            OpenFailureReason::AdministrativelyProhibited => "administratively prohibited",
            OpenFailureReason::ConnectFailed => "connect failed",
            OpenFailureReason::UnknownChannelType => "unknown channel type",
            OpenFailureReason::ResourceShortage => "resource shortage",
        }
    }
}

/// Event handler for one channel.
///
/// Handler failures are logged and swallowed; a misbehaving handler never
/// corrupts the protocol state.
#[async_trait]
pub trait ChannelEvents: Send + Sync {
    /// The peer confirmed our channel open.
    async fn on_open_confirmation(&self) -> SkiffResult<()> {
        Ok(())
    }
    /// The peer rejected our channel open.
    async fn on_open_failure(&self, _reason: u32, _description: &str) -> SkiffResult<()> {
        Ok(())
    }
    /// Data arrived on the channel.
    async fn on_data(&self, _data: &[u8]) -> SkiffResult<()> {
        Ok(())
    }
    /// Extended data (e.g. stderr) arrived on the channel.
    async fn on_extended_data(&self, _data_type: u32, _data: &[u8]) -> SkiffResult<()> {
        Ok(())
    }
    /// The peer sent EOF.
    async fn on_eof(&self) -> SkiffResult<()> {
        Ok(())
    }
    /// The peer closed the channel; the table entry is gone.
    async fn on_close(&self) -> SkiffResult<()> {
        Ok(())
    }
    /// The peer sent a channel request (e.g. "exit-status").
    async fn on_request(&self, _request: &str, _want_reply: bool, _data: &[u8]) -> SkiffResult<()> {
        Ok(())
    }
    /// The peer granted additional window.
    async fn on_window_adjust(&self, _delta: u32) -> SkiffResult<()> {
        Ok(())
    }
}

/// Operator handle for one channel.
///
/// Cheap to clone through `Arc`; all sends go through the shared transport.
pub struct Channel {
    local_id: u32,
    remote_id: OnceLock<u32>,
    remote_max_packet: OnceLock<u32>,
    transport: Arc<Transport>,
    reply: Mutex<Option<oneshot::Sender<bool>>>,
}

impl Channel {
    fn new(local_id: u32, transport: Arc<Transport>) -> Self {
        Self {
            local_id,
            remote_id: OnceLock::new(),
            remote_max_packet: OnceLock::new(),
            transport,
            reply: Mutex::new(None),
        }
    }

    /// Returns the local channel number.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Returns the peer's channel number, once known.
    pub fn remote_id(&self) -> Option<u32> {
        self.remote_id.get().copied()
    }

    fn confirmed_remote_id(&self) -> SkiffResult<u32> {
        self.remote_id.get().copied().ok_or_else(|| {
            SkiffError::Protocol(format!("Channel {} is not open yet", self.local_id))
        })
    }

    pub(crate) fn confirm(&self, remote_id: u32, max_packet: u32) {
        let _ = self.remote_id.set(remote_id);
        let _ = self.remote_max_packet.set(max_packet);
    }

    /// Sends CHANNEL_DATA on this channel.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] before the open is confirmed or when
    /// `data` exceeds the peer's maximum packet size.
    pub async fn send_data(&self, data: &[u8]) -> SkiffResult<()> {
        let remote_id = self.confirmed_remote_id()?;

        if let Some(max) = self.remote_max_packet.get() {
            if data.len() > *max as usize {
                return Err(SkiffError::Protocol(format!(
                    "Channel data of {} bytes exceeds peer maximum {}",
                    data.len(),
                    max
                )));
            }
        }

        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelData as u8);
        buf.put_u32(remote_id);
        put_string(&mut buf, data);
        self.transport.send_payload(&buf).await
    }

    /// Sends CHANNEL_EOF on this channel.
    pub async fn send_eof(&self) -> SkiffResult<()> {
        let remote_id = self.confirmed_remote_id()?;
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelEof as u8);
        buf.put_u32(remote_id);
        self.transport.send_payload(&buf).await
    }

    /// Sends CHANNEL_CLOSE on this channel.
    pub async fn send_close(&self) -> SkiffResult<()> {
        let remote_id = self.confirmed_remote_id()?;
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelClose as u8);
        buf.put_u32(remote_id);
        self.transport.send_payload(&buf).await
    }

    /// Grants the peer `delta` additional window bytes.
    pub async fn adjust_window(&self, delta: u32) -> SkiffResult<()> {
        let remote_id = self.confirmed_remote_id()?;
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelWindowAdjust as u8);
        buf.put_u32(remote_id);
        buf.put_u32(delta);
        self.transport.send_payload(&buf).await
    }

    /// Requests a shell on this session channel.
    pub async fn request_shell(&self) -> SkiffResult<()> {
        self.request("shell", &[]).await
    }

    /// Requests command execution on this session channel.
    pub async fn request_exec(&self, command: &str) -> SkiffResult<()> {
        let mut extra = BytesMut::new();
        put_string(&mut extra, command.as_bytes());
        self.request("exec", &extra).await
    }

    /// Requests a subsystem (e.g. "sftp") on this session channel.
    pub async fn request_subsystem(&self, name: &str) -> SkiffResult<()> {
        let mut extra = BytesMut::new();
        put_string(&mut extra, name.as_bytes());
        self.request("subsystem", &extra).await
    }

    /// Sends a CHANNEL_REQUEST with want-reply and waits for the verdict.
    async fn request(&self, request: &str, extra: &[u8]) -> SkiffResult<()> {
        let remote_id = self.confirmed_remote_id()?;

        let (tx, rx) = oneshot::channel();
        *self.reply.lock().await = Some(tx);

        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelRequest as u8);
        buf.put_u32(remote_id);
        put_string(&mut buf, request.as_bytes());
        put_bool(&mut buf, true);
        buf.put_slice(extra);
        self.transport.send_payload(&buf).await?;

        let granted = tokio::time::timeout(RESPONSE_TIMEOUT, rx)
            .await
            .map_err(|_| {
                SkiffError::Timeout(format!("server did not answer {} request", request))
            })?
            .map_err(|_| SkiffError::Closed)?;

        if granted {
            Ok(())
        } else {
            Err(SkiffError::Protocol(format!(
                "Server rejected {} request",
                request
            )))
        }
    }

    async fn complete_reply(&self, granted: bool) {
        if let Some(tx) = self.reply.lock().await.take() {
            let _ = tx.send(granted);
        }
    }
}

struct ChannelEntry {
    channel: Arc<Channel>,
    events: Arc<dyn ChannelEvents>,
    open_tx: Mutex<Option<oneshot::Sender<SkiffResult<()>>>>,
}

/// The connection's channel table.
///
/// Concurrent readers, exclusive writers; local channel numbers are unique
/// for the connection's lifetime.
pub struct ChannelTable {
    transport: Arc<Transport>,
    next_id: AtomicU32,
    entries: RwLock<HashMap<u32, Arc<ChannelEntry>>>,
}

impl ChannelTable {
    /// Creates an empty table.
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            transport,
            next_id: AtomicU32::new(0),
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn entry(&self, local_id: u32) -> Option<Arc<ChannelEntry>> {
        match self.entries.read() {
            Ok(entries) => entries.get(&local_id).cloned(),
            Err(_) => None,
        }
    }

    fn insert(&self, entry: Arc<ChannelEntry>) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(entry.channel.local_id(), entry);
        }
    }

    fn remove(&self, local_id: u32) -> Option<Arc<ChannelEntry>> {
        match self.entries.write() {
            Ok(mut entries) => entries.remove(&local_id),
            Err(_) => None,
        }
    }

    /// Number of live channels (for tests/diagnostics).
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Returns true when no channels are open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Opens an outbound channel and waits for the peer's verdict.
    ///
    /// `extra` carries the channel-type specific fields (e.g. the
    /// direct-tcpip target).
    ///
    /// # Errors
    ///
    /// [`SkiffError::Protocol`] with the peer's reason on OPEN_FAILURE;
    /// timeout/closed errors as usual.
    pub async fn open_channel(
        &self,
        channel_type: &str,
        extra: &[u8],
        events: Arc<dyn ChannelEvents>,
    ) -> SkiffResult<Arc<Channel>> {
        let local_id = self.allocate_id();
        let channel = Arc::new(Channel::new(local_id, Arc::clone(&self.transport)));

        let (tx, rx) = oneshot::channel();
        self.insert(Arc::new(ChannelEntry {
            channel: Arc::clone(&channel),
            events,
            open_tx: Mutex::new(Some(tx)),
        }));

        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpen as u8);
        put_string(&mut buf, channel_type.as_bytes());
        buf.put_u32(local_id);
        buf.put_u32(CHANNEL_WINDOW_DEFAULT);
        buf.put_u32(CHANNEL_MAX_PACKET);
        buf.put_slice(extra);
        self.transport.send_payload(&buf).await?;

        let verdict = tokio::time::timeout(RESPONSE_TIMEOUT, rx)
            .await
            .map_err(|_| {
                self.remove(local_id);
                SkiffError::Timeout(format!("server did not answer {} open", channel_type))
            })?
            .map_err(|_| SkiffError::Closed)?;

        match verdict {
            Ok(()) => Ok(channel),
            Err(e) => {
                self.remove(local_id);
                Err(e)
            }
        }
    }

    /// Allocates the operator for an inbound channel (peer-initiated open)
    /// without making it routable yet. Pair with [`ChannelTable::install`]
    /// once the application accepted the channel.
    pub(crate) fn prepare_inbound(&self, remote_id: u32, remote_max_packet: u32) -> Arc<Channel> {
        let local_id = self.allocate_id();
        let channel = Arc::new(Channel::new(local_id, Arc::clone(&self.transport)));
        channel.confirm(remote_id, remote_max_packet);
        channel
    }

    /// Makes a prepared inbound channel routable under its event handler.
    pub(crate) fn install(&self, channel: Arc<Channel>, events: Arc<dyn ChannelEvents>) {
        self.insert(Arc::new(ChannelEntry {
            channel,
            events,
            open_tx: Mutex::new(None),
        }));
    }

    /// Registers an inbound channel whose event handler is known upfront.
    /// The caller is responsible for sending the confirmation.
    pub(crate) fn register_inbound(
        &self,
        remote_id: u32,
        remote_max_packet: u32,
        events: Arc<dyn ChannelEvents>,
    ) -> Arc<Channel> {
        let channel = self.prepare_inbound(remote_id, remote_max_packet);
        self.install(Arc::clone(&channel), events);
        channel
    }

    /// Routes one CHANNEL_* payload (opcodes 91..=100) to the channel named
    /// by the recipient channel number.
    pub(crate) async fn dispatch(&self, payload: &[u8]) -> SkiffResult<()> {
        let mut reader = Reader::new(payload);
        let opcode = reader.take_u8("message type")?;
        let local_id = reader.take_u32("recipient channel")?;

        let Some(entry) = self.entry(local_id) else {
            warn!("Message for unknown channel {}", local_id);
            return Ok(());
        };

        let events = Arc::clone(&entry.events);
        let result = match MessageType::from_u8(opcode) {
            Some(MessageType::ChannelOpenConfirmation) => {
                let remote_id = reader.take_u32("sender channel")?;
                let _initial_window = reader.take_u32("initial window")?;
                let max_packet = reader.take_u32("maximum packet size")?;

                entry.channel.confirm(remote_id, max_packet);
                if let Some(tx) = entry.open_tx.lock().await.take() {
                    let _ = tx.send(Ok(()));
                }
                debug!(local = local_id, remote = remote_id, "Channel open confirmed");
                events.on_open_confirmation().await
            }
            Some(MessageType::ChannelOpenFailure) => {
                let reason = reader.take_u32("reason code")?;
                let description = reader.take_str("description")?;

                if let Some(tx) = entry.open_tx.lock().await.take() {
                    let _ = tx.send(Err(SkiffError::Protocol(format!(
                        "Channel open rejected (reason {}): {}",
                        reason, description
                    ))));
                }
                self.remove(local_id);
                events.on_open_failure(reason, &description).await
            }
            Some(MessageType::ChannelWindowAdjust) => {
                let delta = reader.take_u32("window delta")?;
                events.on_window_adjust(delta).await
            }
            Some(MessageType::ChannelData) => {
                let data = reader.take_string("data")?;
                events.on_data(data).await
            }
            Some(MessageType::ChannelExtendedData) => {
                let data_type = reader.take_u32("data type")?;
                let data = reader.take_string("data")?;
                events.on_extended_data(data_type, data).await
            }
            Some(MessageType::ChannelEof) => events.on_eof().await,
            Some(MessageType::ChannelClose) => {
                // Entry is removed first so the handler is disposed exactly
                // once even if the peer repeats the close.
                self.remove(local_id);
                events.on_close().await
            }
            Some(MessageType::ChannelRequest) => {
                let request = reader.take_str("request type")?;
                let want_reply = reader.take_bool("want reply")?;
                let data = reader.take_raw(reader.remaining(), "request data")?;
                events.on_request(&request, want_reply, data).await
            }
            Some(MessageType::ChannelSuccess) => {
                entry.channel.complete_reply(true).await;
                Ok(())
            }
            Some(MessageType::ChannelFailure) => {
                entry.channel.complete_reply(false).await;
                Ok(())
            }
            _ => Ok(()),
        };

        if let Err(e) = result {
            warn!("Channel {} handler failed: {}", local_id, e);
        }

        Ok(())
    }

    /// Notifies every channel handler of the connection close and clears
    /// the table.
    pub(crate) async fn notify_closed(&self) {
        let entries: Vec<Arc<ChannelEntry>> = match self.entries.write() {
            Ok(mut map) => map.drain().map(|(_, v)| v).collect(),
            Err(_) => Vec::new(),
        };

        for entry in entries {
            if let Some(tx) = entry.open_tx.lock().await.take() {
                let _ = tx.send(Err(SkiffError::Closed));
            }
            if let Err(e) = entry.events.on_close().await {
                warn!("Channel close handler failed: {}", e);
            }
        }
    }
}
