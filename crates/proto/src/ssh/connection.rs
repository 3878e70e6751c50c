//! The SSH client connection.
//!
//! [`Connection`] owns the socket, the transport framer, the interceptor
//! chain, and the channel table. [`Connection::connect`] performs the
//! version exchange, the first key exchange, and user authentication, then
//! leaves a reader task pumping inbound packets through the interceptor
//! chain; whatever no interceptor claims lands in the default dispatch
//! (disconnect, ignore, debug, channel messages).

use crate::ssh::agent::{AgentForwarder, AgentKeyProvider};
use crate::ssh::authenticator::{AuthCredentials, AuthState, Authenticator};
use crate::ssh::channel::{Channel, ChannelEvents, ChannelTable, OpenFailureReason};
use crate::ssh::forwarding::{ForwardAddr, ForwardedPortHandler, LocalForward, RemotePortForwarder};
use crate::ssh::hostkey::HostKeyVerifier;
use crate::ssh::interceptor::{CloseHandle, InterceptorChain};
use crate::ssh::kex::NegotiatedAlgorithms;
use crate::ssh::kex_driver::{KexConfig, KeyExchanger};
use crate::ssh::message::{disconnect_reason, MessageType};
use crate::ssh::transport::Transport;
use crate::ssh::version::{read_remote_version, Version};
use crate::ssh::wire::{put_string, Reader};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use skiff_platform::{SkiffError, SkiffResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Connection-level event handler.
///
/// Handler failures are logged and swallowed; a misbehaving handler never
/// corrupts the protocol state.
#[async_trait]
pub trait ConnectionEvents: Send + Sync {
    /// An authentication banner arrived.
    async fn on_banner(&self, _message: &str) -> SkiffResult<()> {
        Ok(())
    }
    /// Asynchronous (keyboard-interactive) authentication completed.
    async fn on_authentication_complete(&self, _success: bool) -> SkiffResult<()> {
        Ok(())
    }
    /// The peer sent SSH_MSG_IGNORE.
    async fn on_ignore(&self, _data: &[u8]) -> SkiffResult<()> {
        Ok(())
    }
    /// The peer sent SSH_MSG_DEBUG.
    async fn on_debug(&self, _always_display: bool, _message: &str) -> SkiffResult<()> {
        Ok(())
    }
    /// The peer disconnected.
    async fn on_disconnected(&self, _reason: u32, _message: &str) -> SkiffResult<()> {
        Ok(())
    }
    /// A fatal transport error ended the connection.
    async fn on_error(&self, _error: &SkiffError) -> SkiffResult<()> {
        Ok(())
    }
    /// An opcode no interceptor or dispatch rule knows arrived.
    async fn on_unknown_packet(&self, _opcode: u8) -> SkiffResult<()> {
        Ok(())
    }
}

/// Event handler that ignores everything.
pub struct NullEvents;

#[async_trait]
impl ConnectionEvents for NullEvents {}

/// Parameters for one connection attempt.
///
/// Cloned at construction; later mutation by the caller has no effect on a
/// live connection.
#[derive(Clone)]
pub struct ConnectionParams {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// User name to authenticate as.
    pub username: String,
    /// Credentials for the configured authentication method.
    pub credentials: AuthCredentials,
    /// Software identifier for the version line ("SSH-2.0-<identifier>").
    pub identifier: String,
    /// Line terminator for the version exchange, typically CRLF.
    pub eol: String,
    /// Cipher preference list, most preferred first.
    pub encryption_algorithms: Vec<String>,
    /// Host key algorithm preference list.
    pub host_key_algorithms: Vec<String>,
    /// Optional host key verification callback (first key exchange only).
    pub host_key_verifier: Option<HostKeyVerifier>,
    /// Optional agent key provider; enables agent forwarding.
    pub agent_provider: Option<Arc<dyn AgentKeyProvider>>,
}

impl ConnectionParams {
    /// Creates parameters with the default algorithm preferences.
    pub fn new(host: &str, port: u16, username: &str, credentials: AuthCredentials) -> Self {
        Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
            credentials,
            identifier: "Skiff_0.1.0".to_string(),
            eol: "\r\n".to_string(),
            encryption_algorithms: vec![
                "aes256-ctr".to_string(),
                "aes128-ctr".to_string(),
                "3des-cbc".to_string(),
                "blowfish-cbc".to_string(),
            ],
            host_key_algorithms: vec!["ssh-rsa".to_string(), "ssh-dss".to_string()],
            host_key_verifier: None,
            agent_provider: None,
        }
    }
}

impl std::fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("credentials", &self.credentials)
            .field("identifier", &self.identifier)
            .field("encryption_algorithms", &self.encryption_algorithms)
            .field("host_key_algorithms", &self.host_key_algorithms)
            .field(
                "host_key_verifier",
                &self.host_key_verifier.as_ref().map(|_| "<callback>"),
            )
            .field(
                "agent_provider",
                &self.agent_provider.as_ref().map(|_| "<provider>"),
            )
            .finish()
    }
}

/// An established (or establishing) SSH client connection.
pub struct Connection {
    params: ConnectionParams,
    transport: Arc<Transport>,
    chain: Arc<InterceptorChain>,
    channels: Arc<ChannelTable>,
    session_id: Arc<OnceLock<Vec<u8>>>,
    kex: Arc<KeyExchanger>,
    authenticator: Arc<Authenticator>,
    forwarder: Arc<RemotePortForwarder>,
    events: Arc<dyn ConnectionEvents>,
    close: CloseHandle,
    open: AtomicBool,
}

impl Connection {
    /// Connects, exchanges versions and keys, and authenticates.
    ///
    /// For keyboard-interactive the call returns once the prompt loop is
    /// running ([`AuthState::AwaitingPromptResponse`]); the outcome arrives
    /// through [`ConnectionEvents::on_authentication_complete`].
    ///
    /// # Errors
    ///
    /// Negotiation, host key, and transport errors surface here, as does
    /// [`SkiffError::Authentication`] when the server rejects the
    /// credentials; in every error case the socket is closed.
    pub async fn connect(
        params: ConnectionParams,
        events: Arc<dyn ConnectionEvents>,
    ) -> SkiffResult<Arc<Self>> {
        let mut stream = TcpStream::connect((params.host.as_str(), params.port))
            .await
            .map_err(SkiffError::Io)?;

        // Version exchange
        let client_line = Version::new(&params.identifier, None).to_string();
        stream
            .write_all(format!("{}{}", client_line, params.eol).as_bytes())
            .await
            .map_err(SkiffError::Io)?;
        let server_line = read_remote_version(&mut stream).await?;
        Version::parse(&server_line)?;
        debug!(server = %server_line, "Version exchange complete");

        let (read_half, write_half) = stream.into_split();
        let transport = Arc::new(Transport::new(read_half, write_half));
        let (close, close_rx) = CloseHandle::new();
        let session_id: Arc<OnceLock<Vec<u8>>> = Arc::new(OnceLock::new());
        let chain = Arc::new(InterceptorChain::new());
        let channels = Arc::new(ChannelTable::new(Arc::clone(&transport)));

        let kex = KeyExchanger::new(
            Arc::clone(&transport),
            KexConfig {
                host: params.host.clone(),
                port: params.port,
                client_version: client_line,
                server_version: server_line,
                host_key_algorithms: params.host_key_algorithms.clone(),
                encryption_algorithms: params.encryption_algorithms.clone(),
                verifier: params.host_key_verifier.clone(),
            },
            Arc::clone(&session_id),
            close.clone(),
        );
        chain.push(kex.clone()).await;

        let authenticator = Authenticator::new(
            Arc::clone(&transport),
            params.username.clone(),
            params.credentials.clone(),
            Arc::clone(&session_id),
            Arc::clone(&events),
            close.clone(),
        );
        let forwarder =
            RemotePortForwarder::new(Arc::clone(&transport), Arc::clone(&channels), close.clone());
        let agent = AgentForwarder::new(
            Arc::clone(&transport),
            Arc::clone(&channels),
            params.agent_provider.clone(),
        );

        let connection = Arc::new(Self {
            params,
            transport,
            chain: Arc::clone(&chain),
            channels,
            session_id,
            kex,
            authenticator,
            forwarder,
            events,
            close: close.clone(),
            open: AtomicBool::new(false),
        });

        // The reader task must be pumping before the first key exchange.
        tokio::spawn(Arc::clone(&connection).run_reader(close_rx));

        connection.kex.execute().await?;

        // The authenticator joins the chain only after the first key
        // exchange succeeded; it needs the session identifier.
        chain.push(connection.authenticator.clone()).await;
        match connection.authenticator.execute().await {
            Ok(AuthState::Success) | Ok(AuthState::AwaitingPromptResponse) => {}
            Ok(state) => {
                connection.close.request_close();
                return Err(SkiffError::Authentication(format!(
                    "Authentication ended in state {:?}",
                    state
                )));
            }
            Err(e) => {
                connection.close.request_close();
                return Err(e);
            }
        }

        chain.push(connection.forwarder.clone()).await;
        chain.push(agent).await;

        connection.open.store(true, Ordering::SeqCst);
        info!(
            host = %connection.params.host,
            port = connection.params.port,
            user = %connection.params.username,
            "Connection established"
        );
        Ok(connection)
    }

    /// Whether the connection is established and not torn down.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.close.is_closed()
    }

    /// The session identifier: the exchange hash of the first key exchange.
    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.session_id.get().cloned()
    }

    /// Current authentication state.
    pub async fn auth_state(&self) -> AuthState {
        self.authenticator.state().await
    }

    /// Algorithms negotiated by the most recent key exchange.
    pub async fn negotiated_algorithms(&self) -> Option<NegotiatedAlgorithms> {
        self.kex.negotiated_algorithms().await
    }

    /// Triggers a client-initiated rekey and waits for it to complete.
    pub async fn rekey(&self) -> SkiffResult<()> {
        self.kex.execute().await
    }

    /// Opens a session channel and requests a shell on it.
    pub async fn open_shell(&self, events: Arc<dyn ChannelEvents>) -> SkiffResult<Arc<Channel>> {
        let channel = self.open_session(events).await?;
        channel.request_shell().await?;
        Ok(channel)
    }

    /// Opens a session channel and executes `command` on it.
    pub async fn exec_command(
        &self,
        command: &str,
        events: Arc<dyn ChannelEvents>,
    ) -> SkiffResult<Arc<Channel>> {
        let channel = self.open_session(events).await?;
        channel.request_exec(command).await?;
        Ok(channel)
    }

    /// Opens a session channel and starts the named subsystem on it.
    pub async fn open_subsystem(
        &self,
        name: &str,
        events: Arc<dyn ChannelEvents>,
    ) -> SkiffResult<Arc<Channel>> {
        let channel = self.open_session(events).await?;
        channel.request_subsystem(name).await?;
        Ok(channel)
    }

    async fn open_session(&self, events: Arc<dyn ChannelEvents>) -> SkiffResult<Arc<Channel>> {
        self.require_open()?;
        self.channels.open_channel("session", &[], events).await
    }

    /// Binds a local listener and relays connections through direct-tcpip
    /// channels to `target_host:target_port`.
    pub async fn forward_local_port(
        &self,
        bind_addr: &str,
        target_host: &str,
        target_port: u32,
    ) -> SkiffResult<LocalForward> {
        self.require_open()?;

        let listener = TcpListener::bind(bind_addr).await.map_err(SkiffError::Io)?;
        let local = listener.local_addr().map_err(SkiffError::Io)?;

        Ok(LocalForward::new(
            listener,
            ForwardAddr::new(local.ip().to_string(), u32::from(local.port())),
            ForwardAddr::new(target_host, target_port),
            Arc::clone(&self.channels),
        ))
    }

    /// Asks the server to listen on `addr:port`; returns the effective
    /// port (server-assigned when `port` is 0).
    pub async fn listen_forwarded_port(
        &self,
        handler: Arc<dyn ForwardedPortHandler>,
        addr: &str,
        port: u32,
    ) -> SkiffResult<u32> {
        self.require_open()?;
        self.forwarder.listen(handler, addr, port).await
    }

    /// Cancels a remote bind; port 0 cancels every bind.
    pub async fn cancel_forwarded_port(&self, addr: &str, port: u32) -> SkiffResult<()> {
        self.require_open()?;
        self.forwarder.cancel(addr, port).await
    }

    /// Sends an SSH_MSG_IGNORE with the given payload (keep-alive and
    /// traffic shaping).
    pub async fn send_ignorable(&self, data: &[u8]) -> SkiffResult<()> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Ignore as u8);
        put_string(&mut buf, data);
        self.transport.send_payload(&buf).await
    }

    /// Sends SSH_MSG_DISCONNECT and tears the connection down.
    pub async fn disconnect(&self, reason_code: u32, message: &str) -> SkiffResult<()> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Disconnect as u8);
        buf.put_u32(reason_code);
        put_string(&mut buf, message.as_bytes());
        put_string(&mut buf, b"");

        let result = self.transport.send_payload(&buf).await;
        self.close.request_close();
        result
    }

    /// Sends SSH_MSG_DISCONNECT with the standard "by application" reason.
    pub async fn disconnect_by_application(&self) -> SkiffResult<()> {
        self.disconnect(disconnect_reason::BY_APPLICATION, "disconnected by application")
            .await
    }

    fn require_open(&self) -> SkiffResult<()> {
        if self.close.is_closed() {
            return Err(SkiffError::Closed);
        }
        Ok(())
    }

    /// The reader task: pumps inbound packets through the interceptor
    /// chain and the default dispatch until close or a fatal error.
    async fn run_reader(self: Arc<Self>, mut close_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = close_rx.changed() => break,
                result = self.transport.read_payload() => match result {
                    Ok((payload, sequence)) => {
                        if payload.is_empty() {
                            continue;
                        }
                        if !self.chain.offer(&payload).await {
                            self.dispatch_default(&payload, sequence).await;
                        }
                    }
                    Err(e) => {
                        if !self.close.is_closed() {
                            error!("Transport failed: {}", e);
                            if let Err(he) = self.events.on_error(&e).await {
                                warn!("Error handler failed: {}", he);
                            }
                        }
                        break;
                    }
                },
            }
        }

        self.teardown().await;
    }

    /// Handles packets no interceptor claimed.
    async fn dispatch_default(&self, payload: &[u8], sequence: u32) {
        let opcode = payload[0];

        let result: SkiffResult<()> = match MessageType::from_u8(opcode) {
            Some(MessageType::Disconnect) => self.handle_disconnect(payload).await,
            Some(MessageType::Ignore) => {
                let mut reader = Reader::new(&payload[1..]);
                let data = reader.take_string("ignored data").unwrap_or(&[]);
                self.events.on_ignore(data).await
            }
            Some(MessageType::Debug) => self.handle_debug(payload).await,
            Some(MessageType::Unimplemented) => {
                debug!("Peer reported an unimplemented message");
                Ok(())
            }
            Some(MessageType::ChannelOpen) => {
                // No interceptor wanted this channel type
                self.reject_channel_open(payload).await
            }
            Some(mt)
                if (MessageType::ChannelOpenConfirmation as u8
                    ..=MessageType::ChannelFailure as u8)
                    .contains(&(mt as u8)) =>
            {
                self.channels.dispatch(payload).await
            }
            _ => {
                debug!(opcode, "Unknown packet, answering UNIMPLEMENTED");
                if let Err(e) = self.events.on_unknown_packet(opcode).await {
                    warn!("Unknown-packet handler failed: {}", e);
                }
                self.send_unimplemented(sequence).await
            }
        };

        if let Err(e) = result {
            warn!(opcode, "Dispatch failed: {}", e);
        }
    }

    async fn handle_disconnect(&self, payload: &[u8]) -> SkiffResult<()> {
        let mut reader = Reader::new(&payload[1..]);
        let reason = reader.take_u32("reason code").unwrap_or(0);
        let message = reader.take_str("description").unwrap_or_default();

        info!(reason, message = %message, "Peer disconnected");
        if let Err(e) = self.events.on_disconnected(reason, &message).await {
            warn!("Disconnect handler failed: {}", e);
        }
        self.close.request_close();
        Ok(())
    }

    async fn handle_debug(&self, payload: &[u8]) -> SkiffResult<()> {
        let mut reader = Reader::new(&payload[1..]);
        let always_display = reader.take_bool("always display").unwrap_or(false);
        let message = reader.take_str("debug message").unwrap_or_default();

        self.events.on_debug(always_display, &message).await
    }

    async fn reject_channel_open(&self, payload: &[u8]) -> SkiffResult<()> {
        let mut reader = Reader::new(&payload[1..]);
        let channel_type = reader.take_str("channel type")?;
        let remote_channel = reader.take_u32("sender channel")?;

        debug!(channel_type = %channel_type, "Rejecting unsupported channel open");

        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenFailure as u8);
        buf.put_u32(remote_channel);
        buf.put_u32(OpenFailureReason::UnknownChannelType.code());
        put_string(
            &mut buf,
            OpenFailureReason::UnknownChannelType.description().as_bytes(),
        );
        put_string(&mut buf, b"");
        self.transport.send_payload(&buf).await
    }

    async fn send_unimplemented(&self, sequence: u32) -> SkiffResult<()> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Unimplemented as u8);
        buf.put_u32(sequence);
        self.transport.send_payload(&buf).await
    }

    async fn teardown(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.close.request_close();
        self.chain.notify_closed().await;
        self.channels.notify_closed().await;
        self.transport.shutdown().await;
        debug!("Connection torn down");
    }
}
