//! The key-exchange state machine.
//!
//! [`KeyExchanger`] is a packet interceptor that owns opcodes 20, 21, and
//! 30-49 while an exchange runs. Either side may trigger it at any point
//! after the version exchange:
//!
//! - client-initiated: [`KeyExchanger::execute`] sends our KEXINIT and
//!   drives the handshake on the caller's task;
//! - server-initiated: an incoming KEXINIT in the idle phase spawns the
//!   same handshake as a background task.
//!
//! The cipher swap is atomic at NEWKEYS: the outbound pair is installed in
//! the same critical section that sends our NEWKEYS, the inbound pair at
//! the instant the peer's NEWKEYS is consumed on the reader task. During a
//! rekey every packet, the key-exchange messages included, continues under
//! the old keys until that point.

use crate::ssh::hostkey::{HostKey, HostKeyVerifier};
use crate::ssh::interceptor::{
    CloseHandle, InterceptOutcome, PacketInterceptor, ResponseSlot, RESPONSE_TIMEOUT,
};
use crate::ssh::kex::{negotiate, KexInit, NegotiatedAlgorithms, NewKeys};
use crate::ssh::kex_dh::{
    compute_exchange_hash, derive_cipher_settings, DhExchange, ExchangeHashParams,
};
use crate::ssh::message::MessageType;
use crate::ssh::transport::Transport;
use crate::ssh::wire::{put_mpint, Reader};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use skiff_platform::{SkiffError, SkiffResult};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info};
use zeroize::Zeroize;

/// Phase of the key-exchange state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexPhase {
    /// No exchange in flight.
    Idle,
    /// We sent KEXINIT and await the server's.
    InitiatedByClient,
    /// The server's KEXINIT arrived first; exchange runs in the background.
    InitiatedByServer,
    /// Both KEXINITs present, negotiating.
    KexInitReceived,
    /// KEXDH_INIT sent, awaiting KEXDH_REPLY.
    WaitKexDhReply,
    /// Our NEWKEYS sent, awaiting the peer's.
    WaitNewKeys,
    /// Peer NEWKEYS consumed, inbound cipher being installed.
    WaitUpdateCipher,
    /// A fatal error ended the exchange.
    Failed,
    /// The connection closed underneath the exchange.
    ConnectionClosed,
}

/// Static configuration for the key exchanger.
pub struct KexConfig {
    /// Server host name (for the verification callback).
    pub host: String,
    /// Server port (for the verification callback).
    pub port: u16,
    /// Our identification line, without the line terminator.
    pub client_version: String,
    /// The server's identification line, without the line terminator.
    pub server_version: String,
    /// Host key algorithm preference (e.g. ssh-rsa, ssh-dss).
    pub host_key_algorithms: Vec<String>,
    /// Cipher preference list, most preferred first.
    pub encryption_algorithms: Vec<String>,
    /// Optional host key verification callback, consulted on the first
    /// exchange only.
    pub verifier: Option<HostKeyVerifier>,
}

/// The key exchanger interceptor.
pub struct KeyExchanger {
    transport: Arc<Transport>,
    config: KexConfig,
    session_id: Arc<OnceLock<Vec<u8>>>,
    phase: Mutex<KexPhase>,
    slot: ResponseSlot,
    pending_inbound: Mutex<Option<(crate::ssh::crypto::Cipher, crate::ssh::crypto::MacKey)>>,
    pending_ready: Notify,
    negotiated: Mutex<Option<NegotiatedAlgorithms>>,
    close: CloseHandle,
    self_ref: Weak<KeyExchanger>,
}

impl KeyExchanger {
    /// Creates the key exchanger.
    ///
    /// `session_id` is the connection-wide slot the first exchange hash is
    /// written into; later exchanges leave it untouched.
    pub fn new(
        transport: Arc<Transport>,
        config: KexConfig,
        session_id: Arc<OnceLock<Vec<u8>>>,
        close: CloseHandle,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            transport,
            config,
            session_id,
            phase: Mutex::new(KexPhase::Idle),
            slot: ResponseSlot::new(),
            pending_inbound: Mutex::new(None),
            pending_ready: Notify::new(),
            negotiated: Mutex::new(None),
            close,
            self_ref: weak.clone(),
        })
    }

    /// Returns the current phase.
    pub async fn phase(&self) -> KexPhase {
        *self.phase.lock().await
    }

    /// Returns the algorithms negotiated by the most recent exchange.
    pub async fn negotiated_algorithms(&self) -> Option<NegotiatedAlgorithms> {
        self.negotiated.lock().await.clone()
    }

    /// Runs a client-initiated key exchange (initial connect or rekey) and
    /// blocks until both NEWKEYS have been exchanged.
    ///
    /// # Errors
    ///
    /// Any negotiation, parse, verification, or timeout failure is fatal:
    /// the connection close is requested and the error returned.
    pub async fn execute(&self) -> SkiffResult<()> {
        {
            let mut phase = self.phase.lock().await;
            match *phase {
                KexPhase::Idle => *phase = KexPhase::InitiatedByClient,
                KexPhase::ConnectionClosed => return Err(SkiffError::Closed),
                _ => {
                    return Err(SkiffError::Protocol(
                        "A key exchange is already in flight".to_string(),
                    ))
                }
            }
        }

        match self.run_exchange().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    async fn fail(&self, error: &SkiffError) {
        error!("Key exchange failed: {}", error);
        *self.phase.lock().await = KexPhase::Failed;
        self.close.request_close();
    }

    async fn set_phase(&self, phase: KexPhase) {
        *self.phase.lock().await = phase;
    }

    /// Drives one full exchange. The caller has already moved the phase out
    /// of `Idle`; for server-initiated runs the peer's KEXINIT is waiting
    /// in the response slot.
    async fn run_exchange(&self) -> SkiffResult<()> {
        // 1. KEXINIT exchange
        let ours = KexInit::new_client(
            &self.config.host_key_algorithms,
            &self.config.encryption_algorithms,
        );
        let our_payload = ours.to_bytes();
        self.transport.send_payload(&our_payload).await?;

        let their_payload = self.slot.await_response("SSH_MSG_KEXINIT").await?;
        self.set_phase(KexPhase::KexInitReceived).await;

        let theirs = KexInit::from_bytes(&their_payload)?;
        let negotiated = negotiate(&ours, &theirs)?;
        debug!(
            kex = negotiated.kex.name(),
            host_key = %negotiated.host_key,
            cipher_out = negotiated.cipher_out.name(),
            cipher_in = negotiated.cipher_in.name(),
            "Negotiated algorithms"
        );

        // 2. KEXDH_INIT
        let dh = DhExchange::new(negotiated.kex);
        let mut init = BytesMut::new();
        init.put_u8(MessageType::KexdhInit as u8);
        put_mpint(&mut init, dh.public_value());
        self.set_phase(KexPhase::WaitKexDhReply).await;
        self.transport.send_payload(&init).await?;

        // 3. KEXDH_REPLY
        let reply = self.slot.await_response("SSH_MSG_KEXDH_REPLY").await?;
        let mut reader = Reader::new(&reply);
        let opcode = reader.take_u8("message type")?;
        if opcode != MessageType::KexdhReply as u8 {
            return Err(SkiffError::Protocol(format!(
                "Expected SSH_MSG_KEXDH_REPLY, got opcode {}",
                opcode
            )));
        }
        let host_key_blob = reader.take_string("host key")?;
        let server_public = reader.take_mpint("f")?;
        let signature = reader.take_string("signature")?;

        let mut shared_secret = dh.compute_shared_secret(server_public)?;

        let exchange_hash = compute_exchange_hash(
            negotiated.kex.hash(),
            &ExchangeHashParams {
                client_version: &self.config.client_version,
                server_version: &self.config.server_version,
                client_kexinit: &our_payload,
                server_kexinit: &their_payload,
                host_key_blob,
                client_public: dh.public_value(),
                server_public,
                shared_secret: &shared_secret,
            },
        );

        let host_key = HostKey::parse(host_key_blob, &negotiated.host_key)?;
        host_key.verify_exchange_hash(&exchange_hash, signature)?;

        // The session identifier is the exchange hash of the FIRST exchange
        // and never changes afterwards.
        let first_exchange = self.session_id.set(exchange_hash.clone()).is_ok();
        if first_exchange {
            if let Some(verifier) = &self.config.verifier {
                if !verifier(&self.config.host, self.config.port, &host_key) {
                    return Err(SkiffError::Security(format!(
                        "Host key rejected by verifier: {}",
                        host_key.fingerprint()
                    )));
                }
            }
        }

        let session_id = self
            .session_id
            .get()
            .ok_or_else(|| SkiffError::Protocol("Session identifier missing".to_string()))?;

        // 4. NEWKEYS
        let settings =
            derive_cipher_settings(&negotiated, &shared_secret, &exchange_hash, session_id)?;
        shared_secret.zeroize();

        // Phase first, then the pending pair: the reader task finishes the
        // swap (and moves the phase to Idle) strictly after both writes.
        self.set_phase(KexPhase::WaitNewKeys).await;
        *self.pending_inbound.lock().await =
            Some((settings.inbound_cipher, settings.inbound_mac));
        self.pending_ready.notify_one();
        self.transport
            .rekey_outbound(
                &NewKeys.to_bytes(),
                settings.outbound_cipher,
                settings.outbound_mac,
            )
            .await?;

        // The interceptor installs the inbound pair when the peer's NEWKEYS
        // arrives, then confirms through the slot.
        let _ = self.slot.await_response("SSH_MSG_NEWKEYS").await?;

        *self.negotiated.lock().await = Some(negotiated);
        info!(rekey = !first_exchange, "Key exchange complete");
        Ok(())
    }

    fn spawn_server_initiated(&self) {
        if let Some(me) = self.self_ref.upgrade() {
            tokio::spawn(async move {
                if let Err(e) = me.run_exchange().await {
                    me.fail(&e).await;
                }
            });
        }
    }
}

#[async_trait]
impl PacketInterceptor for KeyExchanger {
    async fn intercept_packet(&self, payload: &[u8]) -> InterceptOutcome {
        let Some(opcode) = payload.first().copied() else {
            return InterceptOutcome::PassThrough;
        };

        if opcode == MessageType::KexInit as u8 {
            let phase = {
                let mut phase = self.phase.lock().await;
                let current = *phase;
                if current == KexPhase::Idle {
                    *phase = KexPhase::InitiatedByServer;
                }
                current
            };
            match phase {
                KexPhase::Idle => {
                    debug!("Server-initiated key exchange");
                    self.slot.deliver(payload.to_vec()).await;
                    self.spawn_server_initiated();
                }
                KexPhase::InitiatedByClient => {
                    self.slot.deliver(payload.to_vec()).await;
                }
                _ => {
                    self.fail(&SkiffError::Protocol(
                        "Unexpected SSH_MSG_KEXINIT during key exchange".to_string(),
                    ))
                    .await;
                }
            }
            return InterceptOutcome::Consumed;
        }

        if opcode == MessageType::KexdhReply as u8 {
            if self.phase().await == KexPhase::WaitKexDhReply {
                self.slot.deliver(payload.to_vec()).await;
            } else {
                self.fail(&SkiffError::Protocol(
                    "Unexpected SSH_MSG_KEXDH_REPLY".to_string(),
                ))
                .await;
            }
            return InterceptOutcome::Consumed;
        }

        if opcode == MessageType::NewKeys as u8 {
            // The peer may send NEWKEYS right after its KEXDH_REPLY, before
            // our driver has derived keys and sent our own; wait briefly
            // for the sender side to publish the pending inbound pair.
            let phase = self.phase().await;
            if !matches!(phase, KexPhase::WaitKexDhReply | KexPhase::WaitNewKeys) {
                self.fail(&SkiffError::Protocol(
                    "Unexpected SSH_MSG_NEWKEYS".to_string(),
                ))
                .await;
                return InterceptOutcome::Consumed;
            }

            self.set_phase(KexPhase::WaitUpdateCipher).await;
            let pending = tokio::time::timeout(RESPONSE_TIMEOUT, async {
                loop {
                    if let Some(pair) = self.pending_inbound.lock().await.take() {
                        return pair;
                    }
                    self.pending_ready.notified().await;
                }
            })
            .await;

            match pending {
                Ok((cipher, mac)) => {
                    // Swap before the next packet is read; the reader task
                    // is parked in this interceptor until we return.
                    self.transport.rekey_inbound(cipher, mac).await;
                }
                Err(_) => {
                    self.fail(&SkiffError::Protocol(
                        "NEWKEYS received before cipher derivation completed".to_string(),
                    ))
                    .await;
                    return InterceptOutcome::Consumed;
                }
            }
            self.set_phase(KexPhase::Idle).await;
            self.slot.deliver(payload.to_vec()).await;
            return InterceptOutcome::Consumed;
        }

        InterceptOutcome::PassThrough
    }

    async fn on_connection_closed(&self) {
        *self.phase.lock().await = KexPhase::ConnectionClosed;
        self.slot.deliver_closed();
    }

    fn name(&self) -> &'static str {
        "key-exchanger"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn test_exchanger() -> Arc<KeyExchanger> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, _server) =
            tokio::join!(async { TcpStream::connect(addr).await.unwrap() }, async {
                listener.accept().await.unwrap()
            });

        let (r, w) = client.into_split();
        let (close, _rx) = CloseHandle::new();
        KeyExchanger::new(
            Arc::new(Transport::new(r, w)),
            KexConfig {
                host: "localhost".to_string(),
                port: 22,
                client_version: "SSH-2.0-Skiff_0.1.0".to_string(),
                server_version: "SSH-2.0-Test".to_string(),
                host_key_algorithms: vec!["ssh-rsa".to_string()],
                encryption_algorithms: vec!["aes128-ctr".to_string()],
                verifier: None,
            },
            Arc::new(OnceLock::new()),
            close,
        )
    }

    #[tokio::test]
    async fn test_starts_idle() {
        let kex = test_exchanger().await;
        assert_eq!(kex.phase().await, KexPhase::Idle);
        assert!(kex.negotiated_algorithms().await.is_none());
    }

    #[tokio::test]
    async fn test_ignores_unrelated_opcodes() {
        let kex = test_exchanger().await;
        assert_eq!(
            kex.intercept_packet(&[94, 0, 0, 0, 0]).await,
            InterceptOutcome::PassThrough
        );
        assert_eq!(kex.phase().await, KexPhase::Idle);
    }

    #[tokio::test]
    async fn test_unexpected_newkeys_is_fatal() {
        let kex = test_exchanger().await;
        assert_eq!(
            kex.intercept_packet(&[21]).await,
            InterceptOutcome::Consumed
        );
        assert_eq!(kex.phase().await, KexPhase::Failed);
        assert!(kex.close.is_closed());
    }

    #[tokio::test]
    async fn test_close_unblocks_and_marks_phase() {
        let kex = test_exchanger().await;
        kex.on_connection_closed().await;
        assert_eq!(kex.phase().await, KexPhase::ConnectionClosed);
        assert!(matches!(kex.execute().await, Err(SkiffError::Closed)));
    }
}
