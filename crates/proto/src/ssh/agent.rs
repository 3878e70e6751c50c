//! SSH agent forwarding ("auth-agent@openssh.com").
//!
//! [`AgentForwarder`] is a packet interceptor that accepts the server's
//! agent channel opens and answers the standard OpenSSH agent protocol
//! using a configured [`AgentKeyProvider`]. Without a provider (or with a
//! disabled one) every agent channel open is rejected.
//!
//! Agent messages are length-framed inside the channel byte stream:
//! `uint32 length || byte type || contents`.

use crate::ssh::channel::{
    Channel, ChannelEvents, ChannelTable, OpenFailureReason, CHANNEL_MAX_PACKET,
    CHANNEL_WINDOW_DEFAULT,
};
use crate::ssh::interceptor::{InterceptOutcome, PacketInterceptor};
use crate::ssh::message::MessageType;
use crate::ssh::transport::Transport;
use crate::ssh::wire::{put_string, Reader};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use skiff_platform::{SkiffError, SkiffResult};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// SSH_AGENT_FAILURE
const AGENT_FAILURE: u8 = 5;
/// SSH_AGENTC_REQUEST_IDENTITIES
const AGENTC_REQUEST_IDENTITIES: u8 = 11;
/// SSH_AGENT_IDENTITIES_ANSWER
const AGENT_IDENTITIES_ANSWER: u8 = 12;
/// SSH_AGENTC_SIGN_REQUEST
const AGENTC_SIGN_REQUEST: u8 = 13;
/// SSH_AGENT_SIGN_RESPONSE
const AGENT_SIGN_RESPONSE: u8 = 14;

/// One key offered by the agent provider.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    /// Public key blob in SSH wire format.
    pub key_blob: Vec<u8>,
    /// Free-form comment.
    pub comment: String,
}

/// Source of agent keys and signatures.
#[async_trait]
pub trait AgentKeyProvider: Send + Sync {
    /// Whether agent forwarding is currently allowed.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Lists the identities the agent offers.
    async fn identities(&self) -> SkiffResult<Vec<AgentIdentity>>;

    /// Signs `data` with the key identified by `key_blob`.
    ///
    /// Returns the signature blob (`string algorithm || string signature`).
    async fn sign(&self, key_blob: &[u8], data: &[u8], flags: u32) -> SkiffResult<Vec<u8>>;
}

/// The agent forwarder interceptor.
pub struct AgentForwarder {
    transport: Arc<Transport>,
    channels: Arc<ChannelTable>,
    provider: Option<Arc<dyn AgentKeyProvider>>,
    self_ref: Weak<AgentForwarder>,
}

impl AgentForwarder {
    /// Creates the forwarder. `provider` of `None` rejects all agent
    /// channels.
    pub fn new(
        transport: Arc<Transport>,
        channels: Arc<ChannelTable>,
        provider: Option<Arc<dyn AgentKeyProvider>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            transport,
            channels,
            provider,
            self_ref: weak.clone(),
        })
    }

    async fn handle_agent_open(&self, payload: Vec<u8>) -> SkiffResult<()> {
        let mut reader = Reader::new(&payload);
        let _opcode = reader.take_u8("message type")?;
        let _channel_type = reader.take_str("channel type")?;
        let remote_channel = reader.take_u32("sender channel")?;
        let _initial_window = reader.take_u32("initial window")?;
        let max_packet = reader.take_u32("maximum packet size")?;

        let provider = match &self.provider {
            Some(provider) if provider.is_enabled() => Arc::clone(provider),
            _ => {
                debug!("Rejecting agent channel: no enabled provider");
                let mut buf = BytesMut::new();
                buf.put_u8(MessageType::ChannelOpenFailure as u8);
                buf.put_u32(remote_channel);
                buf.put_u32(OpenFailureReason::AdministrativelyProhibited.code());
                put_string(&mut buf, b"agent forwarding disabled");
                put_string(&mut buf, b"");
                return self.transport.send_payload(&buf).await;
            }
        };

        let channel = self.channels.prepare_inbound(remote_channel, max_packet);
        let events = Arc::new(AgentChannelEvents {
            provider,
            channel: Arc::clone(&channel),
            buffer: Mutex::new(Vec::new()),
        });
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
            "Agent channel accepted"
        );
        Ok(())
    }
}

#[async_trait]
impl PacketInterceptor for AgentForwarder {
    async fn intercept_packet(&self, payload: &[u8]) -> InterceptOutcome {
        let Some(opcode) = payload.first().copied() else {
            return InterceptOutcome::PassThrough;
        };

        if opcode == MessageType::ChannelOpen as u8 {
            let mut reader = Reader::new(payload);
            let channel_type = reader
                .take_u8("opcode")
                .ok()
                .and_then(|_| reader.take_str("channel type").ok());

            if channel_type.as_deref() == Some("auth-agent@openssh.com") {
                if let Some(me) = self.self_ref.upgrade() {
                    let payload = payload.to_vec();
                    tokio::spawn(async move {
                        if let Err(e) = me.handle_agent_open(payload).await {
                            warn!("Agent channel open failed: {}", e);
                        }
                    });
                }
                return InterceptOutcome::Consumed;
            }
        }

        InterceptOutcome::PassThrough
    }

    async fn on_connection_closed(&self) {}

    fn name(&self) -> &'static str {
        "agent-forwarder"
    }
}

/// Channel events answering the agent protocol.
struct AgentChannelEvents {
    provider: Arc<dyn AgentKeyProvider>,
    channel: Arc<Channel>,
    buffer: Mutex<Vec<u8>>,
}

impl AgentChannelEvents {
    /// Builds the reply frame for one agent request, already
    /// length-prefixed.
    async fn respond(&self, frame: &[u8]) -> SkiffResult<Vec<u8>> {
        let body = match self.build_response(frame).await {
            Ok(body) => body,
            Err(e) => {
                warn!("Agent request failed: {}", e);
                vec![AGENT_FAILURE]
            }
        };

        let mut reply = BytesMut::new();
        reply.put_u32(body.len() as u32);
        reply.put_slice(&body);
        Ok(reply.to_vec())
    }

    async fn build_response(&self, frame: &[u8]) -> SkiffResult<Vec<u8>> {
        let mut reader = Reader::new(frame);
        let request_type = reader.take_u8("agent request type")?;

        match request_type {
            AGENTC_REQUEST_IDENTITIES => {
                let identities = self.provider.identities().await?;

                let mut body = BytesMut::new();
                body.put_u8(AGENT_IDENTITIES_ANSWER);
                body.put_u32(identities.len() as u32);
                for identity in &identities {
                    put_string(&mut body, &identity.key_blob);
                    put_string(&mut body, identity.comment.as_bytes());
                }
                Ok(body.to_vec())
            }
            AGENTC_SIGN_REQUEST => {
                let key_blob = reader.take_string("key blob")?;
                let data = reader.take_string("data")?;
                let flags = reader.take_u32("flags")?;

                let signature = self.provider.sign(key_blob, data, flags).await?;

                let mut body = BytesMut::new();
                body.put_u8(AGENT_SIGN_RESPONSE);
                put_string(&mut body, &signature);
                Ok(body.to_vec())
            }
            other => Err(SkiffError::Protocol(format!(
                "Unsupported agent request type {}",
                other
            ))),
        }
    }
}

#[async_trait]
impl ChannelEvents for AgentChannelEvents {
    async fn on_data(&self, data: &[u8]) -> SkiffResult<()> {
        let frames = {
            let mut buffer = self.buffer.lock().await;
            buffer.extend_from_slice(data);

            // Drain every complete length-prefixed frame
            let mut frames = Vec::new();
            loop {
                if buffer.len() < 4 {
                    break;
                }
                let frame_len =
                    u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
                if buffer.len() < 4 + frame_len {
                    break;
                }
                frames.push(buffer[4..4 + frame_len].to_vec());
                buffer.drain(..4 + frame_len);
            }
            frames
        };

        for frame in frames {
            let reply = self.respond(&frame).await?;
            self.channel.send_data(&reply).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticProvider {
        enabled: bool,
    }

    #[async_trait]
    impl AgentKeyProvider for StaticProvider {
        fn is_enabled(&self) -> bool {
            self.enabled
        }

        async fn identities(&self) -> SkiffResult<Vec<AgentIdentity>> {
            Ok(vec![AgentIdentity {
                key_blob: vec![1, 2, 3],
                comment: "test key".to_string(),
            }])
        }

        async fn sign(&self, _key_blob: &[u8], _data: &[u8], _flags: u32) -> SkiffResult<Vec<u8>> {
            Ok(vec![9, 9, 9])
        }
    }

    #[tokio::test]
    async fn test_identities_answer_encoding() {
        let provider = Arc::new(StaticProvider { enabled: true });
        let events = AgentChannelEvents {
            provider,
            channel: test_channel().await,
            buffer: Mutex::new(Vec::new()),
        };

        let body = events
            .build_response(&[AGENTC_REQUEST_IDENTITIES])
            .await
            .unwrap();

        assert_eq!(body[0], AGENT_IDENTITIES_ANSWER);
        let mut reader = Reader::new(&body[1..]);
        assert_eq!(reader.take_u32("count").unwrap(), 1);
        assert_eq!(reader.take_string("blob").unwrap(), &[1, 2, 3]);
        assert_eq!(reader.take_str("comment").unwrap(), "test key");
    }

    #[tokio::test]
    async fn test_sign_response_encoding() {
        let provider = Arc::new(StaticProvider { enabled: true });
        let events = AgentChannelEvents {
            provider,
            channel: test_channel().await,
            buffer: Mutex::new(Vec::new()),
        };

        let mut request = BytesMut::new();
        request.put_u8(AGENTC_SIGN_REQUEST);
        put_string(&mut request, &[1, 2, 3]);
        put_string(&mut request, b"challenge");
        request.put_u32(0);

        let body = events.build_response(&request).await.unwrap();
        assert_eq!(body[0], AGENT_SIGN_RESPONSE);
        let mut reader = Reader::new(&body[1..]);
        assert_eq!(reader.take_string("signature").unwrap(), &[9, 9, 9]);
    }

    #[tokio::test]
    async fn test_unknown_request_becomes_failure_frame() {
        let provider = Arc::new(StaticProvider { enabled: true });
        let events = AgentChannelEvents {
            provider,
            channel: test_channel().await,
            buffer: Mutex::new(Vec::new()),
        };

        let reply = events.respond(&[200]).await.unwrap();
        assert_eq!(reply, vec![0, 0, 0, 1, AGENT_FAILURE]);
    }

    async fn test_channel() -> Arc<Channel> {
        use crate::ssh::transport::Transport;
        use tokio::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, _server) =
            tokio::join!(async { TcpStream::connect(addr).await.unwrap() }, async {
                listener.accept().await.unwrap()
            });
        let (r, w) = client.into_split();
        let table = ChannelTable::new(Arc::new(Transport::new(r, w)));
        table.prepare_inbound(0, 32768)
    }
}
