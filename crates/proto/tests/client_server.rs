//! Integration tests for the SSH client core.
//!
//! A scripted in-process server accepts one connection per test and drives
//! the real client through version exchange, Diffie-Hellman key exchange
//! with an ssh-rsa host key, authentication, port forwarding, and
//! mid-session rekeying. The server side reuses the crate's own wire and
//! transport primitives, so every packet both directions is built and
//! verified by the code under test.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use rsa::traits::PublicKeyParts;
use signature::{SignatureEncoding, Signer};
use skiff_platform::{SkiffError, SkiffResult};
use skiff_proto::ssh::authenticator::{AuthCredentials, AuthState, PromptHandler};
use skiff_proto::ssh::channel::{Channel, ChannelEvents, OpenFailureReason};
use skiff_proto::ssh::connection::{Connection, ConnectionEvents, ConnectionParams};
use skiff_proto::ssh::crypto::{Cipher, CipherAlgorithm, MacAlgorithm, MacKey};
use skiff_proto::ssh::forwarding::{ForwardAddr, ForwardedPortHandler};
use skiff_proto::ssh::kex::{HashAlgorithm, KexAlgorithm, KexInit, NewKeys};
use skiff_proto::ssh::kex_dh::{compute_exchange_hash, derive_key, DhExchange, ExchangeHashParams};
use skiff_proto::ssh::message::MessageType;
use skiff_proto::ssh::transport::Transport;
use skiff_proto::ssh::wire::{put_mpint, put_string, Reader};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout, Duration};

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

/// An RSA host key for the scripted server.
struct ServerHostKey {
    private: rsa::RsaPrivateKey,
    blob: Vec<u8>,
}

impl ServerHostKey {
    fn generate() -> Self {
        let private =
            rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("RSA generation");
        let public = private.to_public_key();

        // ssh-rsa blob: string "ssh-rsa", mpint e, mpint n
        let mut blob = BytesMut::new();
        put_string(&mut blob, b"ssh-rsa");
        put_mpint(&mut blob, &public.e().to_bytes_be());
        put_mpint(&mut blob, &public.n().to_bytes_be());

        Self {
            private,
            blob: blob.to_vec(),
        }
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let signing_key = rsa::pkcs1v15::SigningKey::<sha1::Sha1>::new(self.private.clone());
        let signature = signing_key.sign(data);

        let mut blob = BytesMut::new();
        put_string(&mut blob, b"ssh-rsa");
        put_string(&mut blob, &signature.to_vec());
        blob.to_vec()
    }
}

/// The scripted server's side of one established connection.
struct ServerSession {
    transport: Transport,
    host_key: ServerHostKey,
    client_version: String,
    server_version: String,
    session_id: Vec<u8>,
    cipher: CipherAlgorithm,
}

/// Accepts one TCP connection and completes version exchange plus one full
/// key exchange, advertising exactly the given kex algorithm and cipher.
async fn accept_with_kex(
    listener: TcpListener,
    kex_algorithm: KexAlgorithm,
    cipher: CipherAlgorithm,
) -> ServerSession {
    let (mut stream, _) = listener.accept().await.expect("accept");

    // Version exchange
    let client_version = read_version_line(&mut stream).await;
    let server_version = "SSH-2.0-ScriptedServer_1.0".to_string();
    stream
        .write_all(format!("{}\r\n", server_version).as_bytes())
        .await
        .expect("server version write");

    let (read_half, write_half) = stream.into_split();
    let transport = Transport::new(read_half, write_half);
    let host_key = ServerHostKey::generate();

    // KEXINIT exchange
    let (client_kexinit, _) = transport.read_payload().await.expect("client KEXINIT");
    KexInit::from_bytes(&client_kexinit).expect("parse client KEXINIT");

    let server_kexinit = KexInit::new_client(
        &["ssh-rsa".to_string()],
        &[cipher.name().to_string()],
    )
    .with_kex_algorithms(vec![kex_algorithm.name().to_string()]);
    let server_kexinit_payload = server_kexinit.to_bytes();
    transport
        .send_payload(&server_kexinit_payload)
        .await
        .expect("server KEXINIT");

    // KEXDH_INIT
    let (kexdh_init, _) = transport.read_payload().await.expect("KEXDH_INIT");
    let mut reader = Reader::new(&kexdh_init);
    assert_eq!(
        reader.take_u8("opcode").unwrap(),
        MessageType::KexdhInit as u8
    );
    let client_public = reader.take_mpint("e").unwrap().to_vec();

    // Server side of the exchange
    let dh = DhExchange::new(kex_algorithm);
    let shared_secret = dh
        .compute_shared_secret(&client_public)
        .expect("server shared secret");

    let exchange_hash = compute_exchange_hash(
        kex_algorithm.hash(),
        &ExchangeHashParams {
            client_version: &client_version,
            server_version: &server_version,
            client_kexinit: &client_kexinit,
            server_kexinit: &server_kexinit_payload,
            host_key_blob: &host_key.blob,
            client_public: &client_public,
            server_public: dh.public_value(),
            shared_secret: &shared_secret,
        },
    );
    let signature = host_key.sign(&exchange_hash);

    let mut reply = BytesMut::new();
    reply.put_u8(MessageType::KexdhReply as u8);
    put_string(&mut reply, &host_key.blob);
    put_mpint(&mut reply, dh.public_value());
    put_string(&mut reply, &signature);
    transport.send_payload(&reply).await.expect("KEXDH_REPLY");

    let session_id = exchange_hash.clone();
    complete_newkeys(
        &transport,
        kex_algorithm.hash(),
        cipher,
        &shared_secret,
        &exchange_hash,
        &session_id,
    )
    .await;

    ServerSession {
        transport,
        host_key,
        client_version,
        server_version,
        session_id,
        cipher,
    }
}

/// Server side of the NEWKEYS exchange: consume the client's NEWKEYS under
/// the old keys, install the new inbound pair, then send our NEWKEYS and
/// swap outbound atomically.
async fn complete_newkeys(
    transport: &Transport,
    hash: HashAlgorithm,
    cipher: CipherAlgorithm,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
) {
    let (newkeys, _) = transport.read_payload().await.expect("client NEWKEYS");
    assert_eq!(newkeys, NewKeys.to_bytes());

    // Server directions mirror the client letter tags
    let key_in = derive_key(hash, shared_secret, exchange_hash, session_id, b'C', cipher.key_size());
    let iv_in = derive_key(hash, shared_secret, exchange_hash, session_id, b'A', cipher.iv_size());
    let mac_in = derive_key(hash, shared_secret, exchange_hash, session_id, b'E', 20);
    let key_out = derive_key(hash, shared_secret, exchange_hash, session_id, b'D', cipher.key_size());
    let iv_out = derive_key(hash, shared_secret, exchange_hash, session_id, b'B', cipher.iv_size());
    let mac_out = derive_key(hash, shared_secret, exchange_hash, session_id, b'F', 20);

    transport
        .rekey_inbound(
            Cipher::decryptor(cipher, &key_in, &iv_in).expect("server inbound cipher"),
            MacKey::new(MacAlgorithm::HmacSha1, &mac_in).expect("server inbound mac"),
        )
        .await;
    transport
        .rekey_outbound(
            &NewKeys.to_bytes(),
            Cipher::encryptor(cipher, &key_out, &iv_out).expect("server outbound cipher"),
            MacKey::new(MacAlgorithm::HmacSha1, &mac_out).expect("server outbound mac"),
        )
        .await
        .expect("server NEWKEYS");
}

async fn read_version_line(stream: &mut TcpStream) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.expect("version byte");
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).expect("version utf8")
}

/// Answers the ssh-userauth service request, then runs `verdict` on the
/// USERAUTH_REQUEST payload: Ok -> SUCCESS, Err -> FAILURE.
async fn serve_auth(session: &ServerSession, accept: bool) -> Vec<u8> {
    let (service_request, _) = session
        .transport
        .read_payload()
        .await
        .expect("SERVICE_REQUEST");
    assert_eq!(service_request[0], MessageType::ServiceRequest as u8);

    let mut accept_msg = BytesMut::new();
    accept_msg.put_u8(MessageType::ServiceAccept as u8);
    put_string(&mut accept_msg, b"ssh-userauth");
    session
        .transport
        .send_payload(&accept_msg)
        .await
        .expect("SERVICE_ACCEPT");

    let (auth_request, _) = session
        .transport
        .read_payload()
        .await
        .expect("USERAUTH_REQUEST");
    assert_eq!(auth_request[0], MessageType::UserauthRequest as u8);

    if accept {
        session
            .transport
            .send_payload(&[MessageType::UserauthSuccess as u8])
            .await
            .expect("USERAUTH_SUCCESS");
    } else {
        let mut failure = BytesMut::new();
        failure.put_u8(MessageType::UserauthFailure as u8);
        put_string(&mut failure, b"password,publickey");
        failure.put_u8(0);
        session
            .transport
            .send_payload(&failure)
            .await
            .expect("USERAUTH_FAILURE");
    }

    auth_request
}

fn password_params(port: u16) -> ConnectionParams {
    ConnectionParams::new(
        "127.0.0.1",
        port,
        "alice",
        AuthCredentials::Password {
            password: "correct horse".to_string(),
        },
    )
}

struct RecordingEvents {
    auth_complete: Mutex<Option<bool>>,
    ignores: Mutex<Vec<Vec<u8>>>,
    notify: Notify,
}

impl RecordingEvents {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            auth_complete: Mutex::new(None),
            ignores: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }
}

#[async_trait]
impl ConnectionEvents for RecordingEvents {
    async fn on_authentication_complete(&self, success: bool) -> SkiffResult<()> {
        *self.auth_complete.lock().await = Some(success);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn on_ignore(&self, data: &[u8]) -> SkiffResult<()> {
        self.ignores.lock().await.push(data.to_vec());
        self.notify.notify_waiters();
        Ok(())
    }
}

/// Scenario: a server advertising exactly one algorithm per family. The
/// client must pick them, produce a SHA-256 session identifier, and
/// complete password authentication.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connect_negotiates_single_algorithm_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let session =
            accept_with_kex(listener, KexAlgorithm::DhGroup14Sha256, CipherAlgorithm::Aes128Ctr)
                .await;
        serve_auth(&session, true).await;
        session
    });

    let connection = timeout(
        TEST_TIMEOUT,
        Connection::connect(password_params(port), RecordingEvents::new()),
    )
    .await
    .expect("connect timed out")
    .expect("connect failed");

    assert!(connection.is_open());
    assert_eq!(connection.auth_state().await, AuthState::Success);

    // SHA-256 exchange hash
    let session_id = connection.session_id().expect("session id");
    assert_eq!(session_id.len(), 32);

    let negotiated = connection
        .negotiated_algorithms()
        .await
        .expect("negotiated algorithms");
    assert_eq!(negotiated.kex, KexAlgorithm::DhGroup14Sha256);
    assert_eq!(negotiated.host_key, "ssh-rsa");
    assert_eq!(negotiated.cipher_out, CipherAlgorithm::Aes128Ctr);
    assert_eq!(negotiated.cipher_in, CipherAlgorithm::Aes128Ctr);

    let server_session = timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();
    assert_eq!(server_session.session_id, session_id);
}

/// Scenario: wrong credentials. Connect must fail with an authentication
/// error and the socket must be closed.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn password_rejection_fails_connect_and_closes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let session =
            accept_with_kex(listener, KexAlgorithm::DhGroup14Sha256, CipherAlgorithm::Aes256Ctr)
                .await;
        serve_auth(&session, false).await;
        // The client must close the connection after the failure
        session.transport.read_payload().await
    });

    let result = timeout(
        TEST_TIMEOUT,
        Connection::connect(password_params(port), RecordingEvents::new()),
    )
    .await
    .expect("connect timed out");

    match result {
        Err(SkiffError::Authentication(message)) => {
            assert!(message.contains("password"));
        }
        other => panic!("expected authentication failure, got {:?}", other.map(|_| ())),
    }

    let server_tail = timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();
    assert!(server_tail.is_err(), "client must close the socket");
}

struct ScriptedPrompts {
    responses: Vec<String>,
}

#[async_trait]
impl PromptHandler for ScriptedPrompts {
    async fn prompts(
        &self,
        _name: &str,
        _instruction: &str,
        prompts: &[skiff_proto::ssh::auth::InfoPrompt],
    ) -> SkiffResult<Vec<String>> {
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[0].prompt, "Password:");
        assert!(!prompts[0].echo);
        assert_eq!(prompts[1].prompt, "Token:");
        assert!(prompts[1].echo);
        Ok(self.responses.clone())
    }
}

/// Scenario: keyboard-interactive with a two-prompt round. Connect returns
/// while the prompt loop is outstanding; the completion event fires with
/// success once the server accepts the responses.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keyboard_interactive_two_prompts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let session =
            accept_with_kex(listener, KexAlgorithm::DhGroup16Sha512, CipherAlgorithm::Aes128Ctr)
                .await;

        let (service_request, _) = session.transport.read_payload().await.unwrap();
        assert_eq!(service_request[0], MessageType::ServiceRequest as u8);
        let mut accept_msg = BytesMut::new();
        accept_msg.put_u8(MessageType::ServiceAccept as u8);
        put_string(&mut accept_msg, b"ssh-userauth");
        session.transport.send_payload(&accept_msg).await.unwrap();

        let (auth_request, _) = session.transport.read_payload().await.unwrap();
        assert_eq!(auth_request[0], MessageType::UserauthRequest as u8);

        // INFO_REQUEST with two prompts
        let info_request = skiff_proto::ssh::auth::InfoRequest {
            name: "Two factor".to_string(),
            instruction: String::new(),
            language: String::new(),
            prompts: vec![
                skiff_proto::ssh::auth::InfoPrompt {
                    prompt: "Password:".to_string(),
                    echo: false,
                },
                skiff_proto::ssh::auth::InfoPrompt {
                    prompt: "Token:".to_string(),
                    echo: true,
                },
            ],
        };
        session
            .transport
            .send_payload(&info_request.to_bytes())
            .await
            .unwrap();

        let (info_response, _) = session.transport.read_payload().await.unwrap();
        let parsed = skiff_proto::ssh::auth::InfoResponse::from_bytes(&info_response).unwrap();
        assert_eq!(parsed.responses, vec!["pw", "123456"]);

        session
            .transport
            .send_payload(&[MessageType::UserauthSuccess as u8])
            .await
            .unwrap();
        session
    });

    let events = RecordingEvents::new();
    let mut params = ConnectionParams::new(
        "127.0.0.1",
        port,
        "alice",
        AuthCredentials::KeyboardInteractive {
            handler: Arc::new(ScriptedPrompts {
                responses: vec!["pw".to_string(), "123456".to_string()],
            }),
            submethods: String::new(),
        },
    );
    params.encryption_algorithms = vec!["aes128-ctr".to_string()];

    let connection = timeout(
        TEST_TIMEOUT,
        Connection::connect(params, Arc::clone(&events) as Arc<dyn ConnectionEvents>),
    )
    .await
    .expect("connect timed out")
    .expect("connect failed");

    // The prompt loop completes asynchronously
    timeout(TEST_TIMEOUT, async {
        loop {
            if events.auth_complete.lock().await.is_some() {
                break;
            }
            events.notify.notified().await;
        }
    })
    .await
    .expect("completion event timed out");

    assert_eq!(*events.auth_complete.lock().await, Some(true));
    assert_eq!(connection.auth_state().await, AuthState::Success);

    timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();
}

struct AcceptAllForwards {
    listening_port: Mutex<Option<u32>>,
    received: Arc<RecordingChannel>,
}

struct RecordingChannel {
    data: Mutex<Vec<u8>>,
    notify: Notify,
}

#[async_trait]
impl ChannelEvents for RecordingChannel {
    async fn on_data(&self, data: &[u8]) -> SkiffResult<()> {
        self.data.lock().await.extend_from_slice(data);
        self.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl ForwardedPortHandler for AcceptAllForwards {
    async fn on_listening(&self, _addr: &str, port: u32) -> SkiffResult<()> {
        *self.listening_port.lock().await = Some(port);
        Ok(())
    }

    async fn accept(
        &self,
        connected: &ForwardAddr,
        _originator: &ForwardAddr,
        _channel: Arc<Channel>,
    ) -> Result<Arc<dyn ChannelEvents>, OpenFailureReason> {
        assert_eq!(connected.port, 54321);
        Ok(Arc::clone(&self.received) as Arc<dyn ChannelEvents>)
    }
}

/// Scenario: remote forward of port 0. The server assigns 54321, then opens
/// a forwarded-tcpip channel toward it; the client must confirm the open
/// and route the channel data to the handler.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_forward_with_server_assigned_port() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let session =
            accept_with_kex(listener, KexAlgorithm::DhGroup14Sha256, CipherAlgorithm::Aes128Ctr)
                .await;
        serve_auth(&session, true).await;

        // tcpip-forward global request
        let (global_request, _) = session.transport.read_payload().await.unwrap();
        let mut reader = Reader::new(&global_request);
        assert_eq!(
            reader.take_u8("opcode").unwrap(),
            MessageType::GlobalRequest as u8
        );
        assert_eq!(reader.take_str("request").unwrap(), "tcpip-forward");
        assert!(reader.take_bool("want reply").unwrap());
        assert_eq!(reader.take_str("address").unwrap(), "");
        assert_eq!(reader.take_u32("port").unwrap(), 0);

        let mut success = BytesMut::new();
        success.put_u8(MessageType::RequestSuccess as u8);
        success.put_u32(54321);
        session.transport.send_payload(&success).await.unwrap();

        // Inbound forwarded-tcpip channel
        let mut open = BytesMut::new();
        open.put_u8(MessageType::ChannelOpen as u8);
        put_string(&mut open, b"forwarded-tcpip");
        open.put_u32(7); // server's channel number
        open.put_u32(2_097_152);
        open.put_u32(32_768);
        put_string(&mut open, b"");
        open.put_u32(54321);
        put_string(&mut open, b"203.0.113.9");
        open.put_u32(50100);
        session.transport.send_payload(&open).await.unwrap();

        let (confirmation, _) = session.transport.read_payload().await.unwrap();
        let mut reader = Reader::new(&confirmation);
        assert_eq!(
            reader.take_u8("opcode").unwrap(),
            MessageType::ChannelOpenConfirmation as u8
        );
        assert_eq!(reader.take_u32("recipient").unwrap(), 7);
        let client_channel = reader.take_u32("sender").unwrap();

        // Push data down the accepted channel
        let mut data = BytesMut::new();
        data.put_u8(MessageType::ChannelData as u8);
        data.put_u32(client_channel);
        put_string(&mut data, b"forwarded payload");
        session.transport.send_payload(&data).await.unwrap();

        session
    });

    let received = Arc::new(RecordingChannel {
        data: Mutex::new(Vec::new()),
        notify: Notify::new(),
    });
    let handler = Arc::new(AcceptAllForwards {
        listening_port: Mutex::new(None),
        received: Arc::clone(&received),
    });

    let connection = timeout(
        TEST_TIMEOUT,
        Connection::connect(password_params(port), RecordingEvents::new()),
    )
    .await
    .expect("connect timed out")
    .expect("connect failed");

    let bound = timeout(
        TEST_TIMEOUT,
        connection.listen_forwarded_port(Arc::clone(&handler) as _, "", 0),
    )
    .await
    .expect("listen timed out")
    .expect("listen failed");

    assert_eq!(bound, 54321, "server-assigned port from SUCCESS body");
    assert_eq!(*handler.listening_port.lock().await, Some(54321));

    timeout(TEST_TIMEOUT, async {
        loop {
            if !received.data.lock().await.is_empty() {
                break;
            }
            received.notify.notified().await;
        }
    })
    .await
    .expect("forwarded data timed out");

    assert_eq!(&*received.data.lock().await, b"forwarded payload");

    timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();
}

/// Scenario: mid-session server-initiated rekey. Traffic before the rekey
/// verifies under the old keys, traffic after under the new ones, the
/// session identifier stays the exchange hash of the first exchange, and
/// sequence numbers continue unbroken (a reset would break every MAC).
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_initiated_rekey_mid_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let session =
            accept_with_kex(listener, KexAlgorithm::DhGroup14Sha1, CipherAlgorithm::TripleDesCbc)
                .await;
        serve_auth(&session, true).await;

        // Data under the first set of keys
        let mut ignore = BytesMut::new();
        ignore.put_u8(MessageType::Ignore as u8);
        put_string(&mut ignore, b"before-rekey");
        session.transport.send_payload(&ignore).await.unwrap();

        // Server-initiated rekey: send KEXINIT first
        let rekey_kexinit = KexInit::new_client(
            &["ssh-rsa".to_string()],
            &["3des-cbc".to_string()],
        )
        .with_kex_algorithms(vec![KexAlgorithm::DhGroup14Sha1.name().to_string()]);
        let server_kexinit_payload = rekey_kexinit.to_bytes();
        session
            .transport
            .send_payload(&server_kexinit_payload)
            .await
            .unwrap();

        let (client_kexinit, _) = session.transport.read_payload().await.unwrap();
        assert_eq!(client_kexinit[0], MessageType::KexInit as u8);

        let (kexdh_init, _) = session.transport.read_payload().await.unwrap();
        let mut reader = Reader::new(&kexdh_init);
        assert_eq!(
            reader.take_u8("opcode").unwrap(),
            MessageType::KexdhInit as u8
        );
        let client_public = reader.take_mpint("e").unwrap().to_vec();

        let dh = DhExchange::new(KexAlgorithm::DhGroup14Sha1);
        let shared_secret = dh.compute_shared_secret(&client_public).unwrap();
        let exchange_hash = compute_exchange_hash(
            HashAlgorithm::Sha1,
            &ExchangeHashParams {
                client_version: &session.client_version,
                server_version: &session.server_version,
                client_kexinit: &client_kexinit,
                server_kexinit: &server_kexinit_payload,
                host_key_blob: &session.host_key.blob,
                client_public: &client_public,
                server_public: dh.public_value(),
                shared_secret: &shared_secret,
            },
        );
        let signature = session.host_key.sign(&exchange_hash);

        let mut reply = BytesMut::new();
        reply.put_u8(MessageType::KexdhReply as u8);
        put_string(&mut reply, &session.host_key.blob);
        put_mpint(&mut reply, dh.public_value());
        put_string(&mut reply, &signature);
        session.transport.send_payload(&reply).await.unwrap();

        // The rekey hash differs, but the session id from the FIRST
        // exchange keys the derivation.
        assert_ne!(exchange_hash, session.session_id);
        complete_newkeys(
            &session.transport,
            HashAlgorithm::Sha1,
            session.cipher,
            &shared_secret,
            &exchange_hash,
            &session.session_id,
        )
        .await;

        // Data under the new keys
        let mut ignore = BytesMut::new();
        ignore.put_u8(MessageType::Ignore as u8);
        put_string(&mut ignore, b"after-rekey");
        session.transport.send_payload(&ignore).await.unwrap();

        session
    });

    let events = RecordingEvents::new();
    let mut params = password_params(port);
    params.encryption_algorithms = vec!["3des-cbc".to_string()];

    let connection = timeout(
        TEST_TIMEOUT,
        Connection::connect(params, Arc::clone(&events) as Arc<dyn ConnectionEvents>),
    )
    .await
    .expect("connect timed out")
    .expect("connect failed");

    let first_session_id = connection.session_id().expect("session id");

    timeout(TEST_TIMEOUT, async {
        loop {
            if events.ignores.lock().await.len() >= 2 {
                break;
            }
            events.notify.notified().await;
        }
    })
    .await
    .expect("rekeyed traffic timed out");

    let ignores = events.ignores.lock().await;
    assert_eq!(ignores[0], b"before-rekey");
    assert_eq!(ignores[1], b"after-rekey");
    drop(ignores);

    // session_id still equals the first exchange hash after the rekey
    assert_eq!(connection.session_id().unwrap(), first_session_id);
    assert!(connection.is_open());

    timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();
}
