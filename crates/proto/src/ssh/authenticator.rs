//! The user-authentication state machine.
//!
//! [`Authenticator`] is a packet interceptor implementing the
//! "ssh-userauth" service for the password, public key, and
//! keyboard-interactive methods. It is installed after the first
//! successful key exchange (it needs the session identifier for the
//! public key signature binding).
//!
//! Banner messages may arrive at any time during authentication; they are
//! delivered out-of-band to the connection event handler without changing
//! the expected-next set.
//!
//! Keyboard-interactive runs asynchronously because the prompt handler may
//! block for user input: the initial [`Authenticator::execute`] call
//! returns [`AuthState::AwaitingPromptResponse`] and the prompt loop
//! completes later, firing the completion event and closing the connection
//! on failure.

use crate::ssh::auth::{
    construct_signature_data, parse_service_accept, service_request, AuthBanner, AuthFailure,
    AuthMethod, AuthRequest, InfoPrompt, InfoRequest, InfoResponse,
};
use crate::ssh::connection::ConnectionEvents;
use crate::ssh::interceptor::{CloseHandle, InterceptOutcome, PacketInterceptor, ResponseSlot};
use crate::ssh::message::MessageType;
use crate::ssh::transport::Transport;
use async_trait::async_trait;
use signature::Signer;
use skiff_platform::{SkiffError, SkiffResult};
use ssh_key::{Algorithm, PrivateKey, Signature};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Authentication progress of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Authentication has not been attempted yet.
    NotAttempted,
    /// Keyboard-interactive is waiting on the prompt handler; the outcome
    /// arrives through the completion event.
    AwaitingPromptResponse,
    /// The server accepted the authentication.
    Success,
    /// The server rejected the authentication.
    Failure,
}

/// Handler invoked for keyboard-interactive prompt rounds.
///
/// May block indefinitely waiting for user input; the per-step response
/// timeout does not apply while a handler call is outstanding.
#[async_trait]
pub trait PromptHandler: Send + Sync {
    /// Collects one response per prompt, in prompt order.
    async fn prompts(
        &self,
        name: &str,
        instruction: &str,
        prompts: &[InfoPrompt],
    ) -> SkiffResult<Vec<String>>;
}

/// Credentials for one authentication attempt.
#[derive(Clone)]
pub enum AuthCredentials {
    /// Password authentication.
    Password {
        /// The plaintext password.
        password: String,
    },
    /// Public key authentication from an on-disk private key.
    PublicKey {
        /// Path to the OpenSSH-format private key file.
        key_path: PathBuf,
        /// Passphrase for encrypted keys.
        passphrase: Option<String>,
    },
    /// Keyboard-interactive authentication.
    KeyboardInteractive {
        /// The prompt handler to collect responses from.
        handler: Arc<dyn PromptHandler>,
        /// Comma-separated submethod hints, usually empty.
        submethods: String,
    },
}

impl std::fmt::Debug for AuthCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthCredentials::Password { .. } => f
                .debug_struct("Password")
                .field("password", &"<redacted>")
                .finish(),
            AuthCredentials::PublicKey { key_path, .. } => f
                .debug_struct("PublicKey")
                .field("key_path", key_path)
                .field("passphrase", &"<redacted>")
                .finish(),
            AuthCredentials::KeyboardInteractive { submethods, .. } => f
                .debug_struct("KeyboardInteractive")
                .field("handler", &"<handler>")
                .field("submethods", submethods)
                .finish(),
        }
    }
}

/// The user authenticator interceptor.
pub struct Authenticator {
    transport: Arc<Transport>,
    username: String,
    credentials: AuthCredentials,
    session_id: Arc<OnceLock<Vec<u8>>>,
    state: Mutex<AuthState>,
    slot: ResponseSlot,
    events: Arc<dyn ConnectionEvents>,
    close: CloseHandle,
    self_ref: Weak<Authenticator>,
}

impl Authenticator {
    /// Creates the authenticator.
    pub fn new(
        transport: Arc<Transport>,
        username: String,
        credentials: AuthCredentials,
        session_id: Arc<OnceLock<Vec<u8>>>,
        events: Arc<dyn ConnectionEvents>,
        close: CloseHandle,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            transport,
            username,
            credentials,
            session_id,
            state: Mutex::new(AuthState::NotAttempted),
            slot: ResponseSlot::new(),
            events,
            close,
            self_ref: weak.clone(),
        })
    }

    /// Returns the current authentication state.
    pub async fn state(&self) -> AuthState {
        *self.state.lock().await
    }

    async fn set_state(&self, state: AuthState) {
        *self.state.lock().await = state;
    }

    /// Runs the authentication exchange.
    ///
    /// For password and public key the call blocks until the server's
    /// verdict; for keyboard-interactive it returns
    /// [`AuthState::AwaitingPromptResponse`] as soon as the initial request
    /// is on the wire and the prompt loop continues in the background.
    ///
    /// # Errors
    ///
    /// [`SkiffError::Authentication`] when the server rejects the attempt;
    /// [`SkiffError::Timeout`] / [`SkiffError::Closed`] / protocol errors
    /// as usual.
    pub async fn execute(&self) -> SkiffResult<AuthState> {
        // Service request
        self.transport
            .send_payload(&service_request("ssh-userauth"))
            .await?;

        let accept = loop {
            let payload = self.slot.await_response("SSH_MSG_SERVICE_ACCEPT").await?;
            if payload.first() == Some(&(MessageType::UserauthBanner as u8)) {
                self.handle_banner(&payload).await;
                continue;
            }
            break payload;
        };

        let service = parse_service_accept(&accept)?;
        if service != "ssh-userauth" {
            return Err(SkiffError::Protocol(format!(
                "Server accepted unexpected service: {}",
                service
            )));
        }

        match self.credentials.clone() {
            AuthCredentials::Password { password } => {
                debug!(user = %self.username, "Attempting password authentication");
                let request = AuthRequest::new(
                    &self.username,
                    "ssh-connection",
                    AuthMethod::Password(password),
                );
                self.transport.send_payload(&request.to_bytes()).await?;
                self.await_auth_outcome().await
            }
            AuthCredentials::PublicKey {
                key_path,
                passphrase,
            } => {
                debug!(user = %self.username, "Attempting public key authentication");
                let request = self.build_publickey_request(&key_path, passphrase).await?;
                self.transport.send_payload(&request).await?;
                self.await_auth_outcome().await
            }
            AuthCredentials::KeyboardInteractive { submethods, .. } => {
                debug!(user = %self.username, "Attempting keyboard-interactive authentication");
                let request = AuthRequest::new(
                    &self.username,
                    "ssh-connection",
                    AuthMethod::KeyboardInteractive { submethods },
                );
                self.transport.send_payload(&request.to_bytes()).await?;

                self.set_state(AuthState::AwaitingPromptResponse).await;
                self.spawn_prompt_loop();
                Ok(AuthState::AwaitingPromptResponse)
            }
        }
    }

    /// Loads, decrypts, and signs with the configured private key, producing
    /// the complete USERAUTH_REQUEST payload.
    ///
    /// The signature covers `string session_id || request-without-signature`
    /// (RFC 4252 Section 7).
    async fn build_publickey_request(
        &self,
        key_path: &PathBuf,
        passphrase: Option<String>,
    ) -> SkiffResult<Vec<u8>> {
        let text = tokio::fs::read_to_string(key_path)
            .await
            .map_err(SkiffError::Io)?;
        let mut key = PrivateKey::from_openssh(&text)
            .map_err(|e| SkiffError::Config(format!("Cannot parse private key: {}", e)))?;

        if key.is_encrypted() {
            let passphrase = passphrase.ok_or_else(|| {
                SkiffError::Config(
                    "Private key is encrypted and no passphrase was provided".to_string(),
                )
            })?;
            key = key
                .decrypt(passphrase.as_bytes())
                .map_err(|_| SkiffError::Config("Wrong passphrase for private key".to_string()))?;
        }

        let public_blob = key
            .public_key()
            .to_bytes()
            .map_err(|e| SkiffError::Protocol(format!("Cannot encode public key: {}", e)))?;

        let session_id = self
            .session_id
            .get()
            .ok_or_else(|| SkiffError::Protocol("Session identifier not established".to_string()))?;

        // RSA keys sign as rsa-sha2-512; every other type signs under its
        // own name.
        let algorithm = match key.algorithm() {
            Algorithm::Rsa { .. } => "rsa-sha2-512".to_string(),
            other => other.to_string(),
        };

        let signed_data = construct_signature_data(
            session_id,
            &self.username,
            "ssh-connection",
            &algorithm,
            &public_blob,
        );
        let signature: Signature = key
            .try_sign(&signed_data)
            .map_err(|e| SkiffError::Security(format!("Private key signing failed: {}", e)))?;

        let mut signature_blob = bytes::BytesMut::new();
        crate::ssh::wire::put_string(
            &mut signature_blob,
            signature.algorithm().to_string().as_bytes(),
        );
        crate::ssh::wire::put_string(&mut signature_blob, signature.as_bytes());

        let request = AuthRequest::new(
            &self.username,
            "ssh-connection",
            AuthMethod::PublicKey {
                algorithm,
                public_key: public_blob,
                signature: Some(signature_blob.to_vec()),
            },
        );
        Ok(request.to_bytes())
    }

    /// Waits for SUCCESS or FAILURE, delivering banners out-of-band.
    async fn await_auth_outcome(&self) -> SkiffResult<AuthState> {
        loop {
            let payload = self.slot.await_response("authentication result").await?;
            let opcode = payload.first().copied().unwrap_or(0);

            if opcode == MessageType::UserauthBanner as u8 {
                self.handle_banner(&payload).await;
                continue;
            }

            if opcode == MessageType::UserauthSuccess as u8 {
                self.set_state(AuthState::Success).await;
                info!(user = %self.username, "Authentication succeeded");
                self.fire_completion(true).await;
                return Ok(AuthState::Success);
            }

            if opcode == MessageType::UserauthFailure as u8 {
                let failure = AuthFailure::from_bytes(&payload)?;
                self.set_state(AuthState::Failure).await;
                self.fire_completion(false).await;
                return Err(SkiffError::Authentication(format!(
                    "Server rejected {} authentication (can continue: {})",
                    self.credentials_name(),
                    failure.methods_that_can_continue.join(",")
                )));
            }

            return Err(SkiffError::Protocol(format!(
                "Unexpected authentication response opcode {}",
                opcode
            )));
        }
    }

    fn credentials_name(&self) -> &'static str {
        match self.credentials {
            AuthCredentials::Password { .. } => "password",
            AuthCredentials::PublicKey { .. } => "publickey",
            AuthCredentials::KeyboardInteractive { .. } => "keyboard-interactive",
        }
    }

    async fn handle_banner(&self, payload: &[u8]) {
        match AuthBanner::from_bytes(payload) {
            Ok(banner) => {
                if let Err(e) = self.events.on_banner(&banner.message).await {
                    warn!("Banner handler failed: {}", e);
                }
            }
            Err(e) => warn!("Malformed authentication banner: {}", e),
        }
    }

    async fn fire_completion(&self, success: bool) {
        if let Err(e) = self.events.on_authentication_complete(success).await {
            warn!("Authentication completion handler failed: {}", e);
        }
    }

    fn spawn_prompt_loop(&self) {
        if let Some(me) = self.self_ref.upgrade() {
            tokio::spawn(async move {
                match me.prompt_loop().await {
                    Ok(AuthState::Success) => {}
                    Ok(_) => me.close.request_close(),
                    Err(e) => {
                        error!("Keyboard-interactive authentication failed: {}", e);
                        me.set_state(AuthState::Failure).await;
                        me.close.request_close();
                    }
                }
            });
        }
    }

    /// The keyboard-interactive INFO_REQUEST / INFO_RESPONSE loop.
    async fn prompt_loop(&self) -> SkiffResult<AuthState> {
        let AuthCredentials::KeyboardInteractive { handler, .. } = &self.credentials else {
            return Err(SkiffError::Protocol(
                "Prompt loop without keyboard-interactive credentials".to_string(),
            ));
        };

        loop {
            let payload = self
                .slot
                .await_response("SSH_MSG_USERAUTH_INFO_REQUEST")
                .await?;
            let opcode = payload.first().copied().unwrap_or(0);

            if opcode == MessageType::UserauthBanner as u8 {
                self.handle_banner(&payload).await;
                continue;
            }

            if opcode == MessageType::UserauthInfoRequest as u8 {
                let request = InfoRequest::from_bytes(&payload)?;

                // The handler may block for user input; no timeout here. A
                // misbehaving handler must not corrupt the protocol, so its
                // failure degrades to an empty response set.
                let responses = match handler
                    .prompts(&request.name, &request.instruction, &request.prompts)
                    .await
                {
                    Ok(responses) => responses,
                    Err(e) => {
                        warn!("Prompt handler failed: {}", e);
                        Vec::new()
                    }
                };

                let response = InfoResponse { responses };
                self.transport.send_payload(&response.to_bytes()).await?;
                continue;
            }

            if opcode == MessageType::UserauthSuccess as u8 {
                self.set_state(AuthState::Success).await;
                info!(user = %self.username, "Keyboard-interactive authentication succeeded");
                self.fire_completion(true).await;
                return Ok(AuthState::Success);
            }

            if opcode == MessageType::UserauthFailure as u8 {
                let failure = AuthFailure::from_bytes(&payload)?;
                self.set_state(AuthState::Failure).await;
                info!(
                    user = %self.username,
                    can_continue = %failure.methods_that_can_continue.join(","),
                    "Keyboard-interactive authentication rejected"
                );
                self.fire_completion(false).await;
                return Ok(AuthState::Failure);
            }

            return Err(SkiffError::Protocol(format!(
                "Unexpected keyboard-interactive opcode {}",
                opcode
            )));
        }
    }
}

#[async_trait]
impl PacketInterceptor for Authenticator {
    async fn intercept_packet(&self, payload: &[u8]) -> InterceptOutcome {
        let state = self.state().await;
        if matches!(state, AuthState::Success | AuthState::Failure) {
            return InterceptOutcome::PassThrough;
        }

        let Some(opcode) = payload.first().copied() else {
            return InterceptOutcome::PassThrough;
        };

        let claimed = opcode == MessageType::ServiceAccept as u8
            || opcode == MessageType::UserauthBanner as u8
            || opcode == MessageType::UserauthInfoRequest as u8;
        let terminal = opcode == MessageType::UserauthSuccess as u8
            || opcode == MessageType::UserauthFailure as u8;

        if claimed {
            self.slot.deliver(payload.to_vec()).await;
            InterceptOutcome::Consumed
        } else if terminal {
            self.slot.deliver(payload.to_vec()).await;
            InterceptOutcome::Finished
        } else {
            InterceptOutcome::PassThrough
        }
    }

    async fn on_connection_closed(&self) {
        self.slot.deliver_closed();
    }

    fn name(&self) -> &'static str {
        "user-authenticator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let password = AuthCredentials::Password {
            password: "hunter2".to_string(),
        };
        let rendered = format!("{:?}", password);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));

        let key = AuthCredentials::PublicKey {
            key_path: PathBuf::from("/home/u/.ssh/id_rsa"),
            passphrase: Some("secret".to_string()),
        };
        let rendered = format!("{:?}", key);
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn test_auth_state_transitions_are_plain_data() {
        assert_ne!(AuthState::NotAttempted, AuthState::Success);
        assert_ne!(AuthState::AwaitingPromptResponse, AuthState::Failure);
    }
}
