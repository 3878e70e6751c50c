//! SSH authentication protocol messages (RFC 4252).
//!
//! Message builders and parsers for the "ssh-userauth" service:
//! - SSH_MSG_USERAUTH_REQUEST for "password", "publickey", and
//!   "keyboard-interactive"
//! - SSH_MSG_USERAUTH_FAILURE / BANNER
//! - SSH_MSG_USERAUTH_INFO_REQUEST / INFO_RESPONSE (RFC 4256)
//!
//! # Security
//!
//! Passwords and prompt responses are zeroized on drop.

use crate::ssh::message::MessageType;
use crate::ssh::wire::{put_bool, put_string, Reader};
use bytes::{BufMut, BytesMut};
use skiff_platform::{SkiffError, SkiffResult};
use zeroize::Zeroize;

/// SSH authentication method carried in a USERAUTH_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Password authentication.
    Password(String),
    /// Public key authentication with a signature over the session binding.
    PublicKey {
        /// Signature algorithm name (e.g. "rsa-sha2-512", "ssh-ed25519")
        algorithm: String,
        /// Public key blob
        public_key: Vec<u8>,
        /// Signature (`string algorithm || string blob`), when present
        signature: Option<Vec<u8>>,
    },
    /// Keyboard-interactive authentication (RFC 4256).
    KeyboardInteractive {
        /// Comma-separated submethod hints, usually empty
        submethods: String,
    },
}

impl AuthMethod {
    /// Returns the method name.
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::Password(_) => "password",
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::KeyboardInteractive { .. } => "keyboard-interactive",
        }
    }
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        if let AuthMethod::Password(ref mut password) = self {
            password.zeroize();
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST message (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: AuthMethod,
}

impl AuthRequest {
    /// Creates a new authentication request.
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the authentication method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Serializes the request.
    ///
    /// ```text
    /// byte      SSH_MSG_USERAUTH_REQUEST (50)
    /// string    user name
    /// string    service name
    /// string    method name
    /// ....      method specific fields
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        buf.put_u8(MessageType::UserauthRequest as u8);
        put_string(&mut buf, self.user_name.as_bytes());
        put_string(&mut buf, self.service_name.as_bytes());
        put_string(&mut buf, self.method.name().as_bytes());

        match &self.method {
            AuthMethod::Password(password) => {
                // boolean FALSE (not changing password)
                put_bool(&mut buf, false);
                put_string(&mut buf, password.as_bytes());
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                put_bool(&mut buf, signature.is_some());
                put_string(&mut buf, algorithm.as_bytes());
                put_string(&mut buf, public_key);
                if let Some(sig) = signature {
                    put_string(&mut buf, sig);
                }
            }
            AuthMethod::KeyboardInteractive { submethods } => {
                // string language tag (deprecated, empty)
                put_string(&mut buf, b"");
                put_string(&mut buf, submethods.as_bytes());
            }
        }

        buf.to_vec()
    }
}

/// Builds the data a public key authentication signature covers
/// (RFC 4252 Section 7): the session identifier as a `string`, followed by
/// the USERAUTH_REQUEST payload up to and including the public key blob,
/// with the signature-present flag set.
pub fn construct_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key_blob: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();

    put_string(&mut buf, session_id);
    buf.put_u8(MessageType::UserauthRequest as u8);
    put_string(&mut buf, user_name.as_bytes());
    put_string(&mut buf, service_name.as_bytes());
    put_string(&mut buf, b"publickey");
    put_bool(&mut buf, true);
    put_string(&mut buf, algorithm.as_bytes());
    put_string(&mut buf, public_key_blob);

    buf.to_vec()
}

/// SSH_MSG_USERAUTH_FAILURE message (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    /// Methods that can productively continue authentication.
    pub methods_that_can_continue: Vec<String>,
    /// True when the request succeeded but more methods are required.
    pub partial_success: bool,
}

impl AuthFailure {
    /// Parses a USERAUTH_FAILURE message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut reader = Reader::new(data);
        let opcode = reader.take_u8("message type")?;
        if opcode != MessageType::UserauthFailure as u8 {
            return Err(SkiffError::Protocol(format!(
                "Expected SSH_MSG_USERAUTH_FAILURE, got opcode {}",
                opcode
            )));
        }

        Ok(Self {
            methods_that_can_continue: reader.take_name_list("authentications")?,
            partial_success: reader.take_bool("partial success")?,
        })
    }
}

/// SSH_MSG_USERAUTH_BANNER message (RFC 4252 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    /// Banner text to show the user.
    pub message: String,
    /// Language tag (usually empty).
    pub language: String,
}

impl AuthBanner {
    /// Parses a USERAUTH_BANNER message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut reader = Reader::new(data);
        let opcode = reader.take_u8("message type")?;
        if opcode != MessageType::UserauthBanner as u8 {
            return Err(SkiffError::Protocol(format!(
                "Expected SSH_MSG_USERAUTH_BANNER, got opcode {}",
                opcode
            )));
        }

        Ok(Self {
            message: reader.take_str("banner message")?,
            language: reader.take_str("language tag")?,
        })
    }
}

/// One prompt within an INFO_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoPrompt {
    /// Prompt text (e.g. "Password:").
    pub prompt: String,
    /// Whether the user's input should be echoed.
    pub echo: bool,
}

/// SSH_MSG_USERAUTH_INFO_REQUEST message (RFC 4256 Section 3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRequest {
    /// Instruction name, may be empty.
    pub name: String,
    /// Free-form instruction text, may be empty.
    pub instruction: String,
    /// Language tag (deprecated).
    pub language: String,
    /// The prompts to present, in order.
    pub prompts: Vec<InfoPrompt>,
}

impl InfoRequest {
    /// Parses an INFO_REQUEST message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut reader = Reader::new(data);
        let opcode = reader.take_u8("message type")?;
        if opcode != MessageType::UserauthInfoRequest as u8 {
            return Err(SkiffError::Protocol(format!(
                "Expected SSH_MSG_USERAUTH_INFO_REQUEST, got opcode {}",
                opcode
            )));
        }

        let name = reader.take_str("name")?;
        let instruction = reader.take_str("instruction")?;
        let language = reader.take_str("language tag")?;
        let num_prompts = reader.take_u32("num prompts")?;

        // Field count is attacker-controlled; let the per-prompt reads fail
        // on truncation instead of pre-allocating.
        let mut prompts = Vec::new();
        for _ in 0..num_prompts {
            let prompt = reader.take_str("prompt")?;
            let echo = reader.take_bool("echo")?;
            prompts.push(InfoPrompt { prompt, echo });
        }

        Ok(Self {
            name,
            instruction,
            language,
            prompts,
        })
    }

    /// Serializes an INFO_REQUEST (used by test harnesses acting as server).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        buf.put_u8(MessageType::UserauthInfoRequest as u8);
        put_string(&mut buf, self.name.as_bytes());
        put_string(&mut buf, self.instruction.as_bytes());
        put_string(&mut buf, self.language.as_bytes());
        buf.put_u32(self.prompts.len() as u32);
        for prompt in &self.prompts {
            put_string(&mut buf, prompt.prompt.as_bytes());
            put_bool(&mut buf, prompt.echo);
        }

        buf.to_vec()
    }
}

/// SSH_MSG_USERAUTH_INFO_RESPONSE message (RFC 4256 Section 3.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoResponse {
    /// Responses, one per prompt, in prompt order.
    pub responses: Vec<String>,
}

impl InfoResponse {
    /// Serializes the response message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        buf.put_u8(MessageType::UserauthInfoResponse as u8);
        buf.put_u32(self.responses.len() as u32);
        for response in &self.responses {
            put_string(&mut buf, response.as_bytes());
        }

        buf.to_vec()
    }

    /// Parses a response message (used by test harnesses acting as server).
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut reader = Reader::new(data);
        let opcode = reader.take_u8("message type")?;
        if opcode != MessageType::UserauthInfoResponse as u8 {
            return Err(SkiffError::Protocol(format!(
                "Expected SSH_MSG_USERAUTH_INFO_RESPONSE, got opcode {}",
                opcode
            )));
        }

        let count = reader.take_u32("num responses")?;
        let mut responses = Vec::new();
        for _ in 0..count {
            responses.push(reader.take_str("response")?);
        }

        Ok(Self { responses })
    }
}

impl Drop for InfoResponse {
    fn drop(&mut self) {
        for response in &mut self.responses {
            response.zeroize();
        }
    }
}

/// Builds an SSH_MSG_SERVICE_REQUEST payload.
pub fn service_request(service: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(MessageType::ServiceRequest as u8);
    put_string(&mut buf, service.as_bytes());
    buf.to_vec()
}

/// Parses an SSH_MSG_SERVICE_ACCEPT payload and returns the service name.
pub fn parse_service_accept(data: &[u8]) -> SkiffResult<String> {
    let mut reader = Reader::new(data);
    let opcode = reader.take_u8("message type")?;
    if opcode != MessageType::ServiceAccept as u8 {
        return Err(SkiffError::Protocol(format!(
            "Expected SSH_MSG_SERVICE_ACCEPT, got opcode {}",
            opcode
        )));
    }
    reader.take_str("service name")
}
