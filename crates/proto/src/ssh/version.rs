//! SSH version exchange (RFC 4253 Section 4.2).
//!
//! Before any binary packet flows, both sides send a single identification
//! line of the form `SSH-2.0-softwareversion [comments]`. The server may
//! precede its identification line with free-form banner lines, which are
//! skipped. The line terminator we send is caller-configured (CRLF for
//! standard servers).

use skiff_platform::{SkiffError, SkiffResult};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

/// Longest identification line we accept, per RFC 4253 Section 4.2.
const MAX_VERSION_LINE: usize = 255;

/// Most banner lines tolerated before the identification line.
const MAX_BANNER_LINES: usize = 64;

/// An SSH protocol version identification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    software: String,
    comments: Option<String>,
}

impl Version {
    /// Creates a new version with the given software identifier.
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            software: software.to_string(),
            comments: comments.map(str::to_string),
        }
    }

    /// Returns the software identifier.
    pub fn software(&self) -> &str {
        &self.software
    }

    /// Parses an identification line.
    ///
    /// Accepts protocol versions "2.0" and "1.99" (a 2.0-compatible server
    /// advertising SSH1 fallback).
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] for malformed lines or unsupported
    /// protocol versions.
    pub fn parse(line: &str) -> SkiffResult<Self> {
        let line = line.trim_end_matches(['\r', '\n']);

        let rest = line
            .strip_prefix("SSH-")
            .ok_or_else(|| SkiffError::Protocol(format!("Not an SSH identification: {}", line)))?;

        let (proto, software) = rest
            .split_once('-')
            .ok_or_else(|| SkiffError::Protocol(format!("Malformed version line: {}", line)))?;

        if proto != "2.0" && proto != "1.99" {
            return Err(SkiffError::Protocol(format!(
                "Unsupported protocol version: {}",
                proto
            )));
        }

        let (software, comments) = match software.split_once(' ') {
            Some((sw, rest)) => (sw.to_string(), Some(rest.to_string())),
            None => (software.to_string(), None),
        };

        Ok(Self { software, comments })
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-2.0-{}", self.software)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

/// Reads the server's identification line, skipping any banner lines.
///
/// Returns the raw identification line without the terminator; the caller
/// keeps it verbatim for the exchange hash.
pub async fn read_remote_version(stream: &mut TcpStream) -> SkiffResult<String> {
    for _ in 0..MAX_BANNER_LINES {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            stream.read_exact(&mut byte).await.map_err(SkiffError::Io)?;
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);

            if line.len() > MAX_VERSION_LINE {
                return Err(SkiffError::Protocol("Version string too long".to_string()));
            }
        }

        if line.last() == Some(&b'\r') {
            line.pop();
        }

        let text = String::from_utf8_lossy(&line).to_string();
        if text.starts_with("SSH-") {
            return Ok(text);
        }
        // Pre-identification banner line, skip it.
    }

    Err(SkiffError::Protocol(
        "Server sent too many banner lines before its version".to_string(),
    ))
}
