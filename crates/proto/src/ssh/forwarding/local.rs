//! Local port forwarding (direct-tcpip).
//!
//! Listens on a local address; each accepted connection is relayed through
//! a "direct-tcpip" channel to the target address on the server side.

use crate::ssh::channel::{Channel, ChannelEvents, ChannelTable};
use crate::ssh::forwarding::types::ForwardAddr;
use crate::ssh::wire::put_string;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use skiff_platform::{SkiffError, SkiffResult};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Read chunk for the socket-to-channel pump; safely below the maximum
/// packet size we offer on channels.
const PUMP_CHUNK: usize = 16 * 1024;

/// Local port forwarding handle.
///
/// Created by `Connection::forward_local_port`.
pub struct LocalForward {
    listener: TcpListener,
    local_addr: ForwardAddr,
    target: ForwardAddr,
    channels: Arc<ChannelTable>,
}

impl LocalForward {
    pub(crate) fn new(
        listener: TcpListener,
        local_addr: ForwardAddr,
        target: ForwardAddr,
        channels: Arc<ChannelTable>,
    ) -> Self {
        Self {
            listener,
            local_addr,
            target,
            channels,
        }
    }

    /// Returns the local address this forwarder listens on.
    pub fn local_addr(&self) -> &ForwardAddr {
        &self.local_addr
    }

    /// Returns the target address connections are forwarded to.
    pub fn target_addr(&self) -> &ForwardAddr {
        &self.target
    }

    /// Accepts connections until an accept error or cancellation.
    pub async fn run(self) -> SkiffResult<()> {
        info!(
            "Local forward listening on {} -> {}",
            self.local_addr, self.target
        );

        loop {
            let (stream, peer) = self.listener.accept().await.map_err(SkiffError::Io)?;
            let channels = Arc::clone(&self.channels);
            let target = self.target.clone();

            tokio::spawn(async move {
                if let Err(e) = relay_connection(channels, target, stream).await {
                    warn!(peer = %peer, "Local forward connection failed: {}", e);
                }
            });
        }
    }
}

/// Channel events that write inbound channel data to the local socket.
struct SocketPump {
    writer: Mutex<Option<OwnedWriteHalf>>,
}

#[async_trait]
impl ChannelEvents for SocketPump {
    async fn on_data(&self, data: &[u8]) -> SkiffResult<()> {
        let mut writer = self.writer.lock().await;
        if let Some(writer) = writer.as_mut() {
            writer.write_all(data).await.map_err(SkiffError::Io)?;
        }
        Ok(())
    }

    async fn on_eof(&self) -> SkiffResult<()> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        Ok(())
    }

    async fn on_close(&self) -> SkiffResult<()> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        Ok(())
    }
}

/// Opens the direct-tcpip channel for one accepted socket and pumps the
/// socket's bytes into it. The reverse direction flows through
/// [`SocketPump`].
async fn relay_connection(
    channels: Arc<ChannelTable>,
    target: ForwardAddr,
    stream: TcpStream,
) -> SkiffResult<()> {
    let peer = stream.peer_addr().map_err(SkiffError::Io)?;
    let (mut read_half, write_half) = stream.into_split();

    let events = Arc::new(SocketPump {
        writer: Mutex::new(Some(write_half)),
    });

    let mut extra = BytesMut::new();
    put_string(&mut extra, target.host.as_bytes());
    extra.put_u32(target.port);
    put_string(&mut extra, peer.ip().to_string().as_bytes());
    extra.put_u32(u32::from(peer.port()));

    let channel: Arc<Channel> = channels.open_channel("direct-tcpip", &extra, events).await?;
    debug!(channel = channel.local_id(), origin = %peer, "direct-tcpip channel open");

    let mut buf = [0u8; PUMP_CHUNK];
    loop {
        let n = read_half.read(&mut buf).await.map_err(SkiffError::Io)?;
        if n == 0 {
            channel.send_eof().await?;
            break;
        }
        channel.send_data(&buf[..n]).await?;
    }

    Ok(())
}
