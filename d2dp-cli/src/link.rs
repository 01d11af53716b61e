//! UDP link setup from the `[link]` configuration section

use crate::config::{CliConfig, ConfigError};
use d2dp::UdpLink;
use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum LinkSetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Socket error: {0}")]
    Socket(#[from] d2dp::io::SocketError),

    #[error("No peer address configured")]
    NoPeer,
}

/// Bind and connect a UDP link; `local` and `peer` override the file
pub fn open_link(
    config: &CliConfig,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
) -> Result<UdpLink, LinkSetupError> {
    let local = local.unwrap_or(config.link.local);
    let peer = peer.or(config.link.peer).ok_or(LinkSetupError::NoPeer)?;

    let link = UdpLink::connect(local, peer)?;
    link.set_poll_interval(config.poll_interval()?)?;
    if let Some(size) = config.link.send_buffer_size {
        link.set_send_buffer_size(size)?;
    }
    if let Some(size) = config.link.recv_buffer_size {
        link.set_recv_buffer_size(size)?;
    }

    tracing::info!(local = %link.local_addr()?, %peer, "link ready");
    Ok(link)
}
