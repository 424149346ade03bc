use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::codec::LineCodec;
use crate::dispatch::Dispatcher;
use crate::registry::SessionRegistry;

/// Line terminator used for every server-to-client message.
const LINE_TERMINATOR: &[u8] = b"\n";

/// How long shutdown waits for live sessions to drain before giving up.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

// The version shown is the one carried in the persisted state, which
// survives mutations, not the compiled package version.
fn welcome_banner(agent_name: &str, agent_version: &str) -> String {
    format!(
        "==================================\n  {agent_name} v{agent_version} - self-rewriting agent\n==================================\ntype /help for available commands"
    )
}

/// TCP session server: owns the listening endpoint, accepts connections,
/// spawns one task per connection, and coordinates shutdown.
pub struct SessionServer {
    listener: TcpListener,
    agent_name: String,
    agent_version: String,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<SessionRegistry>,
    shutdown: watch::Receiver<bool>,
}

impl SessionServer {
    pub async fn bind(
        host: &str,
        port: u16,
        agent_name: String,
        agent_version: String,
        dispatcher: Arc<Dispatcher>,
        registry: Arc<SessionRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        Ok(Self {
            listener,
            agent_name,
            agent_version,
            dispatcher,
            registry,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Returns once shutdown is signalled and the live sessions
    /// have drained (or the drain window expires).
    pub async fn run(mut self) {
        match self.listener.local_addr() {
            Ok(addr) => info!(addr = %addr, "listening"),
            Err(_) => info!("listening"),
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let session_id = peer.to_string();
                            let dispatcher = self.dispatcher.clone();
                            let registry = self.registry.clone();
                            let shutdown = self.shutdown.clone();
                            let banner = welcome_banner(&self.agent_name, &self.agent_version);
                            tokio::spawn(async move {
                                if let Err(e) = handle_session(
                                    stream,
                                    &session_id,
                                    &banner,
                                    dispatcher,
                                    registry.clone(),
                                    shutdown,
                                )
                                .await
                                {
                                    warn!(session = %session_id, error = %e, "session ended with error");
                                }
                                registry.remove(&session_id);
                                info!(session = %session_id, "disconnected");
                            });
                        }
                        Err(e) => error!(error = %e, "accept failed"),
                    }
                }
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        info!("shutdown: no longer accepting connections");
                        break;
                    }
                }
            }
        }

        // Every session observes the same shutdown signal; give them a moment
        // to flush and deregister before the caller persists state.
        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN;
        while !self.registry.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        if self.registry.is_empty() {
            info!("all sessions closed");
        } else {
            warn!(remaining = self.registry.len(), "sessions still open at shutdown deadline");
        }
    }
}

/// One connection's lifecycle: register, banner, then a select loop over
/// inbound bytes, queued broadcasts and the shutdown signal, so no wait is
/// ever unbounded.
async fn handle_session(
    stream: TcpStream,
    session_id: &str,
    banner: &str,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<SessionRegistry>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    registry.register(session_id.to_string(), outbound_tx);
    info!(session = %session_id, "connected");

    let (mut reader, mut writer) = stream.into_split();
    writer.write_all(banner.as_bytes()).await?;
    writer.write_all(LINE_TERMINATOR).await?;

    let mut codec = LineCodec::new();
    let mut read_buf = [0u8; 4096];

    loop {
        tokio::select! {
            read = reader.read(&mut read_buf) => {
                let n = read?;
                if n == 0 {
                    break; // peer closed
                }
                let lines = match codec.feed(&read_buf[..n]) {
                    Ok(lines) => lines,
                    Err(e) => {
                        warn!(session = %session_id, error = %e, "protocol error, dropping connection");
                        break;
                    }
                };
                let mut close = false;
                for line in lines {
                    let outcome = dispatcher.dispatch(session_id, &line).await;
                    writer.write_all(outcome.reply.as_bytes()).await?;
                    writer.write_all(LINE_TERMINATOR).await?;
                    if outcome.close {
                        close = true;
                        break;
                    }
                }
                if close {
                    break;
                }
            }
            queued = outbound_rx.recv() => {
                match queued {
                    Some(message) => {
                        writer.write_all(message.as_bytes()).await?;
                        writer.write_all(LINE_TERMINATOR).await?;
                    }
                    // Sender side gone: the registry pruned this session
                    // after a failed broadcast.
                    None => break,
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = writer.write_all(b"server shutting down").await;
                    let _ = writer.write_all(LINE_TERMINATOR).await;
                    break;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_welcome_banner_shows_state_version() {
        let banner = welcome_banner("morph-agent", "2.4.0");
        assert!(banner.contains("morph-agent v2.4.0"));
        assert!(banner.contains("/help"));
    }
}
