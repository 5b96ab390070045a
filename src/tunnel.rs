//! Secure tunnel management.
//!
//! Exposes a remote service port on a local one by spawning and
//! supervising an ssh forwarding transport. Tunnels are keyed by
//! (worker id, remote target port) and reused while alive; a transport
//! that dies is purged asynchronously so the next demand re-establishes.

use std::collections::{BTreeSet, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::error::{FleetError, Result};

const HEALTH_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Hands out local ports from a bounded range and remembers which are
/// taken, so concurrent tunnels never collide regardless of worker ids.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    span: u16,
    reserved: BTreeSet<u16>,
}

impl PortAllocator {
    pub fn new(base: u16, span: u16) -> Self {
        Self {
            base,
            span,
            reserved: BTreeSet::new(),
        }
    }

    /// Reserve the lowest free port in the range.
    pub fn allocate(&mut self) -> Option<u16> {
        let port = (self.base..self.base.saturating_add(self.span))
            .find(|p| !self.reserved.contains(p))?;
        self.reserved.insert(port);
        Some(port)
    }

    /// Release a reservation. Idempotent.
    pub fn release(&mut self, port: u16) -> bool {
        self.reserved.remove(&port)
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.len()
    }
}

#[derive(Debug)]
struct TunnelEntry {
    local_port: u16,
    connected: bool,
    /// Fired by close_tunnel; the watcher task kills the transport.
    kill: CancellationToken,
}

#[derive(Debug)]
struct TunnelState {
    tunnels: HashMap<(i64, u16), TunnelEntry>,
    allocator: PortAllocator,
}

pub struct TunnelManager {
    config: TunnelConfig,
    // Single point of truth for the registry. The lock only covers the
    // claim (existence check + port reservation + pending entry) and the
    // commit; the spawn and health check run unlocked so one slow
    // establishment never stalls other workers' tunnels.
    state: Arc<Mutex<TunnelState>>,
}

impl TunnelManager {
    pub fn new(config: TunnelConfig) -> Self {
        let allocator = PortAllocator::new(config.base_port, config.port_span);
        Self {
            config,
            state: Arc::new(Mutex::new(TunnelState {
                tunnels: HashMap::new(),
                allocator,
            })),
        }
    }

    /// Open (or reuse) a tunnel forwarding a fresh local port to
    /// `target_port` on the remote worker. Returns the local port once
    /// the forwarded endpoint accepts connections; fails if the transport
    /// dies or the endpoint never becomes reachable within the window.
    pub async fn create_tunnel(
        &self,
        worker_id: i64,
        remote_host: &str,
        ssh_port: u16,
        target_port: u16,
    ) -> Result<u16> {
        let key = (worker_id, target_port);
        loop {
            let claim = {
                let mut state = self.state.lock().await;
                match state.tunnels.get(&key) {
                    Some(entry) if entry.connected => {
                        debug!(worker_id, target_port, local_port = entry.local_port, "reusing tunnel");
                        return Ok(entry.local_port);
                    }
                    // Another call owns the establishment; wait for it to
                    // commit or purge, then re-check.
                    Some(_) => None,
                    None => {
                        let local_port = state
                            .allocator
                            .allocate()
                            .ok_or_else(|| FleetError::Tunnel("no free local ports".to_string()))?;
                        let kill = CancellationToken::new();
                        state.tunnels.insert(
                            key,
                            TunnelEntry {
                                local_port,
                                connected: false,
                                kill: kill.clone(),
                            },
                        );
                        Some((local_port, kill))
                    }
                }
            };

            let Some((local_port, kill)) = claim else {
                tokio::time::sleep(HEALTH_RETRY_INTERVAL).await;
                continue;
            };
            return self
                .establish(key, remote_host, ssh_port, local_port, target_port, kill)
                .await;
        }
    }

    /// Spawn the transport for a claimed pending entry and confirm the
    /// forwarded endpoint end to end. Runs without the registry lock;
    /// commits the entry on success, purges it on any failure.
    async fn establish(
        &self,
        key: (i64, u16),
        remote_host: &str,
        ssh_port: u16,
        local_port: u16,
        target_port: u16,
        kill: CancellationToken,
    ) -> Result<u16> {
        let (worker_id, _) = key;
        info!(
            worker_id,
            remote_host, ssh_port, target_port, local_port, "opening tunnel"
        );

        let mut child = match self
            .transport_command(remote_host, ssh_port, local_port, target_port)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                self.purge(key, local_port).await;
                return Err(FleetError::Tunnel(format!(
                    "failed to spawn transport: {err}"
                )));
            }
        };

        // Forwarding is only trusted once it answers end to end; a window
        // that expires without a connect is a failure, not a maybe.
        let deadline = Instant::now() + self.config.connect_timeout;
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                self.purge(key, local_port).await;
                return Err(FleetError::Tunnel(format!(
                    "transport exited during setup: {status}"
                )));
            }
            match TcpStream::connect(("127.0.0.1", local_port)).await {
                Ok(_) => break,
                Err(err) if Instant::now() >= deadline => {
                    warn!(worker_id, local_port, error = %err, "tunnel never became reachable");
                    let _ = child.kill().await;
                    self.purge(key, local_port).await;
                    return Err(FleetError::Tunnel(format!(
                        "forwarded port {local_port} not reachable within {:?}",
                        self.config.connect_timeout
                    )));
                }
                Err(_) => tokio::time::sleep(HEALTH_RETRY_INTERVAL).await,
            }
        }

        self.spawn_watcher(key, local_port, child, kill.clone());
        let mut state = self.state.lock().await;
        match state.tunnels.get_mut(&key) {
            Some(entry) if entry.local_port == local_port => entry.connected = true,
            // close_tunnel won the race while we were health checking;
            // the cancelled token makes the watcher reap the transport.
            _ => {
                kill.cancel();
                return Err(FleetError::Tunnel(
                    "tunnel closed during establishment".to_string(),
                ));
            }
        }
        info!(worker_id, target_port = key.1, local_port, "tunnel established");
        Ok(local_port)
    }

    /// Drop a pending entry and free its port, unless close_tunnel (or a
    /// successor entry) already took care of it.
    async fn purge(&self, key: (i64, u16), local_port: u16) {
        let mut state = self.state.lock().await;
        let ours = state
            .tunnels
            .get(&key)
            .is_some_and(|e| e.local_port == local_port);
        if ours {
            state.tunnels.remove(&key);
            release_port(&mut state, local_port);
        }
    }

    /// Supervise the transport: if it exits on its own, purge the registry
    /// entry so the next demand re-establishes instead of returning a
    /// stale port.
    fn spawn_watcher(
        &self,
        key: (i64, u16),
        local_port: u16,
        mut child: tokio::process::Child,
        kill: CancellationToken,
    ) {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    warn!(
                        worker_id = key.0,
                        target_port = key.1,
                        local_port,
                        status = ?status.ok(),
                        "tunnel transport exited"
                    );
                    let mut state = state.lock().await;
                    let stale = state
                        .tunnels
                        .get(&key)
                        .is_some_and(|e| e.local_port == local_port);
                    if stale {
                        state.tunnels.remove(&key);
                        release_port(&mut state, local_port);
                    }
                }
                _ = kill.cancelled() => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    debug!(worker_id = key.0, local_port, "tunnel transport terminated");
                }
            }
        });
    }

    /// Tear down a tunnel. Idempotent if none exists.
    pub async fn close_tunnel(&self, worker_id: i64, target_port: u16) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.tunnels.remove(&(worker_id, target_port)) {
            info!(worker_id, target_port, local_port = entry.local_port, "closing tunnel");
            entry.kill.cancel();
            release_port(&mut state, entry.local_port);
        }
    }

    /// The local port for a live, connected tunnel. Advisory only: the
    /// transport may still die between this read and any use of the port.
    pub async fn get_tunnel_port(&self, worker_id: i64, target_port: u16) -> Option<u16> {
        let state = self.state.lock().await;
        state
            .tunnels
            .get(&(worker_id, target_port))
            .filter(|e| e.connected)
            .map(|e| e.local_port)
    }

    fn transport_command(
        &self,
        remote_host: &str,
        ssh_port: u16,
        local_port: u16,
        target_port: u16,
    ) -> Command {
        let mut cmd = Command::new(&self.config.ssh_program);
        cmd.args(self.transport_args(remote_host, ssh_port, local_port, target_port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn transport_args(
        &self,
        remote_host: &str,
        ssh_port: u16,
        local_port: u16,
        target_port: u16,
    ) -> Vec<String> {
        vec![
            "-N".to_string(),
            // Rented hosts rotate constantly; host-key prompting would
            // wedge the transport on first contact.
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-o".to_string(),
            format!("ServerAliveInterval={}", self.config.keepalive_secs),
            "-p".to_string(),
            ssh_port.to_string(),
            "-L".to_string(),
            format!("{local_port}:127.0.0.1:{target_port}"),
            format!("{}@{}", self.config.ssh_user, remote_host),
        ]
    }
}

fn release_port(state: &mut TunnelState, port: u16) {
    state.allocator.release(port);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_hands_out_lowest_free_port() {
        let mut alloc = PortAllocator::new(19000, 3);
        assert_eq!(alloc.allocate(), Some(19000));
        assert_eq!(alloc.allocate(), Some(19001));
        assert_eq!(alloc.allocate(), Some(19002));
        assert_eq!(alloc.allocate(), None);

        assert!(alloc.release(19001));
        assert_eq!(alloc.allocate(), Some(19001));
    }

    #[test]
    fn allocator_release_is_idempotent() {
        let mut alloc = PortAllocator::new(19000, 2);
        let port = alloc.allocate().unwrap();
        assert!(alloc.release(port));
        assert!(!alloc.release(port));
        assert_eq!(alloc.reserved_count(), 0);
    }

    #[test]
    fn transport_args_forward_local_to_target() {
        let manager = TunnelManager::new(TunnelConfig::default());
        let args = manager.transport_args("203.0.113.9", 2222, 18800, 8188);
        assert!(args.contains(&"-N".to_string()));
        assert!(args.contains(&"18800:127.0.0.1:8188".to_string()));
        assert!(args.contains(&"2222".to_string()));
        assert!(args.contains(&"root@203.0.113.9".to_string()));
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(args.contains(&"ExitOnForwardFailure=yes".to_string()));
    }
}
