use std::time::Duration;

/// Configuration for the per-worker monitoring loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between status checks for a monitored worker.
    pub poll_interval: Duration,
    /// Hard ceiling on checks before the monitor gives up on a worker.
    pub max_checks: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_checks: 40,
        }
    }
}

/// Configuration for the secure tunnel manager.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Program spawned as the forwarding transport.
    pub ssh_program: String,
    /// Remote login user for the transport.
    pub ssh_user: String,
    /// First local port handed out by the allocator.
    pub base_port: u16,
    /// Number of local ports reserved for tunnels.
    pub port_span: u16,
    /// How long to wait for the forwarded port to accept connections.
    pub connect_timeout: Duration,
    /// ServerAliveInterval passed to the transport, in seconds.
    pub keepalive_secs: u32,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            ssh_user: "root".to_string(),
            base_port: 18800,
            port_span: 200,
            connect_timeout: Duration::from_secs(5),
            keepalive_secs: 60,
        }
    }
}

/// Configuration for talking to a worker's compute engine.
#[derive(Debug, Clone)]
pub struct ComfyConfig {
    /// Port the engine listens on (on the worker, or forwarded locally).
    pub engine_port: u16,
    /// Timeout for the liveness probe.
    pub status_timeout: Duration,
    /// Timeout for catalog introspection.
    pub object_info_timeout: Duration,
    /// Timeout for job submission.
    pub queue_timeout: Duration,
    /// Timeout for history lookups.
    pub history_timeout: Duration,
    /// Name of the setup script that bootstraps the engine.
    pub setup_script_name: String,
    /// Marker substring identifying a negative-prompt placeholder in
    /// untagged legacy templates.
    pub negative_marker: String,
}

impl Default for ComfyConfig {
    fn default() -> Self {
        Self {
            engine_port: 8188,
            status_timeout: Duration::from_secs(8),
            object_info_timeout: Duration::from_secs(10),
            queue_timeout: Duration::from_secs(15),
            history_timeout: Duration::from_secs(10),
            setup_script_name: "comfyui-setup".to_string(),
            negative_marker: "negative".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FleetConfig {
    pub scheduler: SchedulerConfig,
    pub tunnel: TunnelConfig,
    pub comfy: ComfyConfig,
}
