use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::ProxySection;

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, program: &Path, args: &[String]) -> std::io::Result<ExitStatus>;
}

pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, program: &Path, args: &[String]) -> std::io::Result<ExitStatus> {
        Command::new(program).args(args).status().await
    }
}

/// Anonymizing egress circuit, consumed as a capability.
///
/// The core does not supervise the proxy process; it only needs the local
/// SOCKS endpoint and a way to ask for a fresh circuit. Rebuild requests
/// are tolerant: they may fail or take several seconds, and neither
/// outcome affects the requesting job beyond its own retry schedule.
#[async_trait]
pub trait CircuitControl: Send + Sync {
    /// Local SOCKS endpoint, `None` when downloads go out directly.
    fn socks_url(&self) -> Option<String>;

    async fn request_rebuild(&self);
}

pub struct TorCircuit {
    socks_addr: String,
    rebuild_command: Vec<String>,
    executor: Arc<dyn CommandExecutor>,
}

impl TorCircuit {
    pub fn new(config: &ProxySection) -> Self {
        Self {
            socks_addr: config.socks_addr.clone(),
            rebuild_command: config.rebuild_command.clone(),
            executor: Arc::new(SystemCommandExecutor),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }
}

#[async_trait]
impl CircuitControl for TorCircuit {
    fn socks_url(&self) -> Option<String> {
        Some(self.socks_addr.clone())
    }

    async fn request_rebuild(&self) {
        let Some((program, args)) = self.rebuild_command.split_first() else {
            warn!("circuit rebuild requested but no rebuild command configured");
            return;
        };
        info!(command = %program, "requesting egress circuit rebuild");
        match self.executor.run(Path::new(program), args).await {
            Ok(status) if status.success() => {
                info!("egress circuit rebuild requested successfully");
            }
            Ok(status) => {
                warn!(code = ?status.code(), "circuit rebuild command exited non-zero");
            }
            Err(err) => {
                warn!(error = %err, "circuit rebuild command failed to run");
            }
        }
    }
}

/// Egress without a proxy: no SOCKS endpoint, rebuild is a no-op.
#[derive(Debug, Default)]
pub struct DirectEgress;

#[async_trait]
impl CircuitControl for DirectEgress {
    fn socks_url(&self) -> Option<String> {
        None
    }

    async fn request_rebuild(&self) {}
}

/// Builds the egress capability described by the proxy config section.
pub fn egress_from_config(config: &ProxySection) -> Arc<dyn CircuitControl> {
    if config.enabled {
        Arc::new(TorCircuit::new(config))
    } else {
        Arc::new(DirectEgress)
    }
}
