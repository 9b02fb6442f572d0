//! Hypervisor process driver interface
use crate::MigrationError;
use async_trait::async_trait;
use monitor_sdk::Monitor;
use monitor_sdk::dto::MonitorFeature;
use shared::def::DomainDef;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use uuid::Uuid;

/// How a freshly launched hypervisor receives the migration byte stream
#[derive(Debug)]
pub enum IncomingTransport {
    /// Listen on `ADDR:PORT`; `[::]` when the binary can bind the IPv6
    /// wildcard
    Tcp { listen: String, port: u16 },
    /// Read the stream from standard input; `source` is the read end of
    /// the pipe the daemon feeds
    Stdio { source: OwnedFd },
}

impl IncomingTransport {
    /// The `-incoming` value handed to the process
    pub fn uri(&self) -> String {
        match self {
            IncomingTransport::Tcp { listen, port } => format!("tcp:{listen}:{port}"),
            IncomingTransport::Stdio { .. } => "stdio".to_string(),
        }
    }
}

/// Launches and kills hypervisor processes on this host.
///
/// The monitor handle returned by `launch_incoming` stays attached to the
/// domain until the process goes away.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Capability probe of the hypervisor binary a guest would run,
    /// answerable before any process exists
    fn hypervisor_supports(&self, feature: MonitorFeature) -> bool;

    /// Start the hypervisor paused, waiting for migration data on the
    /// given transport
    async fn launch_incoming(
        &self,
        def: &DomainDef,
        incoming: IncomingTransport,
    ) -> Result<Arc<dyn Monitor>, MigrationError>;

    /// Kill the process of a domain
    async fn kill(&self, uuid: Uuid) -> Result<(), MigrationError>;
}
