//! Monitor client trait
use crate::dto::{
    BlockJobInfo, GraphicsRelocation, MigrateCapability, MigrateStepFlags, MigrationStats,
    MigrationStatus, MirrorFlags, MonitorFeature,
};
use async_trait::async_trait;
use std::os::fd::OwnedFd;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Monitor command failed: {0}")]
    CommandFailed(String),

    #[error("Monitor channel closed")]
    Disconnected,

    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Guest unexpectedly quit")]
    GuestGone,
}

/// Control channel of a running hypervisor process.
///
/// One instance is attached to a domain for the lifetime of its process.
/// Commands serialise on the channel internally; callers never hold the
/// domain lock across an in-flight command.
#[async_trait]
pub trait Monitor: Send + Sync {
    /// Whether the hypervisor binary behind this monitor has a feature
    fn supports(&self, feature: MonitorFeature) -> bool;

    /// Start migrating towards a TCP endpoint the hypervisor connects to
    async fn migrate_to_host(
        &self,
        flags: MigrateStepFlags,
        host: &str,
        port: u16,
    ) -> Result<(), MonitorError>;

    /// Start migrating into a pre-connected file descriptor
    async fn migrate_to_fd(&self, flags: MigrateStepFlags, fd: OwnedFd)
    -> Result<(), MonitorError>;

    /// Start migrating towards a unix socket path
    async fn migrate_to_unix(&self, flags: MigrateStepFlags, path: &str)
    -> Result<(), MonitorError>;

    /// Abort the migration started by one of the `migrate_to_*` commands
    async fn migrate_cancel(&self) -> Result<(), MonitorError>;

    /// Poll migration progress
    async fn query_migration(&self) -> Result<(MigrationStatus, MigrationStats), MonitorError>;

    /// Cap the migration transfer rate, in MiB/s
    async fn set_migration_speed(&self, bandwidth_mib: u64) -> Result<(), MonitorError>;

    /// Whether a per-migration capability can be enabled
    async fn query_migrate_capability(&self, cap: MigrateCapability)
    -> Result<bool, MonitorError>;

    /// Toggle a per-migration capability
    async fn set_migrate_capability(
        &self,
        cap: MigrateCapability,
        enabled: bool,
    ) -> Result<(), MonitorError>;

    /// Start the built-in NBD server on the given listen address
    async fn nbd_server_start(&self, host: &str, port: u16) -> Result<(), MonitorError>;

    /// Export a block device through the running NBD server
    async fn nbd_server_add(&self, device: &str, writable: bool) -> Result<(), MonitorError>;

    /// Tear down the NBD server and all its exports
    async fn nbd_server_stop(&self) -> Result<(), MonitorError>;

    /// Start mirroring a drive onto a target URL
    async fn drive_mirror(
        &self,
        device: &str,
        target: &str,
        speed_mib: u64,
        flags: MirrorFlags,
    ) -> Result<(), MonitorError>;

    /// Progress of the block job running on a device
    async fn block_job_info(&self, device: &str) -> Result<BlockJobInfo, MonitorError>;

    /// Cancel the block job running on a device
    async fn block_job_abort(&self, device: &str) -> Result<(), MonitorError>;

    /// Resume guest CPUs
    async fn cont(&self) -> Result<(), MonitorError>;

    /// Pause guest CPUs
    async fn stop(&self) -> Result<(), MonitorError>;

    /// Point the display server at its migration peer
    async fn graphics_relocate(&self, info: GraphicsRelocation) -> Result<(), MonitorError>;

    /// Whether the display server finished handing over its session
    async fn query_display_migrated(&self) -> Result<bool, MonitorError>;
}
