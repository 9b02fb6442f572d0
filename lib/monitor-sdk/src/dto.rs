//! Monitor DTOs
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

bitflags::bitflags! {
    /// Flags accepted by the `migrate` command
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct MigrateStepFlags: u32 {
        /// Run the migration without blocking the monitor
        const BACKGROUND = 1 << 0;
        /// Ship full copies of non-shared block devices in-stream
        const NON_SHARED_DISK = 1 << 1;
        /// Ship incremental copies of non-shared block devices in-stream
        const NON_SHARED_INC = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Flags accepted by the `drive-mirror` command
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct MirrorFlags: u32 {
        /// Reuse the existing destination image instead of creating one
        const REUSE_EXT = 1 << 0;
        /// Copy only the top image, keeping the backing chain shared
        const SHALLOW = 1 << 1;
    }
}

/// Answer of `query-migrate`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStatus {
    /// No migration has been started on this monitor
    Inactive,
    /// Data is being transferred
    Active,
    /// The stream finished and the device state was sent
    Completed,
    /// The migration failed inside the hypervisor
    Error,
    /// `migrate_cancel` took effect
    Cancelled,
}

/// Byte counters reported alongside [`MigrationStatus::Active`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStats {
    pub ram_transferred: u64,
    pub ram_remaining: u64,
    pub ram_total: u64,
    pub disk_transferred: u64,
    pub disk_remaining: u64,
    pub disk_total: u64,
}

/// Progress of a single block job as reported by `query-block-jobs`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockJobInfo {
    /// Offset reached so far
    pub cur: u64,
    /// Offset at which the job is considered synchronised
    pub end: u64,
}

/// Static capabilities of the hypervisor binary behind a monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorFeature {
    /// `nbd-server-start` and friends are available
    NbdServer,
    /// The incoming side may listen on an IPv6 wildcard address
    Ipv6Migration,
    /// Migration data may be handed over a pre-opened file descriptor
    FdMigration,
    /// Migration data may be pointed at a unix socket
    UnixMigration,
    /// The display server hands its session over before the guest stops
    SeamlessGraphics,
}

/// Capabilities toggled per-migration via `migrate-set-capabilities`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrateCapability {
    /// Delta compression of re-dirtied RAM pages
    Xbzrle,
}

/// Parameters of `client_migrate_info` for relocating a graphics session
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphicsRelocation {
    /// Display protocol name, e.g. `spice`
    pub protocol: String,
    /// Hostname the client should reconnect to
    pub hostname: String,
    pub port: Option<u16>,
    pub tls_port: Option<u16>,
    /// Expected x509 subject of the destination display server
    pub tls_subject: Option<String>,
}
