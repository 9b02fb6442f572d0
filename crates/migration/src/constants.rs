use std::time::Duration;

/// First port handed to incoming hypervisors, tried round-robin
pub const MIGRATION_PORT_FIRST: u16 = 49152;

/// Size of the round-robin migration port pool
pub const MIGRATION_PORT_COUNT: u16 = 64;

/// NBD servers for storage pre-copy bind inside this range
pub const NBD_PORT_FIRST: u16 = 49216;
pub const NBD_PORT_COUNT: u16 = 64;

/// Poll period for migration progress and display-session drain
pub const PROGRESS_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Poll period for drive-mirror block jobs
pub const MIRROR_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Reused copy buffer of the tunnel worker
pub const TUNNEL_SEND_BUF_SIZE: usize = 64 * 1024;

/// Exports on the destination NBD server are named with this prefix plus
/// the disk alias, mirroring the hypervisor's own drive ids
pub const DRIVE_HOST_PREFIX: &str = "drive-";

/// Transfer-rate cap applied when the caller does not pass a bandwidth,
/// in MiB/s
pub const DEFAULT_MIGRATION_BANDWIDTH_MIB: u64 = 32;
