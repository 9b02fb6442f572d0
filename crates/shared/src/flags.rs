//! Public migration flag word
use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Flags accepted by every public migration entry point.
    ///
    /// The word travels to the destination daemon unchanged except for
    /// `ABORT_ON_ERROR` (source-local) and `CHANGE_PROTECTION` (stripped
    /// for peer-to-peer, where begin and perform share one job anyway).
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct MigrateFlags: u32 {
        /// Keep the guest running while its state is transferred
        const LIVE = 1 << 0;
        /// The source daemon drives the destination daemon directly
        const PEER2PEER = 1 << 1;
        /// Carry the hypervisor byte stream over the control connection
        const TUNNELLED = 1 << 2;
        /// Define the guest persistently on the destination
        const PERSIST_DEST = 1 << 3;
        /// Remove the persistent definition from the source on success
        const UNDEFINE_SOURCE = 1 << 4;
        /// Leave the guest paused on the destination
        const PAUSED = 1 << 5;
        /// Copy non-shared storage in full before the main migration
        const NON_SHARED_DISK = 1 << 6;
        /// Copy non-shared storage incrementally before the main migration
        const NON_SHARED_INC = 1 << 7;
        /// Keep the migration job held across Begin..Confirm
        const CHANGE_PROTECTION = 1 << 8;
        /// Skip the disk cache safety gate
        const UNSAFE = 1 << 9;
        /// Migrate the definition of a powered-off guest
        const OFFLINE = 1 << 10;
        /// Enable compression of the migration stream
        const COMPRESSED = 1 << 11;
        /// Cancel the migration if the guest pauses on an I/O error
        const ABORT_ON_ERROR = 1 << 12;
    }
}

impl MigrateFlags {
    /// Either flavour of pre-copied non-shared storage
    pub fn wants_storage_copy(&self) -> bool {
        self.intersects(MigrateFlags::NON_SHARED_DISK | MigrateFlags::NON_SHARED_INC)
    }
}
