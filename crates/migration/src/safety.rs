//! Pre-flight safety and policy gate
use crate::MigrationError;
use crate::domain::DomainInner;
use shared::def::{CacheMode, DiskSource, DomainDef, FilesystemKind, HostdevKind};

/// Whether migrating this domain is allowed at all. Evaluated before any
/// side effect; callers fail closed.
pub fn is_allowed(
    inner: &DomainInner,
    remote: bool,
    abort_on_error: bool,
) -> Result<(), MigrationError> {
    if inner.auto_destroy {
        return Err(MigrationError::OperationInvalid(
            "domain is marked for auto destroy".into(),
        ));
    }

    if remote {
        if inner.num_snapshots > 0 {
            return Err(MigrationError::OperationInvalid(format!(
                "cannot migrate domain with {} snapshots",
                inner.num_snapshots
            )));
        }
        if abort_on_error && inner.state.paused_on_io_error() {
            return Err(MigrationError::OperationInvalid(
                "cannot migrate domain with I/O error".into(),
            ));
        }
    }

    if inner.block_job_active {
        return Err(MigrationError::OperationInvalid(
            "domain has an active block job".into(),
        ));
    }

    is_allowed_def(&inner.def)
}

/// The definition-only subset of the checks, used on the destination where
/// no runtime state exists yet
pub fn is_allowed_def(def: &DomainDef) -> Result<(), MigrationError> {
    // USB host devices survive migration, everything else is pinned to the
    // source host
    if def
        .hostdevs
        .iter()
        .any(|hostdev| hostdev.kind != HostdevKind::Usb)
    {
        return Err(MigrationError::OperationInvalid(
            "domain has assigned non-USB host devices".into(),
        ));
    }
    Ok(())
}

/// Whether the disk setup can migrate without risking data corruption.
/// Overridable by the caller's UNSAFE flag.
pub fn is_safe(def: &DomainDef) -> Result<(), MigrationError> {
    for disk in &def.disks {
        let Some(source) = &disk.source else {
            continue;
        };
        if disk.shared || disk.readonly || disk.cache == CacheMode::Disabled {
            continue;
        }

        let coherent = match source {
            DiskSource::File { filesystem, .. } => matches!(
                filesystem,
                FilesystemKind::Shared | FilesystemKind::Cluster
            ),
            DiskSource::Network { protocol, .. } => protocol.is_self_coherent(),
        };
        if coherent {
            continue;
        }

        return Err(MigrationError::Unsafe(
            "migration may lead to data corruption if disks use cache != none".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Domain, DomainState, PausedReason};
    use shared::def::{DiskDef, HostdevDef, NetworkDiskProtocol};
    use uuid::Uuid;

    fn def() -> DomainDef {
        DomainDef {
            name: "guest".into(),
            uuid: Uuid::new_v4(),
            memory_kib: 1024,
            vcpus: 1,
            disks: vec![],
            nets: vec![],
            graphics: vec![],
            hostdevs: vec![],
        }
    }

    fn disk(source: DiskSource, cache: CacheMode) -> DiskDef {
        DiskDef {
            alias: "virtio-disk0".into(),
            source: Some(source),
            shared: false,
            readonly: false,
            cache,
        }
    }

    #[tokio::test]
    async fn auto_destroy_and_snapshots_block_migration() {
        let domain = Domain::new(def(), DomainState::Running, true);
        {
            let mut inner = domain.lock().await;
            inner.auto_destroy = true;
            assert!(is_allowed(&inner, true, false).is_err());
            inner.auto_destroy = false;

            inner.num_snapshots = 2;
            assert!(is_allowed(&inner, true, false).is_err());
            // snapshots only matter for remote migration
            assert!(is_allowed(&inner, false, false).is_ok());
        }
    }

    #[tokio::test]
    async fn io_error_pause_blocks_only_with_abort_on_error() {
        let domain = Domain::new(def(), DomainState::Paused(PausedReason::IoError), true);
        let inner = domain.lock().await;
        assert!(is_allowed(&inner, true, false).is_ok());
        assert!(is_allowed(&inner, true, true).is_err());
    }

    #[test]
    fn non_usb_hostdevs_are_forbidden() {
        let mut d = def();
        d.hostdevs.push(HostdevDef {
            kind: HostdevKind::Usb,
        });
        assert!(is_allowed_def(&d).is_ok());
        d.hostdevs.push(HostdevDef {
            kind: HostdevKind::Pci,
        });
        assert!(is_allowed_def(&d).is_err());
    }

    #[test]
    fn cached_local_disk_is_unsafe() {
        let mut d = def();
        d.disks.push(disk(
            DiskSource::File {
                path: "/var/lib/a.qcow2".into(),
                filesystem: FilesystemKind::Local,
            },
            CacheMode::Writeback,
        ));
        assert!(is_safe(&d).is_err());

        d.disks[0].cache = CacheMode::Disabled;
        assert!(is_safe(&d).is_ok());
    }

    #[test]
    fn shared_filesystems_and_coherent_protocols_are_safe() {
        let mut d = def();
        d.disks.push(disk(
            DiskSource::File {
                path: "/gluster/a.qcow2".into(),
                filesystem: FilesystemKind::Cluster,
            },
            CacheMode::Writeback,
        ));
        d.disks.push(disk(
            DiskSource::Network {
                protocol: NetworkDiskProtocol::Rbd,
                path: "pool/image".into(),
            },
            CacheMode::Writeback,
        ));
        assert!(is_safe(&d).is_ok());

        d.disks.push(disk(
            DiskSource::Network {
                protocol: NetworkDiskProtocol::Nbd,
                path: "export".into(),
            },
            CacheMode::Writeback,
        ));
        assert!(is_safe(&d).is_err());
    }
}
