//! Storage-copy engine
//!
//! Pre-copies non-shared disks before the main migration: the destination
//! runs an NBD server exporting each disk, the source mirrors onto it with
//! `drive-mirror` and waits for every disk to reach mirrored-sync. Once all
//! disks are in sync the NON_SHARED bits are dropped from the `migrate`
//! command so block data is not shipped twice.
use crate::MigrationError;
use crate::constants::{DRIVE_HOST_PREFIX, MIRROR_POLL_INTERVAL};
use crate::domain::Domain;
use crate::ports::PortService;
use monitor_sdk::Monitor;
use monitor_sdk::dto::{MigrateStepFlags, MirrorFlags};
use shared::cookie::Cookie;
use std::sync::Arc;
use tokio::time::sleep;

fn export_name(alias: &str) -> String {
    format!("{DRIVE_HOST_PREFIX}{alias}")
}

/// `nbd:HOST:PORT:exportname=ALIAS`, host bracketed when it is a literal
/// IPv6 address
fn nbd_url(host: &str, port: u16, export: &str) -> String {
    if host.contains(':') {
        format!("nbd:[{host}]:{port}:exportname={export}")
    } else {
        format!("nbd:{host}:{port}:exportname={export}")
    }
}

async fn mirror_candidates(domain: &Arc<Domain>) -> (Option<Arc<dyn Monitor>>, Vec<String>) {
    let inner = domain.lock().await;
    let aliases = inner
        .def
        .disks
        .iter()
        .filter(|disk| disk.is_mirror_candidate())
        .map(|disk| disk.alias.clone())
        .collect();
    (inner.monitor.clone(), aliases)
}

/// Destination side: start the NBD server and export every eligible disk.
///
/// A single port is taken from the allocator on the first eligible disk and
/// released again on every failure path; on success it is published to the
/// source through the cookie.
pub async fn start_nbd_server(
    domain: &Arc<Domain>,
    ports: &PortService,
    listen_addr: &str,
) -> Result<(), MigrationError> {
    let host = if listen_addr == "[::]" {
        "::"
    } else {
        listen_addr
    };

    let (monitor, aliases) = mirror_candidates(domain).await;
    let monitor = monitor
        .ok_or_else(|| MigrationError::OperationInvalid("domain is not running".into()))?;

    let mut port = 0u16;
    let result: Result<(), MigrationError> = async {
        for alias in &aliases {
            if port == 0 {
                port = ports
                    .acquire_nbd()
                    .map_err(|err| MigrationError::OperationFailed(err.to_string()))?;
                monitor.nbd_server_start(host, port).await?;
            }
            monitor.nbd_server_add(&export_name(alias), true).await?;
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            domain.lock().await.nbd_port = port;
            Ok(())
        }
        Err(err) => {
            ports.release_nbd(port);
            Err(err)
        }
    }
}

/// Destination side: tear the NBD server down after Finish and return the
/// port to the pool. Warn-only; the guest is already past the point where
/// this could matter.
pub async fn stop_nbd_server(domain: &Arc<Domain>, ports: &PortService, cookie: &Cookie) {
    if cookie.nbd.is_none() {
        return;
    }

    let (monitor, port) = {
        let inner = domain.lock().await;
        (inner.monitor.clone(), inner.nbd_port)
    };
    if let Some(monitor) = monitor
        && let Err(err) = monitor.nbd_server_stop().await
    {
        tracing::warn!("unable to stop NBD server: {err}");
    }

    ports.release_nbd(port);
    domain.lock().await.nbd_port = 0;
}

/// Source side: mirror every eligible disk onto the destination NBD server
/// and wait for mirrored-sync.
///
/// On success the NON_SHARED bits are cleared from `monitor_flags`. The NBD
/// port is stolen from the cookie so it does not propagate back to the
/// destination with the reply.
pub async fn drive_mirror(
    domain: &Arc<Domain>,
    cookie: &mut Cookie,
    host: Option<&str>,
    speed_mib: u64,
    monitor_flags: &mut MigrateStepFlags,
) -> Result<(), MigrationError> {
    if !monitor_flags
        .intersects(MigrateStepFlags::NON_SHARED_DISK | MigrateStepFlags::NON_SHARED_INC)
    {
        return Ok(());
    }

    let port = match cookie.nbd.as_mut() {
        Some(nbd) if nbd.port != 0 => std::mem::take(&mut nbd.port),
        _ => {
            tracing::debug!(
                "destination does not offer an NBD server, falling back to \
                 in-stream block transfer"
            );
            return Ok(());
        }
    };
    let Some(host) = host else {
        tracing::debug!("destination host unknown, skipping storage pre-copy");
        return Ok(());
    };

    let mut mirror_flags = MirrorFlags::REUSE_EXT;
    if monitor_flags.contains(MigrateStepFlags::NON_SHARED_INC) {
        mirror_flags |= MirrorFlags::SHALLOW;
    }

    let (monitor, aliases) = mirror_candidates(domain).await;
    let monitor = monitor
        .ok_or_else(|| MigrationError::OperationInvalid("domain is not running".into()))?;
    let abort = {
        let mut inner = domain.lock().await;
        inner
            .job_mut()
            .map(|job| job.abort.clone())
            .ok_or_else(|| MigrationError::Internal("no migration job for storage copy".into()))?
    };

    let mut started: Vec<String> = Vec::new();
    let result: Result<(), MigrationError> = async {
        for alias in &aliases {
            let export = export_name(alias);
            let target = nbd_url(host, port, &export);

            monitor
                .drive_mirror(&export, &target, speed_mib, mirror_flags)
                .await?;
            started.push(export.clone());

            loop {
                if abort.is_cancelled() {
                    return Err(MigrationError::aborted_by_client("migration out job"));
                }
                let info = monitor.block_job_info(&export).await?;
                if info.cur == info.end {
                    tracing::debug!(disk = %export, "drive mirroring completed");
                    break;
                }
                tokio::select! {
                    _ = sleep(MIRROR_POLL_INTERVAL) => {}
                    _ = abort.cancelled() => {}
                }
            }
        }
        Ok(())
    }
    .await;

    if let Err(err) = result {
        // roll back in reverse order; never let a cleanup failure replace
        // the original error
        for export in started.iter().rev() {
            if let Err(cancel_err) = monitor.block_job_abort(export).await {
                tracing::warn!(disk = %export, "unable to cancel block job: {cancel_err}");
            }
        }
        return Err(err);
    }

    monitor_flags
        .remove(MigrateStepFlags::NON_SHARED_DISK | MigrateStepFlags::NON_SHARED_INC);
    Ok(())
}

/// Abort every mirror job of the domain, best effort. Runs both after a
/// failed Perform and after a successful one, where the mirrors are still
/// in their synchronised phase and must be cancelled before the handover.
pub async fn cancel_drive_mirror(domain: &Arc<Domain>) {
    let (monitor, aliases) = mirror_candidates(domain).await;
    let Some(monitor) = monitor else {
        return;
    };
    for alias in &aliases {
        let export = export_name(alias);
        if let Err(err) = monitor.block_job_abort(&export).await {
            tracing::warn!(disk = %export, "unable to stop block job: {err}");
        }
    }
}
