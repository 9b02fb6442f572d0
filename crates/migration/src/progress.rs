//! Monitor supervisor: the live progress loop
use crate::MigrationError;
use crate::constants::PROGRESS_POLL_INTERVAL;
use crate::domain::Domain;
use crate::job::JobState;
use crate::remote::PeerDaemon;
use monitor_sdk::dto::{MigrationStatus, MonitorFeature};
use shared::def::GraphicsKind;
use std::sync::Arc;
use tokio::time::sleep;

/// One `query-migrate` round trip, folded into the job status snapshot.
///
/// The domain lock is only held to read the monitor handle and to store the
/// result; the round trip itself runs unlocked.
pub async fn update_job_status(
    domain: &Arc<Domain>,
    job_label: &str,
) -> Result<(), MigrationError> {
    let monitor = { domain.lock().await.monitor()? };
    let polled = monitor.query_migration().await;

    let mut inner = domain.lock().await;
    let Some(job) = inner.job_mut() else {
        return Err(MigrationError::Internal(format!(
            "{job_label} vanished while polling progress"
        )));
    };

    let (status, stats) = match polled {
        Ok(answer) => answer,
        Err(err) => {
            job.info.state = JobState::Failed;
            return Err(err.into());
        }
    };
    job.info.time_elapsed_ms = job.started.elapsed().as_millis() as u64;

    match status {
        MigrationStatus::Inactive => {
            job.info.state = JobState::None;
            Err(MigrationError::OperationFailed(format!(
                "{job_label}: is not active"
            )))
        }
        MigrationStatus::Active => {
            job.info.mem_processed = stats.ram_transferred;
            job.info.mem_remaining = stats.ram_remaining;
            job.info.mem_total = stats.ram_total;
            job.info.disk_processed = stats.disk_transferred;
            job.info.disk_remaining = stats.disk_remaining;
            job.info.disk_total = stats.disk_total;
            job.info.data_processed = stats.ram_transferred + stats.disk_transferred;
            job.info.data_remaining = stats.ram_remaining + stats.disk_remaining;
            job.info.data_total = stats.ram_total + stats.disk_total;
            Ok(())
        }
        MigrationStatus::Completed => {
            job.info.state = JobState::Completed;
            Ok(())
        }
        MigrationStatus::Error => {
            job.info.state = JobState::Failed;
            Err(MigrationError::OperationFailed(format!(
                "{job_label}: unexpectedly failed"
            )))
        }
        MigrationStatus::Cancelled => {
            job.info.state = JobState::Cancelled;
            Err(MigrationError::aborted_by_client(job_label))
        }
    }
}

/// Supervise a migration issued on the monitor until it reaches a terminal
/// state.
///
/// Exits early when (a) the destination connection dies, (b) the job's
/// async-abort flag is raised, or (c) `abort_on_error` is set and the guest
/// pauses on an I/O error. All three issue `migrate_cancel` first.
pub async fn wait_for_completion(
    domain: &Arc<Domain>,
    peer: Option<&Arc<dyn PeerDaemon>>,
    abort_on_error: bool,
) -> Result<(), MigrationError> {
    let job_label = "migration job";

    loop {
        let abort = {
            let mut inner = domain.lock().await;
            let io_error = inner.state.paused_on_io_error();
            let Some(job) = inner.job_mut() else {
                return Err(MigrationError::Internal(format!(
                    "{job_label} vanished while waiting for completion"
                )));
            };
            if abort_on_error && io_error {
                job.info.state = JobState::Failed;
                drop(inner);
                cancel_migration(domain).await;
                return Err(MigrationError::OperationFailed(format!(
                    "{job_label}: failed due to I/O error"
                )));
            }
            if job.abort.is_cancelled() {
                job.info.state = JobState::Cancelled;
                drop(inner);
                cancel_migration(domain).await;
                return Err(MigrationError::aborted_by_client(job_label));
            }
            job.abort.clone()
        };

        update_job_status(domain, job_label).await?;

        match domain.lock().await.job_mut().map(|job| job.info.state) {
            Some(JobState::Completed) => return Ok(()),
            Some(JobState::Unbounded) => {}
            other => {
                return Err(MigrationError::Internal(format!(
                    "{job_label} in unexpected state {other:?}"
                )));
            }
        }

        if let Some(peer) = peer
            && !peer.is_alive().await
        {
            cancel_migration(domain).await;
            if let Some(job) = domain.lock().await.job_mut() {
                job.info.state = JobState::Failed;
            }
            return Err(MigrationError::LostDestination);
        }

        tokio::select! {
            _ = sleep(PROGRESS_POLL_INTERVAL) => {}
            _ = abort.cancelled() => {}
        }
    }
}

/// Best-effort `migrate_cancel` on a still-running guest
pub async fn cancel_migration(domain: &Arc<Domain>) {
    let monitor = {
        let inner = domain.lock().await;
        if !inner.is_active() {
            return;
        }
        inner.monitor.clone()
    };
    if let Some(monitor) = monitor
        && let Err(err) = monitor.migrate_cancel().await
    {
        tracing::warn!("unable to cancel migration: {err}");
    }
}

/// Hold up the source until a seamless display server finished handing
/// over its session
pub async fn wait_for_display(domain: &Arc<Domain>) -> Result<(), MigrationError> {
    let monitor = {
        let inner = domain.lock().await;
        let wants_wait = inner
            .def
            .graphics
            .iter()
            .any(|g| g.kind == GraphicsKind::Spice);
        match &inner.monitor {
            Some(monitor) if wants_wait && monitor.supports(MonitorFeature::SeamlessGraphics) => {
                monitor.clone()
            }
            _ => return Ok(()),
        }
    };

    while !monitor.query_display_migrated().await? {
        sleep(PROGRESS_POLL_INTERVAL).await;
    }
    Ok(())
}
