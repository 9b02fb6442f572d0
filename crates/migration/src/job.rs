//! Per-domain migration job and phase state machine
use crate::MigrationError;
use crate::domain::{DomainInner, DomainRegistry};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Phases of both protocol generations.
///
/// The numeric order is the protocol order; a job may only ever move to a
/// phase that compares greater or equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MigrationPhase {
    None,
    /// Outgoing v2: single perform step
    Perform2,
    /// Outgoing v3
    Begin3,
    Perform3,
    Perform3Done,
    Confirm3Cancelled,
    Confirm3,
    /// Incoming, both generations
    Prepare,
    Finish2,
    Finish3,
}

impl MigrationPhase {
    pub fn name(&self) -> &'static str {
        match self {
            MigrationPhase::None => "none",
            MigrationPhase::Perform2 => "perform2",
            MigrationPhase::Begin3 => "begin3",
            MigrationPhase::Perform3 => "perform3",
            MigrationPhase::Perform3Done => "perform3_done",
            MigrationPhase::Confirm3Cancelled => "confirm3_cancelled",
            MigrationPhase::Confirm3 => "confirm3",
            MigrationPhase::Prepare => "prepare",
            MigrationPhase::Finish2 => "finish2",
            MigrationPhase::Finish3 => "finish3",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDirection {
    Out,
    In,
}

bitflags::bitflags! {
    /// Synchronous operations allowed to interleave with the running
    /// migration job
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct JobMask: u32 {
        const QUERY = 1 << 0;
        const DESTROY = 1 << 1;
        const ABORT = 1 << 2;
        const SUSPEND = 1 << 3;
        const MODIFY = 1 << 4;
        const MIGRATION_OP = 1 << 5;
    }
}

impl JobMask {
    pub const DEFAULT: JobMask = JobMask::QUERY.union(JobMask::DESTROY).union(JobMask::ABORT);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOp {
    Query,
    Destroy,
    Abort,
    Suspend,
    Modify,
    MigrationOp,
}

impl JobOp {
    fn mask(&self) -> JobMask {
        match self {
            JobOp::Query => JobMask::QUERY,
            JobOp::Destroy => JobMask::DESTROY,
            JobOp::Abort => JobMask::ABORT,
            JobOp::Suspend => JobMask::SUSPEND,
            JobOp::Modify => JobMask::MODIFY,
            JobOp::MigrationOp => JobMask::MIGRATION_OP,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobState {
    #[default]
    None,
    /// Running with no known end point
    Unbounded,
    Completed,
    Failed,
    Cancelled,
}

/// Status snapshot maintained by the progress supervisor.
///
/// `data_processed` never decreases while the job is unbounded, so a
/// concurrent progress query sees monotone counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobInfo {
    pub state: JobState,
    pub time_elapsed_ms: u64,
    pub mem_processed: u64,
    pub mem_remaining: u64,
    pub mem_total: u64,
    pub disk_processed: u64,
    pub disk_remaining: u64,
    pub disk_total: u64,
    pub data_processed: u64,
    pub data_remaining: u64,
    pub data_total: u64,
}

pub struct MigrationJob {
    pub direction: JobDirection,
    pub phase: MigrationPhase,
    pub started: Instant,
    /// Async-abort flag; cancelling it stops every poll loop of the job
    pub abort: CancellationToken,
    pub mask: JobMask,
    pub info: JobInfo,
    close_watch: Option<JoinHandle<()>>,
}

impl MigrationJob {
    pub fn new(direction: JobDirection) -> Self {
        let mask = match direction {
            // incoming migrations forbid all interleaving
            JobDirection::In => JobMask::empty(),
            JobDirection::Out => JobMask::DEFAULT | JobMask::SUSPEND | JobMask::MIGRATION_OP,
        };
        MigrationJob {
            direction,
            phase: MigrationPhase::None,
            started: Instant::now(),
            abort: CancellationToken::new(),
            mask,
            info: JobInfo {
                state: JobState::Unbounded,
                ..JobInfo::default()
            },
            close_watch: None,
        }
    }

    /// Advance the phase; backwards transitions are an internal error and
    /// leave the previous phase in place
    pub fn set_phase(&mut self, phase: MigrationPhase) {
        if phase < self.phase {
            tracing::error!(
                from = self.phase.name(),
                to = phase.name(),
                "migration protocol going backwards"
            );
            return;
        }
        self.phase = phase;
    }

    pub fn allows(&self, op: JobOp) -> bool {
        self.mask.contains(op.mask())
    }

    pub fn request_abort(&self) {
        self.abort.cancel();
    }

    pub fn set_close_watch(&mut self, watch: JoinHandle<()>) {
        if let Some(old) = self.close_watch.take() {
            old.abort();
        }
        self.close_watch = Some(watch);
    }

    pub fn clear_close_watch(&mut self) {
        if let Some(watch) = self.close_watch.take() {
            watch.abort();
        }
    }
}

impl Drop for MigrationJob {
    fn drop(&mut self) {
        self.clear_close_watch();
    }
}

/// Start the async migration job on a domain
pub fn start(inner: &mut DomainInner, direction: JobDirection) -> Result<(), MigrationError> {
    if inner.job.is_some() {
        return Err(MigrationError::OperationInvalid(
            "domain already has an active migration job".into(),
        ));
    }
    inner.job = Some(MigrationJob::new(direction));
    Ok(())
}

/// Verify the expected job is running on this domain
pub fn is_active(inner: &DomainInner, direction: JobDirection) -> Result<(), MigrationError> {
    match &inner.job {
        Some(job) if job.direction == direction => Ok(()),
        _ => Err(MigrationError::OperationInvalid(
            match direction {
                JobDirection::In => {
                    format!("domain '{}' is not processing incoming migration", inner.def.name)
                }
                JobDirection::Out => format!("domain '{}' is not being migrated", inner.def.name),
            },
        )),
    }
}

pub fn finish(inner: &mut DomainInner) {
    inner.job = None;
}

/// Convenience for advancing the phase under the domain lock
pub async fn set_phase(domain: &crate::domain::Domain, phase: MigrationPhase) {
    if let Some(job) = domain.lock().await.job_mut() {
        job.set_phase(phase);
    }
}

/// Watch a client connection and tear the job down if it drops.
///
/// The task holds a (registry, uuid) pair instead of a domain handle so a
/// forgotten watch cannot keep the domain alive.
pub fn watch_connection(
    registry: &Arc<DomainRegistry>,
    uuid: Uuid,
    conn_close: CancellationToken,
) -> JoinHandle<()> {
    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        conn_close.cancelled().await;
        cleanup_after_connection_drop(&registry, uuid).await;
    })
}

async fn cleanup_after_connection_drop(registry: &Arc<DomainRegistry>, uuid: Uuid) {
    let Some(domain) = registry.lookup(uuid) else {
        return;
    };
    let mut inner = domain.lock().await;
    let Some(job) = &inner.job else {
        return;
    };
    if job.direction != JobDirection::Out {
        return;
    }

    tracing::debug!(
        domain = %inner.def.name,
        phase = job.phase.name(),
        "connection that started outgoing migration was closed"
    );

    match job.phase {
        MigrationPhase::Begin3 => {
            // just forget we were about to migrate
            inner.job = None;
        }
        MigrationPhase::Perform3Done => {
            tracing::warn!(
                domain = %inner.def.name,
                "migration finished but it is unknown whether the domain \
                 was started on the destination"
            );
            inner.job = None;
        }
        // any other phase is unreachable: either an API call still holds
        // the job or the job is already terminal
        _ => {}
    }
}
