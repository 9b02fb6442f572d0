//! Domain registry and per-domain runtime state
//!
//! The registry is the single owner of domain objects, keyed by UUID; every
//! other party holds `Arc` handles or (registry, uuid) pairs, which keeps
//! the job/coordinator/registry graph acyclic.
use crate::MigrationError;
use crate::job::MigrationJob;
use monitor_sdk::Monitor;
use shared::cookie::GuestIdentity;
use shared::def::DomainDef;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, MutexGuard, broadcast};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PausedReason {
    User,
    Migration,
    IoError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Shutoff,
    Running,
    Paused(PausedReason),
}

impl DomainState {
    pub fn is_active(&self) -> bool {
        !matches!(self, DomainState::Shutoff)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, DomainState::Running)
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, DomainState::Paused(_))
    }

    pub fn paused_on_io_error(&self) -> bool {
        matches!(self, DomainState::Paused(PausedReason::IoError))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinedDetail {
    Added,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartedDetail {
    Migrated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendedDetail {
    Paused,
    Migrated,
    IoError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumedDetail {
    Migrated,
    Unpaused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoppedDetail {
    Migrated,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainEventKind {
    Defined(DefinedDetail),
    Started(StartedDetail),
    Suspended(SuspendedDetail),
    Resumed(ResumedDetail),
    Stopped(StoppedDetail),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainEvent {
    pub uuid: Uuid,
    pub name: String,
    pub kind: DomainEventKind,
}

/// Mutable half of a domain, guarded by the per-domain lock.
///
/// The lock is dropped across every suspension point (monitor round trips,
/// poll sleeps, remote RPC); holders must re-check liveness after taking it
/// again.
pub struct DomainInner {
    pub def: DomainDef,
    /// Pending replacement definition, shipped in the cookie when the
    /// caller asked to persist the guest on the destination
    pub new_def: Option<DomainDef>,
    pub state: DomainState,
    pub persistent: bool,
    pub auto_destroy: bool,
    pub num_snapshots: u32,
    /// Block job started by an API other than the migration mirror
    pub block_job_active: bool,
    /// Lease token cached while the guest is paused
    pub lock_state: Option<String>,
    /// Name the guest had on the source when it was renamed on arrival
    pub orig_name: Option<String>,
    pub monitor: Option<Arc<dyn Monitor>>,
    /// Port held by the destination NBD server during storage pre-copy
    pub nbd_port: u16,
    /// Discard the incoming job if the process dies before Finish
    pub prepare_cleanup: bool,
    pub job: Option<MigrationJob>,
}

impl DomainInner {
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn monitor(&self) -> Result<Arc<dyn Monitor>, MigrationError> {
        self.monitor
            .clone()
            .ok_or_else(|| MigrationError::OperationInvalid("domain is not running".into()))
    }

    /// Identity used to validate cookies; renamed guests keep matching
    /// their original name
    pub fn guest_identity(&self) -> GuestIdentity {
        GuestIdentity {
            name: self
                .orig_name
                .clone()
                .unwrap_or_else(|| self.def.name.clone()),
            uuid: self.def.uuid,
        }
    }

    pub fn job_mut(&mut self) -> Option<&mut MigrationJob> {
        self.job.as_mut()
    }
}

pub struct Domain {
    pub uuid: Uuid,
    inner: Mutex<DomainInner>,
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain").field("uuid", &self.uuid).finish()
    }
}

impl Domain {
    pub fn new(def: DomainDef, state: DomainState, persistent: bool) -> Arc<Self> {
        Arc::new(Domain {
            uuid: def.uuid,
            inner: Mutex::new(DomainInner {
                def,
                new_def: None,
                state,
                persistent,
                auto_destroy: false,
                num_snapshots: 0,
                block_job_active: false,
                lock_state: None,
                orig_name: None,
                monitor: None,
                nbd_port: 0,
                prepare_cleanup: false,
                job: None,
            }),
        })
    }

    pub async fn lock(&self) -> MutexGuard<'_, DomainInner> {
        self.inner.lock().await
    }
}

pub struct DomainRegistry {
    domains: RwLock<HashMap<Uuid, Arc<Domain>>>,
    events: broadcast::Sender<DomainEvent>,
}

impl Default for DomainRegistry {
    fn default() -> Self {
        let (events, _) = broadcast::channel(64);
        DomainRegistry {
            domains: RwLock::new(HashMap::new()),
            events,
        }
    }
}

impl DomainRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, uuid: Uuid, name: &str, kind: DomainEventKind) {
        let _ = self.events.send(DomainEvent {
            uuid,
            name: name.to_string(),
            kind,
        });
    }

    pub fn lookup(&self, uuid: Uuid) -> Option<Arc<Domain>> {
        self.domains.read().unwrap().get(&uuid).cloned()
    }

    pub async fn lookup_by_name(&self, name: &str) -> Option<Arc<Domain>> {
        let domains: Vec<Arc<Domain>> = self.domains.read().unwrap().values().cloned().collect();
        for domain in domains {
            if domain.lock().await.def.name == name {
                return Some(domain);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.domains.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.read().unwrap().is_empty()
    }

    /// Register an existing domain object, e.g. at daemon start-up
    pub fn insert(&self, domain: Arc<Domain>) {
        self.domains.write().unwrap().insert(domain.uuid, domain);
    }

    /// Add the inactive shell of a guest arriving via migration
    pub async fn add_incoming(
        &self,
        def: DomainDef,
        orig_name: Option<String>,
    ) -> Result<Arc<Domain>, MigrationError> {
        {
            let domains = self.domains.read().unwrap();
            if domains.contains_key(&def.uuid) {
                return Err(MigrationError::OperationInvalid(format!(
                    "domain with uuid {} already exists",
                    def.uuid
                )));
            }
        }
        let name = def.name.clone();
        // names are checked against a snapshot; a racing define with the
        // same name is caught by the store above us
        let snapshot: Vec<Arc<Domain>> =
            self.domains.read().unwrap().values().cloned().collect();
        for existing in snapshot {
            if existing.uuid != def.uuid && existing.lock().await.def.name == name {
                return Err(MigrationError::OperationInvalid(format!(
                    "domain '{name}' already exists with a different uuid"
                )));
            }
        }

        let domain = Domain::new(def, DomainState::Shutoff, false);
        domain.lock().await.orig_name = orig_name;
        self.insert(domain.clone());
        Ok(domain)
    }

    pub fn remove(&self, uuid: Uuid) {
        self.domains.write().unwrap().remove(&uuid);
    }

    /// Drop a transient domain that is no longer running
    pub async fn remove_if_inactive(&self, domain: &Arc<Domain>) {
        let inner = domain.lock().await;
        if !inner.persistent && !inner.is_active() {
            drop(inner);
            self.remove(domain.uuid);
        }
    }
}
