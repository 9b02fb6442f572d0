//! Lock manager plugin interface
use crate::MigrationError;
use async_trait::async_trait;
use shared::def::DomainDef;

/// Resource lock plugin guarding a domain's disks.
///
/// During migration its lease state travels inside the cookie so the
/// destination can re-acquire the same leases before the guest resumes.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Plugin name; source and destination must agree on it
    fn name(&self) -> &str;

    /// Whether the plugin carries transferable state at all
    fn uses_state(&self) -> bool;

    /// Ask the plugin for the current lease token of a running guest
    async fn inquire(&self, def: &DomainDef) -> Result<Option<String>, MigrationError>;
}

/// Stateless default plugin
#[derive(Debug, Default, Clone, Copy)]
pub struct NopLockManager;

#[async_trait]
impl LockManager for NopLockManager {
    fn name(&self) -> &str {
        "nop"
    }

    fn uses_state(&self) -> bool {
        false
    }

    async fn inquire(&self, _def: &DomainDef) -> Result<Option<String>, MigrationError> {
        Ok(None)
    }
}
