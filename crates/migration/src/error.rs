use monitor_sdk::MonitorError;
use shared::cookie::CookieError;
use shared::def::DefError;

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Operation invalid: {0}")]
    OperationInvalid(String),

    #[error("Operation aborted: {0}")]
    OperationAborted(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Migration unsafe: {0}")]
    Unsafe(String),

    #[error("Argument unsupported: {0}")]
    ArgumentUnsupported(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Lost connection to destination host")]
    LostDestination,

    #[error("Migration cookie: {0}")]
    Cookie(#[from] CookieError),

    #[error("Domain definition: {0}")]
    Def(#[from] DefError),

    #[error("Monitor: {0}")]
    Monitor(#[from] MonitorError),

    #[error("Tunnel: {0}")]
    Tunnel(#[from] crate::tunnel::TunnelError),

    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigrationError {
    /// "canceled by client" for the given job description
    pub fn aborted_by_client(job: &str) -> Self {
        MigrationError::OperationAborted(format!("{job}: canceled by client"))
    }
}
