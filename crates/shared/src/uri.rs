//! Destination URI handling
//!
//! Migrations accept `tcp://HOST:PORT` plus the legacy `tcp:HOST:PORT`
//! shorthand, which older sources still generate and which is normalised
//! here before parsing.
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum UriError {
    #[error("only tcp URIs are supported for migrations")]
    NotTcp,

    #[error("unable to parse migration URI: {0}")]
    Parse(String),

    #[error("missing host in migration URI: {0}")]
    MissingHost(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationUri {
    /// Host part, IPv6 addresses without brackets
    pub host: String,
    pub port: Option<u16>,
}

pub fn parse_migration_uri(uri: &str) -> Result<MigrationUri, UriError> {
    if !uri.starts_with("tcp:") {
        return Err(UriError::NotTcp);
    }

    let normalised = if uri.starts_with("tcp://") {
        uri.to_string()
    } else {
        format!("tcp://{}", &uri["tcp:".len()..])
    };

    let url = Url::parse(&normalised).map_err(|_| UriError::Parse(uri.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| UriError::MissingHost(uri.to_string()))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    if host.is_empty() {
        return Err(UriError::MissingHost(uri.to_string()));
    }

    Ok(MigrationUri {
        host,
        port: url.port(),
    })
}
