//! Types exchanged between the two daemons taking part in a migration
pub mod cookie;
pub mod def;
pub mod flags;
pub mod uri;
