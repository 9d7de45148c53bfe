use serde::{Deserialize, Serialize};

use crate::Kind;

/// A resource that blocks a delete because it refers to the resource being deleted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dependency {
    pub kind: Kind,
    pub name: String,
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum Error {
    #[error("{kind} '{name}' not found")]
    ResourceMissing { kind: Kind, name: String },
    #[error("{kind} '{name}' is in use by {}", join_dependents(.dependents))]
    ResourceInUse { kind: Kind, name: String, dependents: Vec<Dependency> },
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("upgrade required: supported versions {}", .supported.join(", "))]
    UpgradeRequired { supported: Vec<String> },
    #[error("transport: {0}")]
    Transport(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    pub fn internal(e: impl std::fmt::Display) -> Self { Error::Internal(e.to_string()) }
}

fn join_dependents(deps: &[Dependency]) -> String {
    deps.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self { Error::Internal(format!("json: {}", e)) }
}

pub type Result<T> = std::result::Result<T, Error>;
