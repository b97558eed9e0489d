/// K8s API objects
pub mod api;

/// Manifest construction for a single VirtualServer
pub mod builder;

/// Cluster access for VirtualServer objects
pub mod client;

/// Provisioning configuration
pub mod config;

/// Delete, create and readiness sequencing
pub mod orchestrator;

/// Bootstrap payload templating
pub mod template;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Serde error: {0}")]
    SerdeYaml(#[from] serde_yaml_ng::Error),
    #[error("Failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(garde::Report),
    #[error("Invalid virtual server spec: {0}")]
    InvalidSpec(garde::Report),
    #[error("Invalid virtual server name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("Bootstrap template error: {0}")]
    Template(#[from] handlebars::RenderError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
