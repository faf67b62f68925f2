//! Error types for loading inputs and running discovery

use std::path::PathBuf;

use persistence::SinkError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("factor library: {0}")]
    Library(String),

    #[error("mandatory group '{0}' has no usable factors")]
    EmptyMandatoryGroup(&'static str),

    #[error("invalid config: {0}")]
    Config(String),
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("shard {shard} worker failed: {message}")]
    Worker { shard: usize, message: String },
}
