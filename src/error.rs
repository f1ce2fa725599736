use std::net::SocketAddrV4;

use thiserror::Error;

/// Errors surfaced while loading or validating a [`crate::config::Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("pool '{pool}': non-cluster pools require 'backends'")]
    MissingBackends { pool: String },

    #[error("pool '{pool}': non-cluster pools must not set 'cluster_hosts' or 'cluster_name'")]
    UnexpectedClusterFields { pool: String },

    #[error("pool '{pool}': cluster pools require both 'cluster_hosts' and 'cluster_name'")]
    MissingClusterFields { pool: String },

    #[error("pool '{pool}': cluster pools must not set 'backends'")]
    UnexpectedBackends { pool: String },

    #[error("pool '{pool}': hash_tag must be empty or exactly two characters, got '{tag}'")]
    BadHashTag { pool: String, tag: String },

    #[error("pool '{pool}': backend address '{addr}' is not a valid host:port[:weight]")]
    BadBackendAddress { pool: String, addr: String },

    #[error("pool '{pool}': unsupported hash_function '{function}'")]
    UnsupportedHashFunction { pool: String, function: String },

    #[error("pool '{pool}': listen_port is reused by pool '{other}'")]
    DuplicateListenPort { pool: String, other: String },
}

/// Errors that can terminate a single backend connection.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error on backend {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol error from backend {addr}: {detail}")]
    Protocol { addr: String, detail: String },

    #[error("request to {addr} timed out")]
    Timeout { addr: SocketAddrV4 },

    #[error("AUTH/SELECT prelude to {addr} failed: {detail}")]
    Prelude { addr: String, detail: String },
}

/// Errors raised by the RESP codec.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CodecError {
    #[error("invalid redis protocol: {0}")]
    Protocol(String),
}

/// Errors raised while computing a route for a request.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum RouterError {
    #[error("no live backend available")]
    NoBackend,
}
