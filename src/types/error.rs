//! Error types for the agent host runtime.

use thiserror::Error;

/// Errors surfaced by host-level plumbing (transport servers and the like).
/// Protocol-level failures travel as `RpcError` inside response envelopes
/// instead.
#[derive(Error, Debug, Clone)]
pub enum HostError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// State backend errors.
#[derive(Error, Debug, Clone)]
pub enum StateError {
    #[error("State backend failure: {message}")]
    Backend { message: String },

    #[error("Invalid state id: {id}")]
    InvalidId { id: String },

    #[error("Failed to encode state document: {message}")]
    Encoding { message: String },
}

impl StateError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// Agent instantiation errors.
#[derive(Error, Debug, Clone)]
pub enum InstantiationError {
    #[error("No registered entry for key: {key}")]
    NotRegistered { key: String },

    #[error("Unknown agent class: {class}")]
    UnknownClass { class: String },

    #[error("Failed to construct agent {key}: {message}")]
    Construction { key: String, message: String },

    #[error("State error: {0}")]
    State(#[from] StateError),
}

/// Transport-level errors.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("No transport for scheme: {scheme}")]
    UnknownScheme { scheme: String },

    #[error("Invalid agent url: {url}")]
    InvalidUrl { url: String },

    #[error("Failed to reach {url}: {message}")]
    Unreachable { url: String, message: String },
}

/// Scheduler errors.
#[derive(Error, Debug, Clone)]
pub enum SchedulerError {
    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Scheduler lane for agent {agent_id} is closed")]
    LaneClosed { agent_id: String },
}
