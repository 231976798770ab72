//! Core types shared across the host runtime.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;

pub use error::*;

/// Opaque correlation token linking an outbound request to the pending
/// caller awaiting its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag(String);

impl Tag {
    /// Generate a fresh 128-bit random tag.
    pub fn fresh() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Tag {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Tag {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A parsed agent address.
///
/// Two forms are understood: `local:<id>` for agents addressed inside the
/// current process, and `http(s)://…/agents/<id>/` for agents reachable over
/// the HTTP carrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentUrl {
    Local { id: String },
    Http { raw: String, id: String },
}

impl AgentUrl {
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        if let Some(id) = raw.strip_prefix("local:") {
            if id.is_empty() {
                return Err(TransportError::InvalidUrl {
                    url: raw.to_string(),
                });
            }
            return Ok(Self::Local { id: id.to_string() });
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            let id = raw
                .split_once("/agents/")
                .map(|(_, rest)| rest.trim_end_matches('/'))
                .filter(|id| !id.is_empty() && !id.contains('/'))
                .ok_or_else(|| TransportError::InvalidUrl {
                    url: raw.to_string(),
                })?;
            return Ok(Self::Http {
                raw: raw.to_string(),
                id: id.to_string(),
            });
        }
        if let Some((scheme, _)) = raw.split_once("://") {
            return Err(TransportError::UnknownScheme {
                scheme: scheme.to_string(),
            });
        }
        Err(TransportError::InvalidUrl {
            url: raw.to_string(),
        })
    }

    pub fn agent_id(&self) -> &str {
        match self {
            Self::Local { id } => id,
            Self::Http { id, .. } => id,
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::Http { .. } => "http",
        }
    }

    /// The endpoint a transport should deliver to.
    pub fn endpoint(&self) -> String {
        match self {
            Self::Local { id } => format!("local:{id}"),
            Self::Http { raw, .. } => {
                if raw.ends_with('/') {
                    raw.clone()
                } else {
                    format!("{raw}/")
                }
            }
        }
    }
}

impl std::fmt::Display for AgentUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}
