//! Connection target parsing
//!
//! A WebSocket target names a role and a channel: `/ws/{role}/{channel}`,
//! optionally with `width`/`height` query parameters declared by producers.
//! Targets are validated before the registry is touched, so every link in
//! the registry has a valid channel id.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::registry::{ChannelId, Resolution, MAX_CHANNEL_ID_LEN};

/// Error for a target that cannot be served
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("unknown role: {0:?}")]
    UnknownRole(String),

    #[error("invalid channel id {0:?} (1-{max} chars of [A-Za-z0-9_.-])", max = MAX_CHANNEL_ID_LEN)]
    InvalidChannel(String),

    #[error("invalid query parameter {name}: {value:?}")]
    InvalidParameter { name: &'static str, value: String },
}

/// Side of the channel a connection joins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetRole {
    Producer,
    Consumer,
}

impl FromStr for TargetRole {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "camera" | "producer" => Ok(TargetRole::Producer),
            "view" | "viewer" | "consumer" => Ok(TargetRole::Consumer),
            other => Err(TargetError::UnknownRole(other.to_string())),
        }
    }
}

impl fmt::Display for TargetRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetRole::Producer => f.write_str("producer"),
            TargetRole::Consumer => f.write_str("consumer"),
        }
    }
}

/// A validated connection target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub role: TargetRole,
    pub channel: ChannelId,
    /// Resolution declared by a producer, if any
    pub declared: Option<Resolution>,
}

impl ConnectTarget {
    /// Validate path segments and query parameters
    pub fn parse(
        role: &str,
        channel: &str,
        query: &HashMap<String, String>,
    ) -> Result<Self, TargetError> {
        let role: TargetRole = role.parse()?;
        let channel = ChannelId::new(channel)
            .ok_or_else(|| TargetError::InvalidChannel(channel.to_string()))?;

        let declared = match role {
            TargetRole::Producer => declared_resolution(query)?,
            TargetRole::Consumer => None,
        };

        Ok(Self {
            role,
            channel,
            declared,
        })
    }

}

fn declared_resolution(query: &HashMap<String, String>) -> Result<Option<Resolution>, TargetError> {
    let width = parse_dimension(query, "width")?;
    let height = parse_dimension(query, "height")?;

    Ok(match (width, height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => Some(Resolution::new(w, h)),
        _ => None,
    })
}

fn parse_dimension(
    query: &HashMap<String, String>,
    name: &'static str,
) -> Result<Option<u32>, TargetError> {
    match query.get(name) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| TargetError::InvalidParameter {
                name,
                value: value.clone(),
            }),
    }
}
