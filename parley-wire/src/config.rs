//! Protocol and hub configuration.

use crate::error::ProtocolError;

/// Protocol version negotiation.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Version reported in the `{hi}` reply.
    pub version: String,
    /// Oldest client version accepted in `{hi}`.
    pub min_version: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            version: "0.16".to_string(),
            min_version: "0.15".to_string(),
        }
    }
}

/// Parse `major.minor[.patch]`; anything after a `-` or `+` is ignored.
fn parse_version(text: &str) -> Option<(u32, u32, u32)> {
    let core = text.split(|c: char| c == '-' || c == '+').next()?;
    let mut parts = core.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = match parts.next() {
        Some(p) => p.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

impl ProtocolConfig {
    /// Validate the version a client sent in `{hi}`.
    pub fn check_version(&self, client: &str) -> Result<(), ProtocolError> {
        let Some(got) = parse_version(client) else {
            return Err(ProtocolError::Malformed(format!("bad version '{client}'")));
        };
        let min = parse_version(&self.min_version).unwrap_or_default();
        if got < min {
            return Err(ProtocolError::UnsupportedVersion(client.to_string()));
        }
        Ok(())
    }
}

/// Fan-out hub limits.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Buffered server messages per session before new ones are dropped.
    pub outbound_capacity: usize,
    /// Attached sessions per topic; zero means unlimited.
    pub max_subscribers_per_topic: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 128,
            max_subscribers_per_topic: 0,
        }
    }
}
