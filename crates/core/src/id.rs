//! Identifiers carried alongside events.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Opaque cross-service tracing identifier.
///
/// The bus never interprets it; it is passed through unchanged from
/// publisher to handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh identifier.
    ///
    /// Uses UUIDv7 (time-ordered). Upstream services usually supply their own.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl core::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(DomainError::invalid_id("CorrelationId: empty"));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<CorrelationId> for String {
    fn from(value: CorrelationId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_opaque_values_verbatim() {
        let id: CorrelationId = "req-42/abc".parse().unwrap();
        assert_eq!(id.as_str(), "req-42/abc");
        assert!("".parse::<CorrelationId>().is_err());
    }

    #[test]
    fn serializes_as_plain_string() {
        let id: CorrelationId = "trace-1".parse().unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"trace-1\"");
    }

    #[test]
    fn generated_ids_are_distinct() {
        assert_ne!(CorrelationId::generate(), CorrelationId::generate());
    }
}
