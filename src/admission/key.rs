//! Identifier types and the keys built from them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AdmissionError;

/// What kind of caller an identifier names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierType {
    User,
    Ip,
    ApiKey,
    Service,
}

impl IdentifierType {
    pub const ALL: [IdentifierType; 4] = [
        IdentifierType::User,
        IdentifierType::Ip,
        IdentifierType::ApiKey,
        IdentifierType::Service,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierType::User => "user",
            IdentifierType::Ip => "ip",
            IdentifierType::ApiKey => "api_key",
            IdentifierType::Service => "service",
        }
    }
}

impl fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentifierType {
    type Err = AdmissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(IdentifierType::User),
            "ip" => Ok(IdentifierType::Ip),
            "api_key" => Ok(IdentifierType::ApiKey),
            "service" => Ok(IdentifierType::Service),
            other => Err(AdmissionError::validation(format!(
                "unknown identifierType '{}'",
                other
            ))),
        }
    }
}

/// A key that uniquely identifies the state tracked for one caller.
///
/// Counters, queues, configs and metrics are all keyed by this pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageKey {
    pub identifier: String,
    pub identifier_type: IdentifierType,
}

impl UsageKey {
    pub fn new(identifier: impl Into<String>, identifier_type: IdentifierType) -> Self {
        Self {
            identifier: identifier.into(),
            identifier_type,
        }
    }

    /// Build a key from untrusted input, rejecting a blank identifier.
    pub fn parse(identifier: &str, identifier_type: IdentifierType) -> crate::error::Result<Self> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(AdmissionError::validation("identifier is required"));
        }
        Ok(Self::new(identifier, identifier_type))
    }

    /// Convert the key to its string form, `type:identifier`.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}", self.identifier_type, self.identifier)
    }
}

impl fmt::Display for UsageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
