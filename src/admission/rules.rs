//! Limit seed files.
//!
//! A YAML document that replaces per-type defaults and preloads
//! per-identifier configs at startup:
//!
//! ```yaml
//! defaults:
//!   ip:
//!     identifier: ""
//!     identifierType: ip
//!     limits: { perSecond: 2, perMinute: 30 }
//! limits:
//!   - identifier: u1
//!     identifierType: user
//!     limits: { perSecond: 2 }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::key::IdentifierType;
use super::limits::LimitConfig;
use crate::error::{AdmissionError, Result};

/// Contents of a limits seed file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsFile {
    /// Per-type default overrides
    #[serde(default)]
    pub defaults: HashMap<IdentifierType, LimitConfig>,
    /// Per-identifier configs
    #[serde(default)]
    pub limits: Vec<LimitConfig>,
}

impl LimitsFile {
    /// Load a seed file from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limits seed file");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse a seed file from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: LimitsFile = serde_yaml::from_str(yaml)
            .map_err(|e| AdmissionError::Config(format!("Failed to parse limits file: {}", e)))?;

        // The map key is authoritative for defaults
        for (ty, config) in file.defaults.iter() {
            if config.identifier_type != *ty {
                return Err(AdmissionError::Config(format!(
                    "default for '{}' declares identifierType '{}'",
                    ty, config.identifier_type
                )));
            }
        }
        for config in &file.limits {
            config
                .validate()
                .map_err(|e| AdmissionError::Config(format!("{}: {}", config.key(), e)))?;
        }
        Ok(file)
    }
}
