//! Admission decisions: keys, windows, limits and the engine that applies them.

mod engine;
mod key;
mod limits;
mod registry;
mod rules;
mod window;

pub use engine::{AdmissionEngine, AdmissionResult};
pub use key::{IdentifierType, UsageKey};
pub use limits::{Ceilings, LimitConfig, QueuePolicy, Thresholds};
pub use registry::{builtin_default, LimitRegistry};
pub use rules::LimitsFile;
pub use window::{Granularity, PerGranularity};
