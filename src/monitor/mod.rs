//! The monitor subsystem: subscriptions over a live record.
//!
//! A subscription binds a field-subset copy, per-field trigger algorithms,
//! and one queueing strategy into an engine with a
//! start/stop/notify/poll/release lifecycle. Setup errors reject the
//! subscription synchronously; a constructed engine is never
//! half-initialized.

/// The orchestrating engine and its queueing strategies.
pub mod engine;
/// Snapshot ring with the four-cursor hand-off protocol.
pub mod ring;
/// Per-field triggering policies and their registry.
pub mod triggers;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::copy::FieldSelector;
use crate::error::{FluxResult, ValidationError};

pub use engine::{MonitorElement, MonitorEngine, MonitorStats, ReadyCallback};
pub use ring::Snapshot;
pub use triggers::{
    resolve_deadband, AlgorithmOptions, AlgorithmRegistry, BindingSite, TriggerAlgorithm,
    TriggerContext, TriggerFactory,
};

/// Unique identifier for a subscription.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The wrapped UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Binds one algorithm by name to one field of the subscribed subset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmBinding {
    /// Dotted path in copy space; empty binds the root structure.
    pub field: String,
    /// Registered algorithm name, e.g. `"deadband"`.
    pub algorithm: String,
    /// Per-binding options.
    #[serde(default)]
    pub options: AlgorithmOptions,
}

fn default_queue_depth() -> usize {
    1
}

/// Everything a consumer supplies when setting up a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorRequest {
    /// Which record subtrees to observe.
    #[serde(default)]
    pub fields: FieldSelector,
    /// Snapshot queue depth; 1 selects the shared-slot strategy, 2 is
    /// promoted to 3.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Timer-gated delivery period in milliseconds. Requires depth 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_ms: Option<u64>,
    /// Per-field algorithm bindings.
    #[serde(default)]
    pub algorithms: Vec<AlgorithmBinding>,
}

impl Default for MonitorRequest {
    fn default() -> Self {
        Self {
            fields: FieldSelector::all(),
            queue_depth: 1,
            period_ms: None,
            algorithms: Vec::new(),
        }
    }
}

impl MonitorRequest {
    /// The validated periodic rate.
    ///
    /// # Errors
    ///
    /// A zero period is rejected.
    pub fn period(&self) -> FluxResult<Option<Duration>> {
        match self.period_ms {
            None => Ok(None),
            Some(0) => Err(ValidationError::InvalidPeriod {
                reason: "period must be positive".to_string(),
            }
            .into()),
            Some(ms) => Ok(Some(Duration::from_millis(ms))),
        }
    }

    /// Parses a request from its JSON representation.
    ///
    /// # Errors
    ///
    /// Malformed requests are a setup error.
    pub fn from_json(value: serde_json::Value) -> FluxResult<Self> {
        serde_json::from_value(value).map_err(|e| {
            ValidationError::InvalidRequest {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_from_json_fills_defaults() {
        let req = MonitorRequest::from_json(json!({
            "fields": ["value"],
            "algorithms": [
                {"field": "value", "algorithm": "deadband",
                 "options": {"deadband": {"mode": "absolute", "value": 5.0}}}
            ]
        }))
        .unwrap();
        assert_eq!(req.queue_depth, 1);
        assert_eq!(req.period_ms, None);
        assert_eq!(req.fields.paths(), ["value"]);
        assert_eq!(req.algorithms.len(), 1);
        assert_eq!(
            req.algorithms[0].options.deadband,
            Some(crate::field::Deadband::absolute(5.0))
        );
    }

    #[test]
    fn malformed_request_rejected() {
        let err = MonitorRequest::from_json(json!({"queue_depth": "three"})).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn zero_period_rejected() {
        let req = MonitorRequest {
            period_ms: Some(0),
            ..MonitorRequest::default()
        };
        assert!(req.period().unwrap_err().is_validation());
    }

    #[test]
    fn subscription_ids_are_unique() {
        assert_ne!(SubscriptionId::new(), SubscriptionId::new());
    }
}
