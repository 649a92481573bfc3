//! Per-field triggering policies.
//!
//! A trigger decides whether an observed mutation of its field is
//! significant enough to notify the consumer. Evaluation is split in two:
//! [`TriggerAlgorithm::cause_monitor`] compares the current source value
//! against the remembered one, and [`TriggerAlgorithm::monitor_issued`]
//! commits the evaluated value once the engine actually emits a
//! notification. Keeping the baseline pinned to the last *delivered* value
//! rather than the last evaluated one is what makes deadbands behave after
//! overrun coalescing.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bitset::ChangeVector;
use crate::copy::FieldCopy;
use crate::error::{FluxResult, ValidationError};
use crate::field::{Deadband, DeadbandMode, FieldData, FieldKind};
use crate::value::Value;

/// Everything a trigger may look at while evaluating one update cycle.
pub struct TriggerContext<'a> {
    pub(crate) copy: &'a FieldCopy,
    pub(crate) record_data: &'a FieldData,
    /// Leaf-level copy-space bits of the cycle being evaluated.
    pub(crate) raw: &'a ChangeVector,
    /// Copy-space offset of the bound field.
    pub(crate) offset: usize,
    /// Span of the bound field's subtree.
    pub(crate) span: usize,
}

impl TriggerContext<'_> {
    /// Current source value of a copy-space field.
    #[must_use]
    pub fn value(&self, copy_offset: usize) -> &Value {
        self.record_data.get(self.copy.record_offset(copy_offset))
    }

    /// Current source value of the bound field itself.
    #[must_use]
    pub fn target(&self) -> &Value {
        self.value(self.offset)
    }

    /// Stable digest of the bound subtree's current values.
    #[must_use]
    pub fn target_digest(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        for leaf in self.copy.tree().leaves_in(self.offset) {
            // Serialization of these value types cannot fail; a failure
            // would only mark the field as changed, which fails open.
            let _ = serde_json::to_writer(&mut hasher, self.value(leaf));
            hasher.update(&[0]);
        }
        hasher.finalize()
    }
}

/// A stateful per-field significance predicate.
pub trait TriggerAlgorithm: Send {
    /// Algorithm name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Evaluates the current source value against the remembered baseline.
    /// Returns true when the change is significant.
    fn cause_monitor(&mut self, ctx: &TriggerContext<'_>) -> bool;

    /// Commits the value evaluated by the last `cause_monitor` as the new
    /// baseline. Only called when the engine materializes the update into a
    /// snapshot.
    fn monitor_issued(&mut self);
}

/// Fires whenever the serialized value of the bound subtree differs from the
/// last delivered one.
struct OnChange {
    last: blake3::Hash,
    pending: blake3::Hash,
}

impl TriggerAlgorithm for OnChange {
    fn name(&self) -> &'static str {
        "onChange"
    }

    fn cause_monitor(&mut self, ctx: &TriggerContext<'_>) -> bool {
        self.pending = ctx.target_digest();
        self.pending != self.last
    }

    fn monitor_issued(&mut self) {
        self.last = self.pending;
    }
}

/// Fires unless the cycle touched nothing but the timestamp field: pure
/// re-stamping without a real value change is suppressed.
struct OnPut {
    /// Copy-space range of the designated timestamp field, if the copy
    /// includes one.
    time_range: Option<(usize, usize)>,
}

impl TriggerAlgorithm for OnPut {
    fn name(&self) -> &'static str {
        "onPut"
    }

    fn cause_monitor(&mut self, ctx: &TriggerContext<'_>) -> bool {
        let Some((ts_offset, ts_span)) = self.time_range else {
            return true;
        };
        ctx.raw
            .iter()
            .any(|b| b >= ctx.offset && b < ctx.offset + ctx.span && (b < ts_offset || b >= ts_offset + ts_span))
    }

    fn monitor_issued(&mut self) {}
}

/// Numeric threshold predicate, absolute or percentage.
struct DeadbandTrigger {
    mode: DeadbandMode,
    threshold: f64,
    last: f64,
    pending: f64,
}

impl DeadbandTrigger {
    fn fires(&self, current: f64) -> bool {
        match self.mode {
            DeadbandMode::Absolute => (current - self.last).abs() > self.threshold,
            DeadbandMode::Percent => {
                if current == 0.0 {
                    self.last != 0.0
                } else {
                    100.0 * (current - self.last).abs() / current.abs() > self.threshold
                }
            }
        }
    }
}

impl TriggerAlgorithm for DeadbandTrigger {
    fn name(&self) -> &'static str {
        match self.mode {
            DeadbandMode::Absolute => "deadband",
            DeadbandMode::Percent => "percentDeadband",
        }
    }

    fn cause_monitor(&mut self, ctx: &TriggerContext<'_>) -> bool {
        let Some(current) = ctx.target().as_float() else {
            // Setup validation keeps deadbands off non-numeric fields; a
            // value that still fails to read numeric fails open.
            return true;
        };
        self.pending = current;
        self.fires(current)
    }

    fn monitor_issued(&mut self) {
        self.last = self.pending;
    }
}

/// Per-binding options supplied by the subscription request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmOptions {
    /// Subscription-side deadband, merged against the record default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadband: Option<Deadband>,
}

/// Merges a subscription-side deadband against the record-declared default.
///
/// When the polarities differ the subscription option wins outright;
/// otherwise the larger threshold wins. With neither present the result is
/// an absolute zero-threshold band (any non-zero delta fires).
#[must_use]
pub fn resolve_deadband(option: Option<Deadband>, record_default: Option<Deadband>) -> Deadband {
    match (option, record_default) {
        (Some(opt), Some(rec)) => {
            if opt.mode != rec.mode {
                opt
            } else {
                Deadband {
                    mode: opt.mode,
                    value: opt.value.max(rec.value),
                }
            }
        }
        (Some(opt), None) => opt,
        (None, Some(rec)) => rec,
        (None, None) => Deadband::absolute(0.0),
    }
}

/// Where an algorithm is being bound: the copy, the current record data for
/// baseline priming, the target copy offset, and the request options.
pub struct BindingSite<'a> {
    /// The subscription's copy layout.
    pub copy: &'a FieldCopy,
    /// Record data at bind time, for priming remembered baselines.
    pub record_data: &'a FieldData,
    /// Copy-space offset of the field the algorithm binds to.
    pub offset: usize,
    /// Options carried by the subscription request.
    pub options: &'a AlgorithmOptions,
}

impl BindingSite<'_> {
    fn priming_context(&self) -> TriggerContext<'_> {
        TriggerContext {
            copy: self.copy,
            record_data: self.record_data,
            raw: empty_bits(),
            offset: self.offset,
            span: self.copy.tree().node(self.offset).span(),
        }
    }

    fn require_numeric_leaf(&self) -> FluxResult<()> {
        let node = self.copy.tree().node(self.offset);
        match node.kind() {
            FieldKind::Scalar(kind) if kind.is_numeric() => Ok(()),
            _ => Err(ValidationError::NonNumericField {
                path: self.copy.tree().path(self.offset),
            }
            .into()),
        }
    }
}

static EMPTY_BITS: std::sync::OnceLock<ChangeVector> = std::sync::OnceLock::new();

fn empty_bits() -> &'static ChangeVector {
    EMPTY_BITS.get_or_init(|| ChangeVector::new(0))
}

/// Creates algorithm instances for one binding site.
pub trait TriggerFactory: Send + Sync {
    /// Validates the site and builds a primed algorithm instance.
    fn create(&self, site: &BindingSite<'_>) -> FluxResult<Box<dyn TriggerAlgorithm>>;
}

struct OnChangeFactory;

impl TriggerFactory for OnChangeFactory {
    fn create(&self, site: &BindingSite<'_>) -> FluxResult<Box<dyn TriggerAlgorithm>> {
        let digest = site.priming_context().target_digest();
        Ok(Box::new(OnChange {
            last: digest,
            pending: digest,
        }))
    }
}

struct OnPutFactory;

impl TriggerFactory for OnPutFactory {
    fn create(&self, site: &BindingSite<'_>) -> FluxResult<Box<dyn TriggerAlgorithm>> {
        Ok(Box::new(OnPut {
            time_range: site.copy.tree().timestamp_range(),
        }))
    }
}

struct DeadbandFactory {
    /// `percentDeadband` pins the polarity; plain `deadband` lets the
    /// option/default merge decide it.
    force: Option<DeadbandMode>,
}

impl TriggerFactory for DeadbandFactory {
    fn create(&self, site: &BindingSite<'_>) -> FluxResult<Box<dyn TriggerAlgorithm>> {
        site.require_numeric_leaf()?;
        let record_default = site.copy.tree().node(site.offset).deadband();
        let mut resolved = resolve_deadband(site.options.deadband, record_default);
        if let Some(mode) = self.force {
            resolved.mode = mode;
        }
        let current = site
            .priming_context()
            .target()
            .as_float()
            .unwrap_or_default();
        Ok(Box::new(DeadbandTrigger {
            mode: resolved.mode,
            threshold: resolved.value,
            last: current,
            pending: current,
        }))
    }
}

/// Name → factory lookup used at subscription setup.
///
/// Constructed once at process start and passed by reference; unknown names
/// reject the subscription synchronously.
pub struct AlgorithmRegistry {
    factories: HashMap<String, Arc<dyn TriggerFactory>>,
}

impl AlgorithmRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with the built-in algorithms registered: `onChange`,
    /// `onPut`, `deadband`, `percentDeadband`.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("onChange", Arc::new(OnChangeFactory));
        registry.register("onPut", Arc::new(OnPutFactory));
        registry.register("deadband", Arc::new(DeadbandFactory { force: None }));
        registry.register(
            "percentDeadband",
            Arc::new(DeadbandFactory {
                force: Some(DeadbandMode::Percent),
            }),
        );
        registry
    }

    /// Registers (or replaces) a factory under `name`.
    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn TriggerFactory>) {
        self.factories.insert(name.into(), factory);
    }

    /// Resolves a factory by name.
    ///
    /// # Errors
    ///
    /// Unknown names are a setup error.
    pub fn resolve(&self, name: &str) -> FluxResult<&Arc<dyn TriggerFactory>> {
        self.factories
            .get(name)
            .ok_or_else(|| {
                ValidationError::UnknownAlgorithm {
                    name: name.to_string(),
                }
                .into()
            })
    }

    /// Registered algorithm names, unordered.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl Default for AlgorithmRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for AlgorithmRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlgorithmRegistry")
            .field("names", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
