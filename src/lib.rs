//! # fieldflux - change notification for structured records
//!
//! fieldflux is the monitor engine of a control-system data middleware: a
//! consumer subscribes to a subset of fields of a live, frequently-mutated
//! hierarchical record and receives a bounded, loss-bounded stream of
//! "what changed" snapshots without ever blocking the producer indefinitely.
//!
//! ## Core Concepts
//!
//! - **FieldTree**: hierarchical record layout with stable per-field offsets
//!   and subtree spans
//! - **ChangeVector**: bit-per-offset vector marking which fields changed
//! - **Snapshot**: one queued unit of `{data, changed, overrun}`
//! - **TriggerAlgorithm**: per-field significance predicate (onChange,
//!   onPut, deadband, percentDeadband)
//! - **MonitorEngine**: binds a subset copy, triggers, and a queueing
//!   strategy into a start/stop/poll/release lifecycle
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fieldflux::{
//!     AlgorithmRegistry, FieldSelector, FieldTree, MonitorEngine,
//!     MonitorRequest, Record, ScalarKind, Value,
//! };
//!
//! let record = std::sync::Arc::new(Record::new(
//!     FieldTree::builder("powerSupply")
//!         .scalar("value", ScalarKind::Float)
//!         .timestamp("timeStamp")
//!         .build()?,
//! ));
//!
//! let registry = AlgorithmRegistry::with_defaults();
//! let (ready_tx, ready_rx) = crossbeam_channel::unbounded();
//! let monitor = MonitorEngine::new(
//!     record.clone(),
//!     &MonitorRequest { queue_depth: 3, ..MonitorRequest::default() },
//!     &registry,
//!     Box::new(ready_tx),
//! )?;
//! monitor.start()?;
//!
//! record.update(|txn| txn.put("value", Value::Float(5.0)))?;
//! ready_rx.recv()?;
//! let element = monitor.poll().unwrap();
//! assert_eq!(element.value(1), Value::Float(5.0));
//! monitor.release(element);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Primitives
pub mod bitset;
pub mod compress;
pub mod error;
pub mod field;
pub mod value;

// Record and subset-copy collaborators
pub mod copy;
pub mod record;

// The monitor subsystem
pub mod monitor;

// Re-export primary types at crate root for convenience
pub use bitset::ChangeVector;
pub use copy::{FieldCopy, FieldSelector};
pub use error::{EngineError, FluxError, FluxResult, ValidationError};
pub use field::{Deadband, DeadbandMode, FieldData, FieldKind, FieldNode, FieldTree};
pub use monitor::{
    AlgorithmBinding, AlgorithmOptions, AlgorithmRegistry, MonitorElement, MonitorEngine,
    MonitorRequest, MonitorStats, ReadyCallback, Snapshot, SubscriptionId, TriggerAlgorithm,
    TriggerFactory,
};
pub use record::{ChangeListener, ListenerId, Record, RecordTxn};
pub use value::{ScalarKind, Value};
