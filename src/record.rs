//! The live record a subscription observes.
//!
//! A [`Record`] owns one [`FieldTree`] and its current [`FieldData`] behind a
//! single lock. All producer-side mutation happens inside [`Record::update`],
//! which scopes the lock, accumulates the cycle's changed bits, and pushes
//! one raw change notification to every attached listener before the lock is
//! released. Listeners are held weakly: a listener whose owner has been
//! dropped is pruned instead of notified, so late cycles never panic.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};

use crate::bitset::ChangeVector;
use crate::error::{FluxResult, ValidationError};
use crate::field::{FieldData, FieldKind, FieldTree};
use crate::value::Value;

/// Receiver of raw per-cycle change notifications.
///
/// Called synchronously under the record lock, at most once per update
/// cycle. Implementations must not call back into the record.
pub trait ChangeListener: Send + Sync {
    /// `data` is the record's current data, `changed` the cycle's raw bits
    /// in record offset space.
    fn on_raw_change(&self, data: &FieldData, changed: &ChangeVector);
}

/// Handle identifying one listener attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

struct RecordInner {
    data: FieldData,
    listeners: Vec<(ListenerId, Weak<dyn ChangeListener>)>,
    next_listener: u64,
}

/// A lockable structured record.
pub struct Record {
    tree: Arc<FieldTree>,
    inner: Mutex<RecordInner>,
}

impl Record {
    /// Creates a record with default-initialized field data.
    #[must_use]
    pub fn new(tree: FieldTree) -> Self {
        let data = FieldData::for_tree(&tree);
        Self {
            tree: Arc::new(tree),
            inner: Mutex::new(RecordInner {
                data,
                listeners: Vec::new(),
                next_listener: 0,
            }),
        }
    }

    /// The record's field layout.
    #[must_use]
    pub fn tree(&self) -> &Arc<FieldTree> {
        &self.tree
    }

    fn lock(&self) -> MutexGuard<'_, RecordInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs one logical update cycle under the record lock.
    ///
    /// The closure mutates fields through the transaction; every attached
    /// listener receives the cycle's accumulated raw bits before the lock is
    /// released. Writes are not rolled back on a closure error, so the bits
    /// for any write that landed are still delivered.
    pub fn update<T>(&self, f: impl FnOnce(&mut RecordTxn<'_>) -> FluxResult<T>) -> FluxResult<T> {
        let mut inner = self.lock();
        let mut changed = ChangeVector::new(self.tree.field_count());
        let out = {
            let mut txn = RecordTxn {
                tree: &self.tree,
                data: &mut inner.data,
                changed: &mut changed,
            };
            f(&mut txn)
        };
        if !changed.is_empty() {
            inner
                .listeners
                .retain(|(_, weak)| weak.strong_count() > 0);
            // Split borrow: listeners are notified with the updated data.
            let RecordInner { data, listeners, .. } = &*inner;
            for (_, weak) in listeners {
                if let Some(listener) = weak.upgrade() {
                    listener.on_raw_change(data, &changed);
                }
            }
        }
        out
    }

    /// Reads the record under the lock.
    pub fn read<T>(&self, f: impl FnOnce(&FieldData) -> T) -> T {
        f(&self.lock().data)
    }

    /// Convenience accessor for one field by path.
    pub fn value(&self, path: &str) -> FluxResult<Value> {
        let offset = self
            .tree
            .find(path)
            .ok_or_else(|| ValidationError::UnknownField {
                path: path.to_string(),
            })?;
        Ok(self.read(|data| data.get(offset).clone()))
    }

    /// Attaches a raw-change listener, returning its detach handle.
    pub fn attach(&self, listener: Weak<dyn ChangeListener>) -> ListenerId {
        let mut inner = self.lock();
        let id = ListenerId(inner.next_listener);
        inner.next_listener += 1;
        inner.listeners.push((id, listener));
        id
    }

    /// Detaches a previously attached listener. Detaching twice is a no-op.
    pub fn detach(&self, id: ListenerId) {
        let mut inner = self.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|(lid, _)| *lid != id);
        if inner.listeners.len() == before {
            tracing::trace!(?id, "detach of unknown record listener ignored");
        }
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("name", &self.tree.name())
            .field("fields", &self.tree.field_count())
            .finish_non_exhaustive()
    }
}

/// One in-progress update cycle.
pub struct RecordTxn<'a> {
    tree: &'a FieldTree,
    data: &'a mut FieldData,
    changed: &'a mut ChangeVector,
}

impl RecordTxn<'_> {
    /// Writes a field by dotted path.
    ///
    /// # Errors
    ///
    /// Unknown path, writes to interior structures, and kind mismatches are
    /// rejected without touching the field.
    pub fn put(&mut self, path: &str, value: Value) -> FluxResult<()> {
        let offset = self
            .tree
            .find(path)
            .ok_or_else(|| ValidationError::UnknownField {
                path: path.to_string(),
            })?;
        self.put_at(offset, value)
    }

    /// Writes a field by offset.
    pub fn put_at(&mut self, offset: usize, value: Value) -> FluxResult<()> {
        let node = self.tree.node(offset);
        let FieldKind::Scalar(kind) = node.kind() else {
            return Err(ValidationError::NotAScalar {
                path: self.tree.path(offset),
            }
            .into());
        };
        if value.kind() != Some(kind) {
            return Err(ValidationError::TypeMismatch {
                path: self.tree.path(offset),
                expected: kind,
                got: value.type_name().to_string(),
            }
            .into());
        }
        self.data.set(offset, value);
        self.changed.set(offset);
        Ok(())
    }

    /// Writes the record's designated timestamp field.
    pub fn stamp(&mut self, when: DateTime<Utc>) -> FluxResult<()> {
        let offset = self
            .tree
            .timestamp_offset()
            .ok_or(ValidationError::NoTimestampField)?;
        self.put_at(offset, Value::Timestamp(when))
    }

    /// Bits accumulated so far in this cycle.
    #[must_use]
    pub fn changed(&self) -> &ChangeVector {
        self.changed
    }
}
