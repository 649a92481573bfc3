//! The monitor engine.
//!
//! One engine per subscription. The source record drives production
//! synchronously under its own lock; `poll`/`release` run on the consumer's
//! thread at its own pace. Nothing here blocks indefinitely: a full ring
//! coalesces, an empty ring returns `None`, and a stopped or destroyed
//! engine silently drops late raw-change notifications.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, tick, Sender};

use super::ring::{lock_slot, Snapshot, SnapshotRing, UsedSlot};
use super::triggers::{AlgorithmRegistry, BindingSite, TriggerAlgorithm, TriggerContext};
use super::{MonitorRequest, SubscriptionId};
use crate::bitset::ChangeVector;
use crate::compress::{compress, materialize_into};
use crate::copy::FieldCopy;
use crate::error::{EngineError, FluxResult, ValidationError};
use crate::field::{FieldData, FieldTree};
use crate::record::{ChangeListener, ListenerId, Record};
use crate::value::Value;

/// Receiver of "data ready" signals, invoked at most once per distinct
/// snapshot becoming available.
///
/// Called from the producer's update cycle (or the periodic timer worker),
/// so implementations must be quick and must not call back into the record
/// synchronously. Sending on a channel is the typical shape; any
/// `Fn(SubscriptionId)` closure and any crossbeam `Sender<SubscriptionId>`
/// qualify.
pub trait ReadyCallback: Send + Sync {
    /// One new snapshot became available for `subscription`.
    fn data_ready(&self, subscription: SubscriptionId);
}

impl<F> ReadyCallback for F
where
    F: Fn(SubscriptionId) + Send + Sync,
{
    fn data_ready(&self, subscription: SubscriptionId) {
        self(subscription);
    }
}

impl ReadyCallback for Sender<SubscriptionId> {
    fn data_ready(&self, subscription: SubscriptionId) {
        // Never block the producer on a slow consumer channel.
        let _ = self.try_send(subscription);
    }
}

/// Monotonic counters describing one engine's activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    /// Raw update cycles observed while started.
    pub updates_observed: u64,
    /// Cycles suppressed by trigger algorithms.
    pub updates_suppressed: u64,
    /// Snapshots committed for delivery.
    pub snapshots_committed: u64,
    /// Updates coalesced into an already-queued snapshot.
    pub overrun_coalesces: u64,
}

#[derive(Debug, Default)]
struct Counters {
    observed: AtomicU64,
    suppressed: AtomicU64,
    committed: AtomicU64,
    coalesced: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stopped,
    Started,
    Destroyed,
}

struct BoundTrigger {
    offset: usize,
    span: usize,
    algorithm: Box<dyn TriggerAlgorithm>,
}

struct EngineState {
    phase: Phase,
    first_monitor: bool,
    triggers: Vec<BoundTrigger>,
    /// Leaf bits covered by at least one trigger binding; anything outside
    /// always fires (pass-through).
    covered: ChangeVector,
    /// Every leaf bit of the copy, the firstMonitor changed set.
    all_leaves: ChangeVector,
    /// Scratch: record-space raw bits mapped onto copy leaves.
    mapped: ChangeVector,
    /// Scratch: materialized form of a queued snapshot's compressed marks.
    coalesce: ChangeVector,
    /// Scratch: indices of triggers that fired this cycle.
    fired: Vec<usize>,
}

/// Producer-side accumulation plus consumer-side hand-off for the
/// single-slot strategies.
pub(crate) struct SingleInner {
    /// Producer accumulation; marks stay leaf-level until hand-off.
    pub(crate) active: Snapshot,
    /// What the consumer currently sees.
    pub(crate) handoff: Snapshot,
    pub(crate) dirty: bool,
    pub(crate) held: bool,
    pub(crate) announced: bool,
}

struct SingleSlot {
    inner: Arc<Mutex<SingleInner>>,
}

impl SingleSlot {
    fn new(tree: &FieldTree) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SingleInner {
                active: Snapshot::for_tree(tree),
                handoff: Snapshot::for_tree(tree),
                dirty: false,
                held: false,
                announced: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SingleInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reset(&self) {
        let mut inner = self.lock();
        inner.active.clear_marks();
        inner.handoff.clear_marks();
        inner.dirty = false;
        inner.held = false;
        inner.announced = false;
    }
}

enum QueueStrategy {
    /// Depth 1: one shared coalescing slot, delivery raised immediately.
    NoQueue(SingleSlot),
    /// Depth ≥ 2: multi-slot ring with overrun coalescing when full.
    Ring(SnapshotRing),
    /// Single slot, delivery gated by a periodic timer.
    Periodic { slot: SingleSlot, period: Duration },
}

/// One queued snapshot handed to the consumer by [`MonitorEngine::poll`].
///
/// Must be returned through [`MonitorEngine::release`]; the token cannot be
/// duplicated, so releasing a snapshot that is not held is unrepresentable
/// for ring subscriptions and panics for shared-slot ones.
pub struct MonitorElement {
    subscription: SubscriptionId,
    inner: ElementInner,
}

enum ElementInner {
    Ring(UsedSlot),
    Single(Arc<Mutex<SingleInner>>),
}

impl MonitorElement {
    /// The subscription this element belongs to.
    #[must_use]
    pub fn subscription(&self) -> SubscriptionId {
        self.subscription
    }

    /// Reads the snapshot under its lock.
    pub fn with_snapshot<T>(&self, f: impl FnOnce(&Snapshot) -> T) -> T {
        match &self.inner {
            ElementInner::Ring(token) => f(&token.lock()),
            ElementInner::Single(slot) => {
                let inner = slot.lock().unwrap_or_else(PoisonError::into_inner);
                f(&inner.handoff)
            }
        }
    }

    /// Clone of the changed vector.
    #[must_use]
    pub fn changed(&self) -> ChangeVector {
        self.with_snapshot(|s| s.changed.clone())
    }

    /// Clone of the overrun vector.
    #[must_use]
    pub fn overrun(&self) -> ChangeVector {
        self.with_snapshot(|s| s.overrun.clone())
    }

    /// Clone of one field value by copy offset.
    #[must_use]
    pub fn value(&self, offset: usize) -> Value {
        self.with_snapshot(|s| s.data.get(offset).clone())
    }
}

impl std::fmt::Debug for MonitorElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorElement")
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}

/// The per-subscription orchestrator.
///
/// Lifecycle: Stopped (initial) → Started (`start`) → Stopped (`stop`,
/// idempotent, restartable) → Destroyed (`destroy`, terminal).
pub struct MonitorEngine {
    id: SubscriptionId,
    /// Self-reference handed to the record and the timer worker; set once
    /// at construction.
    weak_self: Weak<MonitorEngine>,
    record: Arc<Record>,
    copy: FieldCopy,
    ready: Box<dyn ReadyCallback>,
    state: Mutex<EngineState>,
    queue: QueueStrategy,
    counters: Counters,
    listener: Mutex<Option<ListenerId>>,
    timer: Mutex<Option<Sender<()>>>,
}

impl MonitorEngine {
    /// Validates the request, binds algorithms, and builds a stopped engine.
    ///
    /// # Errors
    ///
    /// Queue depth below 1, a periodic rate combined with a deeper queue,
    /// unknown selector paths, unknown algorithm names, and invalid binding
    /// sites all reject the subscription; nothing is left half-initialized.
    pub fn new(
        record: Arc<Record>,
        request: &MonitorRequest,
        registry: &AlgorithmRegistry,
        ready: Box<dyn ReadyCallback>,
    ) -> FluxResult<Arc<Self>> {
        if request.queue_depth < 1 {
            return Err(ValidationError::InvalidQueueDepth {
                got: request.queue_depth,
            }
            .into());
        }
        let period = request.period()?;
        if period.is_some() && request.queue_depth > 1 {
            return Err(ValidationError::InvalidRequest {
                reason: "periodic delivery uses a single coalescing slot; queue depth must be 1"
                    .to_string(),
            }
            .into());
        }
        // A two-slot ring is promoted to three.
        let depth = if request.queue_depth == 2 {
            3
        } else {
            request.queue_depth
        };

        let copy = FieldCopy::new(&record, &request.fields)?;
        let field_count = copy.tree().field_count();

        let mut triggers = Vec::with_capacity(request.algorithms.len());
        let mut covered = ChangeVector::new(field_count);
        record.read(|data| -> FluxResult<()> {
            for binding in &request.algorithms {
                let offset =
                    copy.tree()
                        .find(&binding.field)
                        .ok_or_else(|| ValidationError::UnknownField {
                            path: binding.field.clone(),
                        })?;
                let factory = registry.resolve(&binding.algorithm)?;
                let algorithm = factory.create(&BindingSite {
                    copy: &copy,
                    record_data: data,
                    offset,
                    options: &binding.options,
                })?;
                for leaf in copy.tree().leaves_in(offset) {
                    covered.set(leaf);
                }
                triggers.push(BoundTrigger {
                    offset,
                    span: copy.tree().node(offset).span(),
                    algorithm,
                });
            }
            Ok(())
        })?;

        let mut all_leaves = ChangeVector::new(field_count);
        for leaf in copy.tree().leaves_in(0) {
            all_leaves.set(leaf);
        }

        let queue = match period {
            Some(period) => QueueStrategy::Periodic {
                slot: SingleSlot::new(copy.tree()),
                period,
            },
            None if depth == 1 => QueueStrategy::NoQueue(SingleSlot::new(copy.tree())),
            None => QueueStrategy::Ring(SnapshotRing::new(depth, copy.tree())),
        };

        Ok(Arc::new_cyclic(|weak| Self {
            id: SubscriptionId::new(),
            weak_self: weak.clone(),
            record,
            copy,
            ready,
            state: Mutex::new(EngineState {
                phase: Phase::Stopped,
                first_monitor: true,
                triggers,
                covered,
                all_leaves,
                mapped: ChangeVector::new(field_count),
                coalesce: ChangeVector::new(field_count),
                fired: Vec::with_capacity(request.algorithms.len()),
            }),
            queue,
            counters: Counters::default(),
            listener: Mutex::new(None),
            timer: Mutex::new(None),
        }))
    }

    fn state_lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// This subscription's id.
    #[must_use]
    pub fn subscription_id(&self) -> SubscriptionId {
        self.id
    }

    /// The copy-space layout snapshots are shaped by.
    #[must_use]
    pub fn copy_tree(&self) -> &Arc<FieldTree> {
        self.copy.tree()
    }

    /// Current counter values.
    #[must_use]
    pub fn stats(&self) -> MonitorStats {
        MonitorStats {
            updates_observed: self.counters.observed.load(Ordering::Relaxed),
            updates_suppressed: self.counters.suppressed.load(Ordering::Relaxed),
            snapshots_committed: self.counters.committed.load(Ordering::Relaxed),
            overrun_coalesces: self.counters.coalesced.load(Ordering::Relaxed),
        }
    }

    /// Starts listening for raw changes. Idempotent on a started engine;
    /// re-arms the first-monitor rule and clears the queue on a restart.
    ///
    /// # Errors
    ///
    /// A destroyed engine cannot be started again.
    pub fn start(&self) -> FluxResult<()> {
        {
            let mut st = self.state_lock();
            match st.phase {
                Phase::Destroyed => return Err(EngineError::Destroyed.into()),
                Phase::Started => return Ok(()),
                Phase::Stopped => {}
            }
            st.phase = Phase::Started;
            st.first_monitor = true;
        }
        match &self.queue {
            QueueStrategy::Ring(ring) => ring.clear(),
            QueueStrategy::NoQueue(slot) | QueueStrategy::Periodic { slot, .. } => slot.reset(),
        }

        let weak: Weak<dyn ChangeListener> = self.weak_self.clone();
        *self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(self.record.attach(weak));

        if let QueueStrategy::Periodic { period, .. } = &self.queue {
            self.spawn_timer(*period);
        }
        tracing::debug!(subscription = %self.id, "monitor started");
        Ok(())
    }

    /// Stops listening. Idempotent; safe from any thread; a stopped engine
    /// can be restarted.
    pub fn stop(&self) -> FluxResult<()> {
        let was_started = {
            let mut st = self.state_lock();
            let was = st.phase == Phase::Started;
            if was {
                st.phase = Phase::Stopped;
            }
            was
        };
        if let Some(id) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            self.record.detach(id);
        }
        // Dropping the shutdown sender cancels the timer worker.
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if was_started {
            tracing::debug!(subscription = %self.id, "monitor stopped");
        }
        Ok(())
    }

    /// Stops the engine and releases its bindings. Terminal and idempotent;
    /// late raw-change notifications are dropped silently.
    pub fn destroy(&self) {
        let _ = self.stop();
        let mut st = self.state_lock();
        if st.phase != Phase::Destroyed {
            st.phase = Phase::Destroyed;
            st.triggers.clear();
            tracing::debug!(subscription = %self.id, "monitor destroyed");
        }
    }

    /// Retrieves the oldest ready snapshot, or `None` when nothing is ready
    /// (or the consumer already holds one).
    ///
    /// # Panics
    ///
    /// Polling a destroyed engine is a consumer protocol violation.
    pub fn poll(&self) -> Option<MonitorElement> {
        assert!(
            self.state_lock().phase != Phase::Destroyed,
            "poll on a destroyed monitor"
        );
        match &self.queue {
            QueueStrategy::Ring(ring) => ring.get_used().map(|token| MonitorElement {
                subscription: self.id,
                inner: ElementInner::Ring(token),
            }),
            QueueStrategy::NoQueue(slot) | QueueStrategy::Periodic { slot, .. } => {
                let mut inner = slot.lock();
                if !inner.dirty || inner.held {
                    return None;
                }
                let SingleInner {
                    active,
                    handoff,
                    dirty,
                    held,
                    announced,
                } = &mut *inner;
                handoff.changed.clone_from(&active.changed);
                handoff.overrun.clone_from(&active.overrun);
                for offset in active.changed.iter() {
                    handoff.data.set(offset, active.data.get(offset).clone());
                }
                compress(&mut handoff.changed, self.copy.tree());
                compress(&mut handoff.overrun, self.copy.tree());
                active.changed.clear_all();
                active.overrun.clear_all();
                *dirty = false;
                *held = true;
                *announced = false;
                drop(inner);
                Some(MonitorElement {
                    subscription: self.id,
                    inner: ElementInner::Single(Arc::clone(&slot.inner)),
                })
            }
        }
    }

    /// Returns a polled snapshot to the free pool, clearing its marks.
    ///
    /// # Panics
    ///
    /// Releasing to a destroyed engine, releasing a foreign element, or
    /// releasing a shared-slot snapshot that is not held are consumer
    /// protocol violations.
    pub fn release(&self, element: MonitorElement) {
        assert!(
            element.subscription == self.id,
            "snapshot released to a different monitor"
        );
        assert!(
            self.state_lock().phase != Phase::Destroyed,
            "release on a destroyed monitor"
        );
        match element.inner {
            ElementInner::Ring(token) => {
                let QueueStrategy::Ring(ring) = &self.queue else {
                    unreachable!("ring element from a non-ring subscription");
                };
                token.lock().clear_marks();
                ring.release_used(token);
            }
            ElementInner::Single(slot) => {
                let mut inner = slot.lock().unwrap_or_else(PoisonError::into_inner);
                assert!(inner.held, "released a snapshot that is not held");
                inner.held = false;
                inner.handoff.clear_marks();
            }
        }
    }

    fn spawn_timer(&self, period: Duration) {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        *self.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(shutdown_tx);
        let weak = self.weak_self.clone();
        thread::Builder::new()
            .name(format!("fieldflux-periodic-{}", self.id))
            .spawn(move || {
                let ticker = tick(period);
                loop {
                    crossbeam_channel::select! {
                        recv(ticker) -> _ => {
                            let Some(engine) = weak.upgrade() else { break };
                            engine.periodic_tick();
                        }
                        recv(shutdown_rx) -> msg => {
                            if msg.is_err() {
                                break;
                            }
                        }
                    }
                }
            })
            .expect("failed to spawn fieldflux periodic worker");
    }

    fn periodic_tick(&self) {
        if self.state_lock().phase != Phase::Started {
            return;
        }
        let QueueStrategy::Periodic { slot, .. } = &self.queue else {
            return;
        };
        let announce = {
            let mut inner = slot.lock();
            if inner.dirty && !inner.announced {
                inner.announced = true;
                true
            } else {
                false
            }
        };
        if announce {
            self.ready.data_ready(self.id);
        }
    }

    fn produce_ring(&self, ring: &SnapshotRing, data: &FieldData, bits: &ChangeVector, scratch: &mut ChangeVector) -> bool {
        if let Some(free) = ring.get_free() {
            {
                let mut snap = free.lock();
                snap.changed.or(bits);
                self.copy.update_copy_from_record(&mut snap.data, data, bits);
                compress(&mut snap.changed, self.copy.tree());
                compress(&mut snap.overrun, self.copy.tree());
            }
            ring.set_used(free);
            self.counters.committed.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        // Full: coalesce into the newest queued snapshot. Only intermediate
        // values are lost; the change marks survive as overrun bits.
        if let Some(slot) = ring.newest_used() {
            let mut snap = lock_slot(&slot);
            materialize_into(&snap.changed, self.copy.tree(), scratch);
            for b in bits.iter() {
                if scratch.test(b) {
                    snap.overrun.set(b);
                }
            }
            snap.changed.or(bits);
            self.copy.update_copy_from_record(&mut snap.data, data, bits);
            compress(&mut snap.changed, self.copy.tree());
            compress(&mut snap.overrun, self.copy.tree());
            self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                subscription = %self.id,
                "ring full; update coalesced into newest queued snapshot"
            );
        }
        false
    }

    fn produce_single(&self, slot: &SingleSlot, data: &FieldData, bits: &ChangeVector, announce_now: bool) -> bool {
        let mut inner = slot.lock();
        let SingleInner {
            active,
            dirty,
            announced,
            ..
        } = &mut *inner;
        for b in bits.iter() {
            if active.changed.test(b) {
                active.overrun.set(b);
            }
        }
        active.changed.or(bits);
        self.copy.update_copy_from_record(&mut active.data, data, bits);
        let first_of_snapshot = !*dirty;
        *dirty = true;
        if first_of_snapshot {
            self.counters.committed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
        }
        if announce_now && !*announced {
            *announced = true;
            return true;
        }
        false
    }
}

impl ChangeListener for MonitorEngine {
    fn on_raw_change(&self, data: &FieldData, changed: &ChangeVector) {
        let mut st = self.state_lock();
        if st.phase != Phase::Started {
            tracing::trace!(subscription = %self.id, "late raw change dropped");
            return;
        }
        self.counters.observed.fetch_add(1, Ordering::Relaxed);

        let EngineState {
            first_monitor,
            triggers,
            covered,
            all_leaves,
            mapped,
            coalesce,
            fired,
            phase: _,
        } = &mut *st;

        self.copy.map_record_bits_into(changed, mapped);
        if mapped.is_empty() {
            return;
        }

        fired.clear();
        let significant = if *first_monitor {
            // A fresh subscriber sees the complete current value; trigger
            // baselines advance to it.
            *first_monitor = false;
            mapped.or(all_leaves);
            for (i, bound) in triggers.iter_mut().enumerate() {
                let ctx = TriggerContext {
                    copy: &self.copy,
                    record_data: data,
                    raw: mapped,
                    offset: bound.offset,
                    span: bound.span,
                };
                let _ = bound.algorithm.cause_monitor(&ctx);
                fired.push(i);
            }
            true
        } else {
            let mut any_fired = false;
            for (i, bound) in triggers.iter_mut().enumerate() {
                if !mapped.intersects(bound.offset, bound.offset + bound.span) {
                    continue;
                }
                let ctx = TriggerContext {
                    copy: &self.copy,
                    record_data: data,
                    raw: mapped,
                    offset: bound.offset,
                    span: bound.span,
                };
                if bound.algorithm.cause_monitor(&ctx) {
                    any_fired = true;
                    fired.push(i);
                }
            }
            any_fired || mapped.iter().any(|b| !covered.test(b))
        };

        if !significant {
            self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let announce = match &self.queue {
            QueueStrategy::Ring(ring) => self.produce_ring(ring, data, mapped, coalesce),
            QueueStrategy::NoQueue(slot) => self.produce_single(slot, data, mapped, true),
            QueueStrategy::Periodic { slot, .. } => self.produce_single(slot, data, mapped, false),
        };

        // The evaluated values are materialized for delivery either way, so
        // baselines advance even on the coalescing path.
        for &i in fired.iter() {
            triggers[i].algorithm.monitor_issued();
        }

        drop(st);
        if announce {
            self.ready.data_ready(self.id);
        }
    }
}

impl std::fmt::Debug for MonitorEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let strategy = match &self.queue {
            QueueStrategy::NoQueue(_) => "no-queue",
            QueueStrategy::Ring(_) => "ring",
            QueueStrategy::Periodic { .. } => "periodic",
        };
        f.debug_struct("MonitorEngine")
            .field("subscription", &self.id)
            .field("record", &self.record.tree().name())
            .field("strategy", &strategy)
            .finish_non_exhaustive()
    }
}
