//! Device state store
//!
//! Owns the authoritative map of interior units. Outgoing commands go
//! through a per-device pending slot: rapid successive commands are
//! coalesced so only the latest merged control vector reaches the wire at
//! each dispatch iteration (last-write-wins per device).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::devices::changes::UnitChanges;
use crate::devices::models::{ControlState, ControlUpdate, InteriorUnit};
use crate::errors::{Error, Result};

/// Sends one full control vector and waits for its acknowledgement.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    async fn send_and_wait_ack(&self, control: &ControlState) -> Result<()>;
}

/// One batch of observed changes, handed to the change listener.
#[derive(Debug, Default)]
pub struct ChangeSet {
    /// Per-unit field diffs, keyed by unit id.
    pub changes: HashMap<i64, UnitChanges>,

    /// Units removed by a full-list reconciliation.
    pub removed: Vec<i64>,
}

pub type ChangeListener = Box<dyn Fn(ChangeSet) + Send + Sync>;

/// A control vector waiting to be dispatched. Equality ignores the
/// creation time so an identical re-submission is not re-sent.
#[derive(Debug, Clone)]
struct PendingState {
    control: ControlState,
    created_at: DateTime<Utc>,
}

impl PendingState {
    fn new(control: ControlState) -> Self {
        Self {
            control,
            created_at: Utc::now(),
        }
    }
}

impl PartialEq for PendingState {
    fn eq(&self, other: &Self) -> bool {
        self.control == other.control
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchState {
    Idle,
    Running,
}

struct UnitRuntime {
    unit: InteriorUnit,
    pending: Option<PendingState>,
    dispatch: DispatchState,
}

impl UnitRuntime {
    fn new(unit: InteriorUnit) -> Self {
        Self {
            unit,
            pending: None,
            dispatch: DispatchState::Idle,
        }
    }
}

struct StoreInner {
    dispatcher: Arc<dyn CommandDispatcher>,
    units: Mutex<HashMap<i64, UnitRuntime>>,
    on_change: std::sync::Mutex<Option<ChangeListener>>,
}

/// The device state store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct DeviceStore {
    inner: Arc<StoreInner>,
}

impl DeviceStore {
    pub fn new(dispatcher: Arc<dyn CommandDispatcher>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                dispatcher,
                units: Mutex::new(HashMap::new()),
                on_change: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Replace the change listener. Last assignment wins.
    pub fn set_change_listener(&self, listener: ChangeListener) {
        *self
            .inner
            .on_change
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    /// Snapshot of every known unit.
    pub async fn units(&self) -> Vec<InteriorUnit> {
        let units = self.inner.units.lock().await;
        units.values().map(|rt| rt.unit.clone()).collect()
    }

    /// Snapshot of one unit, if known.
    pub async fn find(&self, rac_id: i64) -> Option<InteriorUnit> {
        let units = self.inner.units.lock().await;
        units.get(&rac_id).map(|rt| rt.unit.clone())
    }

    /// Queue a partial control change for one unit.
    ///
    /// The update is merged onto the most recent of the still-pending
    /// command and the confirmed control vector, recorded as the new pending
    /// state (replacing any unconsumed one), and a dispatch task is started
    /// if none is running for the unit.
    pub async fn send_command(&self, rac_id: i64, update: ControlUpdate) -> Result<()> {
        let mut units = self.inner.units.lock().await;
        let runtime = units.get_mut(&rac_id).ok_or(Error::DeviceNotFound(rac_id))?;
        if !runtime.unit.online {
            return Err(Error::DeviceOffline(rac_id));
        }

        let base = match &runtime.pending {
            Some(pending) if pending.created_at > runtime.unit.updated_at => {
                pending.control.clone()
            }
            _ => runtime.unit.control.clone(),
        };
        runtime.pending = Some(PendingState::new(base.apply(&update)));

        if runtime.dispatch == DispatchState::Idle {
            runtime.dispatch = DispatchState::Running;
            let inner = self.inner.clone();
            tokio::spawn(dispatch_loop(inner, rac_id));
        }

        Ok(())
    }

    /// Apply a state update coming from discovery or the push channel.
    ///
    /// Every incoming unit replaces the stored record; a field-by-field
    /// diff per unit is reported to the change listener. A non-partial
    /// update also removes units absent from the incoming list.
    pub async fn apply_update(&self, incoming: Vec<InteriorUnit>, partial: bool) {
        let mut change_set = ChangeSet::default();
        {
            let mut units = self.inner.units.lock().await;

            if !partial {
                let incoming_ids: HashSet<i64> = incoming.iter().map(|u| u.id).collect();
                units.retain(|id, _| {
                    if incoming_ids.contains(id) {
                        true
                    } else {
                        change_set.removed.push(*id);
                        false
                    }
                });
            }

            for unit in incoming {
                match units.get_mut(&unit.id) {
                    Some(runtime) => {
                        let diff = UnitChanges::diff(&runtime.unit, &unit);
                        runtime.unit = unit;
                        change_set.changes.insert(runtime.unit.id, diff);
                    }
                    None => {
                        // first sighting, nothing to diff against
                        debug!("New interior unit {}", unit.id);
                        units.insert(unit.id, UnitRuntime::new(unit));
                    }
                }
            }
        }

        let listener = self
            .inner
            .on_change
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(listener) = listener.as_ref() {
            listener(change_set);
        }
    }

    /// Drop all device state.
    pub async fn clear(&self) {
        self.inner.units.lock().await.clear();
    }
}

/// Per-device dispatch loop: sends the latest pending control vector,
/// waiting for each acknowledgement, until the pending slot is exhausted.
/// A failed send does not abort the loop; the next coalesced state is
/// still attempted.
async fn dispatch_loop(inner: Arc<StoreInner>, rac_id: i64) {
    debug!("Start dispatch loop for unit {}", rac_id);
    let mut last_sent: Option<PendingState> = None;

    loop {
        let next = {
            let mut units = inner.units.lock().await;
            let Some(runtime) = units.get_mut(&rac_id) else {
                // unit vanished from a full-list reconciliation
                break;
            };
            match &runtime.pending {
                Some(pending) if last_sent.as_ref() != Some(pending) => pending.clone(),
                _ => {
                    runtime.dispatch = DispatchState::Idle;
                    break;
                }
            }
        };

        match inner.dispatcher.send_and_wait_ack(&next.control).await {
            Ok(()) => {
                let mut units = inner.units.lock().await;
                if let Some(runtime) = units.get_mut(&rac_id) {
                    runtime.unit.control = next.control.clone();
                    runtime.unit.updated_at = next.created_at;
                }
            }
            Err(e) => {
                warn!("Command for unit {} was not acknowledged: {}", rac_id, e);
            }
        }

        last_sent = Some(next);
    }
    debug!("End dispatch loop for unit {}", rac_id);
}
