//! In-memory machine table.
//!
//! Each machine owns a slot with two locks: an async transition lock held for
//! the whole of a lifecycle transition (adapter I/O included), and a short
//! synchronous lock over the record itself so readers never wait on I/O.
//! Tokio's mutex is fair, so transitions on one machine run in arrival order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::MutexGuard as AsyncMutexGuard;

use crate::machine::{Machine, MachineState};

pub(crate) struct MachineSlot {
    transition: AsyncMutex<()>,
    record: Mutex<Machine>,
}

impl MachineSlot {
    fn new(machine: Machine) -> Self {
        Self {
            transition: AsyncMutex::new(()),
            record: Mutex::new(machine),
        }
    }

    fn record(&self) -> MutexGuard<'_, Machine> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn snapshot(&self) -> Machine {
        self.record().clone()
    }

    pub(crate) fn state(&self) -> MachineState {
        self.record().state
    }

    /// Wait for every earlier transition on this machine, then own it.
    pub(crate) async fn begin(&self) -> Transition<'_> {
        Transition {
            _guard: self.transition.lock().await,
            slot: self,
        }
    }
}

/// Exclusive access to one machine for the length of a transition.
pub(crate) struct Transition<'a> {
    _guard: AsyncMutexGuard<'a, ()>,
    slot: &'a MachineSlot,
}

impl Transition<'_> {
    pub(crate) fn machine(&self) -> Machine {
        self.slot.snapshot()
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut Machine)) -> Machine {
        let mut record = self.slot.record();
        f(&mut record);
        record.updated_at = Utc::now();
        record.clone()
    }

    pub(crate) fn set_state(&self, state: MachineState) -> Machine {
        self.update(|m| m.state = state)
    }
}

#[derive(Default)]
pub(crate) struct MachineRegistry {
    slots: RwLock<HashMap<String, Arc<MachineSlot>>>,
}

impl MachineRegistry {
    /// Add a machine unless its workspace already has an active one, which
    /// is returned instead.
    pub(crate) fn insert(&self, machine: Machine) -> Result<Arc<MachineSlot>, Machine> {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());

        let active = slots
            .values()
            .map(|slot| slot.snapshot())
            .find(|m| m.workspace_id == machine.workspace_id && m.state.is_active());
        if let Some(active) = active {
            return Err(active);
        }

        let id = machine.id.clone();
        let slot = Arc::new(MachineSlot::new(machine));
        slots.insert(id, slot.clone());
        Ok(slot)
    }

    pub(crate) fn get(&self, id: &str) -> Option<Arc<MachineSlot>> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub(crate) fn remove(&self, id: &str) {
        self.slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    pub(crate) fn all(&self) -> Vec<Arc<MachineSlot>> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub(crate) fn for_workspace(&self, workspace_id: &str) -> Vec<Arc<MachineSlot>> {
        self.all()
            .into_iter()
            .filter(|slot| slot.record().workspace_id == workspace_id)
            .collect()
    }
}
