//! The one piece of cross-loop shared state: which components have a cycle in
//! flight, bounded by a global cap.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotRejection {
    /// The component already has a cycle in flight.
    InFlight,
    AtCapacity { cap: usize },
}

#[derive(Debug)]
pub struct SlotRegistry {
    in_flight: Mutex<HashSet<String>>,
    cap: usize,
}

impl SlotRegistry {
    #[must_use]
    pub fn new(cap: usize) -> Arc<Self> {
        Arc::new(Self {
            in_flight: Mutex::new(HashSet::new()),
            cap: cap.max(1),
        })
    }

    #[must_use]
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Claims the component's slot. Mutual exclusion and the cap are checked
    /// under one lock, so they cannot be raced past.
    pub fn acquire(self: &Arc<Self>, component_id: &str) -> Result<CycleSlot, SlotRejection> {
        let mut in_flight = self.lock();
        if in_flight.contains(component_id) {
            return Err(SlotRejection::InFlight);
        }
        if in_flight.len() >= self.cap {
            return Err(SlotRejection::AtCapacity { cap: self.cap });
        }
        in_flight.insert(component_id.to_string());
        Ok(CycleSlot {
            registry: Arc::clone(self),
            component_id: component_id.to_string(),
        })
    }

    #[must_use]
    pub fn is_in_flight(&self, component_id: &str) -> bool {
        self.lock().contains(component_id)
    }

    #[must_use]
    pub fn in_flight(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().iter().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Held for the whole life of a cycle; releases the slot on drop, including
/// when the owning task panics or is aborted.
#[derive(Debug)]
pub struct CycleSlot {
    registry: Arc<SlotRegistry>,
    component_id: String,
}

impl CycleSlot {
    #[must_use]
    pub fn component_id(&self) -> &str {
        &self.component_id
    }
}

impl Drop for CycleSlot {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.component_id);
    }
}
