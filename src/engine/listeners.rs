//! Observers of the machine set.
//!
//! Listeners are held weakly and notified on the async worker, never on the
//! thread that changed the graph and never on the audio thread.

use std::sync::{Arc, Weak};

use super::arena::MachineId;

/// Identity of a machine as reported to listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MachineRef {
    pub id: MachineId,
    pub name: String,
    pub type_id: &'static str,
}

/// An observer of machine registration and wiring.
///
/// Every method has an empty default so listeners only implement what they need.
pub trait MachineSetListener: Send + Sync {
    fn project_loaded(&self) {}

    fn machine_registered(&self, _machine: &MachineRef) {}

    fn machine_unregistered(&self, _machine: &MachineRef) {}

    fn machine_input_attached(
        &self,
        _source: &MachineRef,
        _destination: &MachineRef,
        _output: &str,
        _input: &str,
    ) {
    }

    fn machine_input_detached(
        &self,
        _source: &MachineRef,
        _destination: &MachineRef,
        _output: &str,
        _input: &str,
    ) {
    }
}

/// The registered listeners.
#[derive(Default)]
pub struct ListenerSet {
    listeners: Vec<Weak<dyn MachineSetListener>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener. Adding one that is already present does nothing.
    pub fn add(&mut self, listener: &Arc<dyn MachineSetListener>) -> bool {
        self.prune();
        let weak = Arc::downgrade(listener);
        if self.listeners.iter().any(|l| Weak::ptr_eq(l, &weak)) {
            return false;
        }
        self.listeners.push(weak);
        true
    }

    pub fn remove(&mut self, listener: &Arc<dyn MachineSetListener>) {
        let weak = Arc::downgrade(listener);
        self.listeners.retain(|l| !Weak::ptr_eq(l, &weak));
    }

    /// Live listeners.
    pub fn live(&self) -> Vec<Arc<dyn MachineSetListener>> {
        self.listeners.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.iter().filter(|l| l.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune(&mut self) {
        self.listeners.retain(|l| l.strong_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quiet;

    impl MachineSetListener for Quiet {}

    #[test]
    fn test_add_is_idempotent() {
        let mut set = ListenerSet::new();
        let listener: Arc<dyn MachineSetListener> = Arc::new(Quiet);
        assert!(set.add(&listener));
        assert!(!set.add(&listener));
        assert_eq!(set.len(), 1);
        set.remove(&listener);
        assert!(set.is_empty());
    }

    #[test]
    fn test_dropped_listener_disappears() {
        let mut set = ListenerSet::new();
        let listener: Arc<dyn MachineSetListener> = Arc::new(Quiet);
        set.add(&listener);
        drop(listener);
        assert!(set.live().is_empty());
        assert_eq!(set.len(), 0);
    }
}
