//! The shared registry of MIDI output sinks the engine emits to.

use std::sync::{Arc, PoisonError, RwLock};

use crate::traits::{MidiOutput, NullOutput};

/// An ordered, shared set of output sinks. Index 0 is always the null
/// output, so routing an unknown interface index there is harmless.
pub struct OutputSet {
    outputs: RwLock<Vec<Arc<dyn MidiOutput>>>,
}

impl OutputSet {
    /// Create a set containing only the null output.
    pub fn new() -> Self {
        Self {
            outputs: RwLock::new(vec![Arc::new(NullOutput::new())]),
        }
    }

    /// Create a set with the given sink at index 0 instead of the null
    /// output. Used by the SMF export run, which wants the buffer sink to
    /// catch everything.
    pub fn with_primary(primary: Arc<dyn MidiOutput>) -> Self {
        Self {
            outputs: RwLock::new(vec![primary]),
        }
    }

    /// Append a sink and return its index.
    pub fn add(&self, output: Arc<dyn MidiOutput>) -> usize {
        let mut outputs = self.write();
        outputs.push(output);
        outputs.len() - 1
    }

    /// Remove every sink except the one at index 0.
    pub fn clear_devices(&self) {
        self.write().truncate(1);
    }

    /// Number of sinks.
    pub fn count(&self) -> usize {
        self.read().len()
    }

    /// Sink at `index`, falling back to index 0 for out-of-range values.
    pub fn get(&self, index: usize) -> Arc<dyn MidiOutput> {
        let outputs = self.read();
        outputs
            .get(index)
            .unwrap_or_else(|| &outputs[0])
            .clone()
    }

    /// Index of the first sink whose name matches exactly.
    pub fn index_by_name(&self, name: &str) -> Option<usize> {
        self.read().iter().position(|output| output.name() == name)
    }

    /// A snapshot of all sinks, for iterating without holding the registry
    /// lock across emission.
    pub fn snapshot(&self) -> Vec<Arc<dyn MidiOutput>> {
        self.read().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<dyn MidiOutput>>> {
        self.outputs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<dyn MidiOutput>>> {
        self.outputs.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for OutputSet {
    fn default() -> Self {
        Self::new()
    }
}
