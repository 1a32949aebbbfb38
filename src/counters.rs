use crate::wake::NonBlocking;

use metriken::Counter;
use thiserror::Error;

use std::fmt;

#[derive(Error, Debug, PartialEq)]
pub enum CounterGroupError {
    #[error("the index is higher than the counter group size")]
    InvalidIndex,
}

/// A fixed group of counters, one per logical CPU. Updates are lock-free so
/// the group can be bumped from the interrupt path.
pub struct CounterGroup {
    counters: Box<[Counter]>,
}

impl fmt::Debug for CounterGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.load()).finish()
    }
}

impl NonBlocking for CounterGroup {}

impl CounterGroup {
    /// Create a new counter group
    pub fn new(entries: usize) -> Self {
        Self {
            counters: (0..entries).map(|_| Counter::new()).collect(),
        }
    }

    /// Adds to the counter at a given index
    pub fn add(&self, idx: usize, value: u64) -> Result<(), CounterGroupError> {
        let counter = self
            .counters
            .get(idx)
            .ok_or(CounterGroupError::InvalidIndex)?;

        counter.add(value);

        Ok(())
    }

    pub fn value(&self, idx: usize) -> Option<u64> {
        self.counters.get(idx).map(|c| c.value())
    }

    /// Load the counter values
    pub fn load(&self) -> Vec<u64> {
        self.counters.iter().map(|c| c.value()).collect()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}
