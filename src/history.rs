use crate::protocol::Address;
use std::collections::{BTreeMap, VecDeque};

pub const DEFAULT_STORE_SIZE: usize = 100;

/// Bounded per device sample history, oldest entries are evicted first.
#[derive(Debug, Clone)]
pub struct History<T> {
    store_size: usize,
    devices: BTreeMap<Address, VecDeque<T>>,
}

impl<T: Clone> History<T> {
    pub fn new(store_size: usize) -> Self {
        Self {
            store_size,
            devices: BTreeMap::new(),
        }
    }

    pub fn store_size(&self) -> usize {
        self.store_size
    }

    /// Changes the capacity, sequences above the new size are truncated right away.
    pub fn set_store_size(&mut self, store_size: usize) {
        log::trace!("set store size to {store_size}");
        self.store_size = store_size;
        for samples in self.devices.values_mut() {
            Self::evict(samples, store_size);
        }
    }

    pub fn append(&mut self, address: Address, sample: T) {
        let samples = self.devices.entry(address).or_default();
        samples.push_back(sample);
        Self::evict(samples, self.store_size);
    }

    fn evict(samples: &mut VecDeque<T>, store_size: usize) {
        if samples.len() > store_size {
            let excess = samples.len() - store_size;
            samples.drain(..excess);
        }
    }

    /// Copy of all samples in ascending address order, oldest sample first.
    pub fn snapshot(&self) -> Vec<(Address, Vec<T>)> {
        self.devices
            .iter()
            .map(|(address, samples)| (*address, samples.iter().cloned().collect()))
            .collect()
    }

    pub fn latest(&self, address: Address) -> Option<&T> {
        self.devices.get(&address).and_then(|samples| samples.back())
    }

    pub fn len(&self, address: Address) -> usize {
        self.devices.get(&address).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.devices.values().all(VecDeque::is_empty)
    }
}

impl<T: Clone> Default for History<T> {
    fn default() -> Self {
        Self::new(DEFAULT_STORE_SIZE)
    }
}
