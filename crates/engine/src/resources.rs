//! Named-capacity resource accounting for one workflow run.
//!
//! Owned by the scheduler's decision loop: every `acquire` is paired with a
//! dispatch and every `release` with a completion event.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct ResourcePool {
    capacity: BTreeMap<String, u32>,
    in_use: BTreeMap<String, u32>,
}

impl ResourcePool {
    pub fn new(capacity: &BTreeMap<String, u32>) -> Self {
        Self {
            capacity: capacity.clone(),
            in_use: BTreeMap::new(),
        }
    }

    /// Free capacity of a resource; unknown resources have none.
    pub fn available(&self, resource: &str) -> u32 {
        let total = self.capacity.get(resource).copied().unwrap_or(0);
        total.saturating_sub(self.in_use.get(resource).copied().unwrap_or(0))
    }

    pub fn can_acquire(&self, requirements: &BTreeMap<String, u32>) -> bool {
        requirements
            .iter()
            .all(|(resource, &amount)| amount <= self.available(resource))
    }

    /// Take the requirements if all of them fit; all-or-nothing.
    #[must_use]
    pub fn acquire(&mut self, requirements: &BTreeMap<String, u32>) -> bool {
        if !self.can_acquire(requirements) {
            return false;
        }
        for (resource, &amount) in requirements {
            *self.in_use.entry(resource.clone()).or_insert(0) += amount;
        }
        true
    }

    pub fn release(&mut self, requirements: &BTreeMap<String, u32>) {
        for (resource, &amount) in requirements {
            if let Some(used) = self.in_use.get_mut(resource) {
                *used = used.saturating_sub(amount);
            }
        }
    }
}
