//! Striped per-entity locks.

use std::sync::{Mutex, MutexGuard};

use crate::entity::EntityId;

/// Fixed pool of mutexes; an entity always maps to the same stripe.
#[derive(Debug)]
pub(crate) struct StripedLocks {
    stripes: Vec<Mutex<()>>,
}

impl StripedLocks {
    pub(crate) fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    fn index(&self, id: EntityId) -> usize {
        (id.as_uuid().as_u128() % self.stripes.len() as u128) as usize
    }

    /// Serializes read-merge-save of one entity. The guarded data is `()`, so
    /// a poisoned stripe is still usable.
    pub(crate) fn lock(&self, id: EntityId) -> MutexGuard<'_, ()> {
        match self.stripes[self.index(id)].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_entity_same_stripe() {
        let locks = StripedLocks::new(8);
        let id = EntityId::new();
        assert_eq!(locks.index(id), locks.index(id));
        assert!(locks.index(id) < 8);
    }

    #[test]
    fn zero_stripes_clamped() {
        let locks = StripedLocks::new(0);
        drop(locks.lock(EntityId::new()));
    }
}
