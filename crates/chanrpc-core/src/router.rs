//! Routing of responses, errors and callback invocations by transaction id.

use crate::message::TransactionId;
use rand::Rng;
use std::collections::HashMap;

/// Upper bound (exclusive) of the random id seed.
const SEED_RANGE: u64 = 1_000_000;

/// Process-wide table from outstanding transaction id to the channel that
/// issued the request.
///
/// Ids come from one counter shared by every channel in the process, so two
/// outstanding requests never share an id.
#[derive(Debug)]
pub struct TransactionRouter<H> {
    next_id: TransactionId,
    routes: HashMap<TransactionId, H>,
}

impl<H> Default for TransactionRouter<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> TransactionRouter<H> {
    /// Create a router whose counter starts at a random odd value.
    pub fn new() -> Self {
        Self::with_seed(rand::thread_rng().gen_range(0..SEED_RANGE) | 1)
    }

    pub fn with_seed(seed: TransactionId) -> Self {
        Self {
            next_id: seed,
            routes: HashMap::new(),
        }
    }

    /// Take the next id and associate it with `handler`.
    pub fn allocate(&mut self, handler: H) -> TransactionId {
        let mut id = self.next_id;
        while self.routes.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        self.next_id = id.wrapping_add(1);
        self.routes.insert(id, handler);
        id
    }

    /// Drop the association for `id`, returning its handler.
    pub fn release(&mut self, id: TransactionId) -> Option<H> {
        self.routes.remove(&id)
    }

    /// The id the next allocation will try first.
    pub fn peek_next_id(&self) -> TransactionId {
        self.next_id
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl<H: Clone> TransactionRouter<H> {
    pub fn lookup(&self, id: TransactionId) -> Option<H> {
        self.routes.get(&id).cloned()
    }
}
