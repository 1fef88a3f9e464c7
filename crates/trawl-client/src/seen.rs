use moka::sync::Cache;

/// Bounded set of external ids one adapter has delivered to the store during
/// the current session. Ids are marked only after the store commits them, so
/// a failed run re-emits its records on retry.
#[derive(Clone)]
pub struct SeenCache {
    ids: Cache<String, ()>,
}

impl SeenCache {
    pub const DEFAULT_CAPACITY: u64 = 50_000;

    pub fn new(capacity: u64) -> Self {
        Self {
            ids: Cache::new(capacity),
        }
    }

    pub fn mark(&self, id: &str) {
        self.ids.insert(id.to_string(), ());
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains_key(id)
    }

    /// Forget every id. Called at the start of a full sweep.
    pub fn clear(&self) {
        self.ids.invalidate_all();
    }
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
