//! Pool of pre-sized top-level maps for per-backend request clones.
//!
//! One inbound request is cloned once per target backend on the hot path;
//! the pool amortizes the envelope-map allocations. Returning a map is
//! best-effort: dropping a clone without `put` just forfeits the reuse.

use parking_lot::Mutex;
use serde_json::{Map, Value};

const PRESIZE: usize = 30;
const MAX_POOLED: usize = 64;

pub type JsonMap = Map<String, Value>;

pub struct MapPool {
    free: Mutex<Vec<JsonMap>>,
}

impl MapPool {
    pub fn new() -> Self {
        MapPool {
            free: Mutex::new(Vec::new()),
        }
    }

    fn take(&self) -> JsonMap {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| JsonMap::with_capacity(PRESIZE))
    }

    /// Returns a map to the pool. Idempotent and bounded.
    pub fn put(&self, mut map: JsonMap) {
        map.clear();
        let mut free = self.free.lock();
        if free.len() < MAX_POOLED {
            free.push(map);
        }
    }

    /// Deep clone of a request envelope into a pooled top-level map.
    ///
    /// Envelope scalars (`jsonrpc`, `method`, `id`, `auth`) are copied
    /// directly; everything else — in practice `params` — is cloned deeply
    /// so per-backend mutation never leaks into the source.
    pub fn clone_request(&self, src: &JsonMap) -> JsonMap {
        let mut dst = self.take();
        for (key, value) in src {
            dst.insert(key.clone(), value.clone());
        }
        dst
    }
}

impl Default for MapPool {
    fn default() -> Self {
        Self::new()
    }
}
