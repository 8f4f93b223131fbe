// Computed (derived) cache values with dependency-version memoization.
//
// A computed value caches its result together with the version stamps of
// the dependencies it was computed from. A read recomputes only when some
// dependency's current version differs -- unrelated store writes never
// trigger recomputation.

use std::sync::{Arc, Mutex};

use serde_json::Value;

use super::Store;

type ComputeFn = Arc<dyn Fn(&[Option<Arc<Value>>]) -> Value + Send + Sync>;

/// Version stamp used for a missing dependency. Real stamps start at 1,
/// so appearing/disappearing dependencies always invalidate the memo.
const MISSING_DEP_VERSION: u64 = 0;

struct Memo {
    result: Arc<Value>,
    dep_versions: Vec<u64>,
}

/// Definition of one computed value. Cheap to clone: all state is shared.
#[derive(Clone)]
pub struct ComputedDef {
    deps: Arc<Vec<String>>,
    func: ComputeFn,
    memo: Arc<Mutex<Option<Memo>>>,
}

impl ComputedDef {
    pub(super) fn new(
        deps: &[&str],
        func: impl Fn(&[Option<Arc<Value>>]) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            deps: Arc::new(deps.iter().map(|&d| d.to_owned()).collect()),
            func: Arc::new(func),
            memo: Arc::new(Mutex::new(None)),
        }
    }

    /// Return the memoized result, recomputing if any dependency moved.
    pub(super) fn evaluate(&self, store: &Store) -> Arc<Value> {
        let reads: Vec<_> = self.deps.iter().map(|dep| store.get(dep)).collect();
        let versions: Vec<u64> = reads
            .iter()
            .map(|read| read.as_ref().map_or(MISSING_DEP_VERSION, |r| r.version))
            .collect();

        let mut memo = match self.memo.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(cached) = memo.as_ref() {
            if cached.dep_versions == versions {
                return Arc::clone(&cached.result);
            }
        }

        let values: Vec<Option<Arc<Value>>> =
            reads.into_iter().map(|read| read.map(|r| r.value)).collect();
        let result = Arc::new((self.func)(&values));
        *memo = Some(Memo {
            result: Arc::clone(&result),
            dep_versions: versions,
        });
        result
    }
}
