use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Registry of segment files currently held by a query or a builder.
/// Garbage collection skips any soft-deleted file whose id is still marked
/// here. Marks are reference counted; releasing a file that was never marked
/// is an invariant breach and aborts the process.
#[derive(Default, Debug)]
pub struct OngoingFiles {
    refs: DashMap<i64, u64>,
}

impl OngoingFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, id: i64) {
        *self.refs.entry(id).or_insert(0) += 1;
    }

    pub fn unmark(&self, id: i64) {
        match self.refs.entry(id) {
            Entry::Occupied(mut entry) => {
                let count = entry.get_mut();
                *count -= 1;
                if *count == 0 {
                    entry.remove();
                }
            }
            Entry::Vacant(_) => panic!("unbalanced ongoing-file release for file id {id}"),
        }
    }

    pub fn contains(&self, id: i64) -> bool {
        self.refs.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Mark a working set and tie the release to a guard, so every exit path
    /// (including errors and panics in the holder) releases the references.
    pub fn guard(self: &Arc<Self>, ids: impl IntoIterator<Item = i64>) -> OngoingGuard {
        let ids: Vec<i64> = ids.into_iter().collect();
        for &id in &ids {
            self.mark(id);
        }
        OngoingGuard {
            set: Arc::clone(self),
            ids,
        }
    }
}

pub struct OngoingGuard {
    set: Arc<OngoingFiles>,
    ids: Vec<i64>,
}

impl Drop for OngoingGuard {
    fn drop(&mut self) {
        for &id in &self.ids {
            self.set.unmark(id);
        }
    }
}
