//! Shared, swappable reference to the current schedule version.

use std::sync::{Arc, RwLock};
use tracing::info;

use super::graph::ScheduleGraph;

/// Readers clone the current `Arc` and keep matching against it even while a
/// newer version is being built; the swap itself is a single pointer write.
#[derive(Debug)]
pub struct ScheduleHandle {
    current: RwLock<Arc<ScheduleGraph>>,
}

impl ScheduleHandle {
    pub fn new(graph: ScheduleGraph) -> Self {
        Self {
            current: RwLock::new(Arc::new(graph)),
        }
    }

    pub fn current(&self) -> Arc<ScheduleGraph> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Installs a fully built graph, returning the version it replaced.
    pub fn replace(&self, graph: ScheduleGraph) -> Arc<ScheduleGraph> {
        let next = Arc::new(graph);
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = std::mem::replace(&mut *guard, next);
        info!(
            previous_version = previous.version(),
            version = guard.version(),
            "Schedule version replaced"
        );
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::fixtures;

    #[test]
    fn test_readers_keep_old_version_after_swap() {
        let handle = ScheduleHandle::new(fixtures::graph());
        let before = handle.current();
        assert_eq!(before.version(), "v1");

        let next = fixtures::builder_with_version("v2")
            .trip(fixtures::trip("T1", "P_EAST", "B1", 8 * 3600))
            .build()
            .unwrap();
        let replaced = handle.replace(next);

        assert_eq!(replaced.version(), "v1");
        assert_eq!(before.version(), "v1");
        assert!(before.trip("T2").is_some());
        assert_eq!(handle.current().version(), "v2");
        assert!(handle.current().trip("T2").is_none());
    }
}
