use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::state::runtime::{PipelineRuntime, RuntimeSnapshot};
use crate::types::PipelineId;

/// Runtime records of every pipeline in the process.
#[derive(Debug, Clone, Default)]
pub struct RuntimeRegistry {
    inner: Arc<RwLock<HashMap<PipelineId, Arc<PipelineRuntime>>>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the record of `pipeline_id`, creating it in the initial status.
    pub fn get_or_create(&self, pipeline_id: PipelineId) -> Arc<PipelineRuntime> {
        if let Some(runtime) = self.get(pipeline_id) {
            return runtime;
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner
            .entry(pipeline_id)
            .or_insert_with(|| Arc::new(PipelineRuntime::new(pipeline_id)))
            .clone()
    }

    pub fn get(&self, pipeline_id: PipelineId) -> Option<Arc<PipelineRuntime>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pipeline_id)
            .cloned()
    }

    pub fn remove(&self, pipeline_id: PipelineId) -> Option<Arc<PipelineRuntime>> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pipeline_id)
    }

    /// Snapshots of every pipeline, ordered by id.
    pub fn snapshots(&self) -> Vec<RuntimeSnapshot> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut snapshots: Vec<_> = inner.values().map(|runtime| runtime.snapshot()).collect();
        snapshots.sort_by_key(|snapshot| snapshot.pipeline_id);

        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PipelineStatus;

    #[test]
    fn get_or_create_returns_the_same_record() {
        let registry = RuntimeRegistry::new();
        let first = registry.get_or_create(9);
        first.set_status(PipelineStatus::Running);

        let second = registry.get_or_create(9);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.status(), PipelineStatus::Running);
    }

    #[test]
    fn remove_and_snapshots() {
        let registry = RuntimeRegistry::new();
        registry.get_or_create(2);
        registry.get_or_create(1);

        let ids: Vec<_> = registry
            .snapshots()
            .into_iter()
            .map(|snapshot| snapshot.pipeline_id)
            .collect();
        assert_eq!(ids, vec![1, 2]);

        assert!(registry.remove(1).is_some());
        assert!(registry.get(1).is_none());
        assert_eq!(registry.snapshots().len(), 1);
    }
}
