use std::collections::HashMap;
use std::sync::Arc;

use mysql::types::BinlogPosition;
use tokio::sync::Mutex;

use crate::error::EtlResult;
use crate::store::base::PositionStore;
use crate::types::PipelineId;

#[derive(Debug, Default)]
struct Inner {
    positions: HashMap<PipelineId, BinlogPosition>,
    /// Every saved position in order, per pipeline.
    history: HashMap<PipelineId, Vec<BinlogPosition>>,
}

/// Positions kept in memory and lost on restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every position saved for `pipeline_id`, oldest first.
    pub async fn history(&self, pipeline_id: PipelineId) -> Vec<BinlogPosition> {
        let inner = self.inner.lock().await;

        inner.history.get(&pipeline_id).cloned().unwrap_or_default()
    }
}

impl PositionStore for MemoryStore {
    async fn load_position(&self, pipeline_id: PipelineId) -> EtlResult<Option<BinlogPosition>> {
        let inner = self.inner.lock().await;

        Ok(inner.positions.get(&pipeline_id).cloned())
    }

    async fn save_position(
        &self,
        pipeline_id: PipelineId,
        position: BinlogPosition,
    ) -> EtlResult<()> {
        let mut inner = self.inner.lock().await;

        inner
            .history
            .entry(pipeline_id)
            .or_default()
            .push(position.clone());
        inner.positions.insert(pipeline_id, position);

        Ok(())
    }

    async fn delete_position(&self, pipeline_id: PipelineId) -> EtlResult<()> {
        let mut inner = self.inner.lock().await;

        inner.positions.remove(&pipeline_id);
        inner.history.remove(&pipeline_id);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_load_and_delete() {
        let store = MemoryStore::new();
        assert_eq!(store.load_position(1).await.unwrap(), None);

        store
            .save_position(1, BinlogPosition::new("mysql-bin.000001", 4))
            .await
            .unwrap();
        store
            .save_position(1, BinlogPosition::new("mysql-bin.000001", 900))
            .await
            .unwrap();

        assert_eq!(
            store.load_position(1).await.unwrap(),
            Some(BinlogPosition::new("mysql-bin.000001", 900))
        );
        assert_eq!(store.history(1).await.len(), 2);
        assert_eq!(store.load_position(2).await.unwrap(), None);

        store.delete_position(1).await.unwrap();
        assert_eq!(store.load_position(1).await.unwrap(), None);
    }
}
