use std::future::Future;

use mysql::types::BinlogPosition;

use crate::error::EtlResult;
use crate::types::PipelineId;

/// Storage of the last acknowledged binlog position of each pipeline.
///
/// Implementations must make a successful [`PositionStore::save_position`] durable before
/// returning, since the flush loop treats it as the commit point of everything written before.
pub trait PositionStore {
    /// Returns the stored position, or [`None`] when the pipeline never saved one.
    fn load_position(
        &self,
        pipeline_id: PipelineId,
    ) -> impl Future<Output = EtlResult<Option<BinlogPosition>>> + Send;

    fn save_position(
        &self,
        pipeline_id: PipelineId,
        position: BinlogPosition,
    ) -> impl Future<Output = EtlResult<()>> + Send;

    /// Forgets the position, so the next start replays from the start of the log.
    fn delete_position(&self, pipeline_id: PipelineId)
    -> impl Future<Output = EtlResult<()>> + Send;
}
