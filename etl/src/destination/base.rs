use std::future::Future;

use crate::error::EtlResult;
use crate::rule::RuleContext;
use crate::script::ScriptSession;
use crate::types::RowEventRequest;

/// A system that receives transformed rows.
///
/// Every write commits the whole batch in one round-trip or fails as a whole: a single row that
/// cannot be encoded aborts the batch. Declarative and script rules must produce the same
/// destination-visible effect for the same logical change.
///
/// All methods take `&self`; implementations keep their client behind interior mutability so the
/// pipeline and the health monitor can share one instance.
pub trait Destination {
    /// Returns the name of the destination.
    fn name() -> &'static str;

    /// Establishes and health-checks the client. Calling it again replaces an existing client.
    fn connect(&self) -> impl Future<Output = EtlResult<()>> + Send;

    /// Lightweight liveness check used while the pipeline is faulted. Must not mutate state.
    fn ping(&self) -> impl Future<Output = EtlResult<()>> + Send;

    /// Releases held resources. Safe to call on a destination that never connected.
    fn close(&self) -> impl Future<Output = EtlResult<()>> + Send {
        async { Ok(()) }
    }

    /// Writes rows coming from the binlog stream. Requests may span several tables and are
    /// applied in order.
    fn write_rows(
        &self,
        requests: Vec<RowEventRequest>,
    ) -> impl Future<Output = EtlResult<()>> + Send;

    /// Writes one page of a bulk export and returns the number of rows applied.
    ///
    /// Script rules run through `session`, the interpreter owned by the calling export worker.
    fn write_batch(
        &self,
        context: &RuleContext,
        requests: Vec<RowEventRequest>,
        session: Option<&mut ScriptSession>,
    ) -> impl Future<Output = EtlResult<usize>> + Send;
}
