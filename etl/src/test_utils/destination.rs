use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::destination::Destination;
use crate::destination::memory::MemoryDestination;
use crate::error::{ErrorKind, EtlResult};
use crate::rule::RuleContext;
use crate::script::ScriptSession;
use crate::types::RowEventRequest;
use crate::{bail, etl_error};

#[derive(Debug, Default)]
struct Switches {
    failing: AtomicBool,
    pings: AtomicUsize,
    failed_writes: AtomicUsize,
}

/// Wraps a destination so it can be taken down and brought back.
///
/// While failing, writes and pings return [`ErrorKind::DestinationConnectionFailed`] and reach
/// nothing.
#[derive(Debug, Clone)]
pub struct FlakyDestination<D = MemoryDestination> {
    inner: D,
    switches: Arc<Switches>,
}

impl<D> FlakyDestination<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            switches: Arc::new(Switches::default()),
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn set_failing(&self, failing: bool) {
        self.switches.failing.store(failing, Ordering::SeqCst);
    }

    pub fn is_failing(&self) -> bool {
        self.switches.failing.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.switches.pings.load(Ordering::SeqCst)
    }

    pub fn failed_writes(&self) -> usize {
        self.switches.failed_writes.load(Ordering::SeqCst)
    }

    fn check_write(&self) -> EtlResult<()> {
        if self.is_failing() {
            self.switches.failed_writes.fetch_add(1, Ordering::SeqCst);
            bail!(
                ErrorKind::DestinationConnectionFailed,
                "Destination is unreachable"
            );
        }

        Ok(())
    }
}

impl<D> Destination for FlakyDestination<D>
where
    D: Destination + Send + Sync,
{
    fn name() -> &'static str {
        "flaky"
    }

    async fn connect(&self) -> EtlResult<()> {
        if self.is_failing() {
            return Err(etl_error!(
                ErrorKind::DestinationConnectionFailed,
                "Destination refused the connection"
            ));
        }

        self.inner.connect().await
    }

    async fn ping(&self) -> EtlResult<()> {
        self.switches.pings.fetch_add(1, Ordering::SeqCst);
        if self.is_failing() {
            return Err(etl_error!(
                ErrorKind::DestinationConnectionFailed,
                "Destination did not answer the ping"
            ));
        }

        self.inner.ping().await
    }

    async fn close(&self) -> EtlResult<()> {
        self.inner.close().await
    }

    async fn write_rows(&self, requests: Vec<RowEventRequest>) -> EtlResult<()> {
        self.check_write()?;
        self.inner.write_rows(requests).await
    }

    async fn write_batch(
        &self,
        context: &RuleContext,
        requests: Vec<RowEventRequest>,
        session: Option<&mut ScriptSession>,
    ) -> EtlResult<usize> {
        self.check_write()?;
        self.inner.write_batch(context, requests, session).await
    }
}
