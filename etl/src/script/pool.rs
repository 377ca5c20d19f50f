use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use mysql::types::TableName;

use crate::rule::RuleContext;
use crate::script::session::ScriptSession;

/// Interpreters used by bulk export workers, keyed by table and worker index.
///
/// The lock is held only while a session is looked up or created. A checked out session is
/// owned by its worker until it is returned with [`InterpreterPool::checkin`].
#[derive(Debug, Default)]
pub struct InterpreterPool {
    sessions: Mutex<HashMap<(TableName, usize), ScriptSession>>,
}

impl InterpreterPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session of `worker` for the context's table, creating it on first use.
    ///
    /// Returns [`None`] for declarative rules.
    pub fn checkout(&self, context: &RuleContext, worker: usize) -> Option<ScriptSession> {
        let script = context.script()?;

        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let session = sessions
            .remove(&(context.table_name().clone(), worker))
            .unwrap_or_else(|| script.session());

        Some(session)
    }

    pub fn checkin(&self, table: TableName, worker: usize, session: ScriptSession) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.insert((table, worker), session);
    }
}
