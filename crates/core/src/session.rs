use crate::context::Context;
use crate::lock::WaitFor;
use crate::schema::SessionId;
use crate::table::Table;
use crate::tx::Transaction;
use crate::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// One user connection's view of the engine.
///
/// A session lives across many statements. It carries the current
/// transaction (begun lazily, ended by [`Session::commit`] /
/// [`Session::rollback`]), the set of table locks it holds, its lock
/// timeout, and the wait-for slot that deadlock detection walks.
///
/// Sessions are owned by the connection layer; the lock manager only ever
/// holds weak references to them.
pub struct Session {
    id: SessionId,
    ctx: Arc<Context>,
    tx: Mutex<Option<Arc<Transaction>>>,
    lock_timeout: Mutex<Duration>,
    /// The table this session is currently waiting on, if any. Read and
    /// written under the owning table's lock monitor; cleared on every exit
    /// path from the acquire loop.
    pub(crate) wait_for: Mutex<Option<WaitFor>>,
    /// Tables locked by this session, in acquisition order.
    pub(crate) locks: Mutex<Vec<Arc<Table>>>,
}

impl Session {
    pub fn new(ctx: &Arc<Context>) -> Arc<Self> {
        Arc::new(Self {
            id: ctx.next_session_id(),
            ctx: ctx.clone(),
            tx: Mutex::new(None),
            lock_timeout: Mutex::new(ctx.settings.default_lock_timeout),
            wait_for: Mutex::new(None),
            locks: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// The current transaction, beginning one if none is open.
    pub fn transaction(&self) -> Arc<Transaction> {
        let mut slot = self.tx.lock();
        match &*slot {
            Some(tx) if tx.is_open() => tx.clone(),
            _ => {
                let tx = self.ctx.begin_transaction();
                *slot = Some(tx.clone());
                tx
            }
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        *self.lock_timeout.lock()
    }

    pub fn set_lock_timeout(&self, timeout: Duration) {
        *self.lock_timeout.lock() = timeout;
    }

    /// Commits the current transaction and releases all held table locks.
    pub fn commit(&self) -> Result<()> {
        if let Some(tx) = self.tx.lock().take() {
            tx.commit();
        }
        self.release_locks();
        Ok(())
    }

    /// Rolls the current transaction back and releases all held table locks.
    pub fn rollback(&self) -> Result<()> {
        if let Some(tx) = self.tx.lock().take() {
            tx.rollback();
        }
        self.release_locks();
        Ok(())
    }

    fn release_locks(&self) {
        let held = std::mem::take(&mut *self.locks.lock());
        for table in held.into_iter().rev() {
            table.commit(self);
        }
    }

    pub(crate) fn add_lock(&self, table: Arc<Table>) {
        let mut locks = self.locks.lock();
        if !locks.iter().any(|t| t.id() == table.id()) {
            locks.push(table);
        }
    }

    pub(crate) fn remove_lock(&self, table: &Table) {
        self.locks.lock().retain(|t| t.id() != table.id());
    }

    /// Names of the tables this session holds locks on, for deadlock and
    /// timeout diagnostics.
    pub(crate) fn held_lock_names(&self) -> Vec<String> {
        self.locks.lock().iter().map(|t| t.name().to_owned()).collect()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // A session abandoned mid-transaction must not keep tables locked.
        let held = std::mem::take(&mut *self.locks.lock());
        for table in held.into_iter().rev() {
            table.commit(self);
        }
    }
}
