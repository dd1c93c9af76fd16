use crate::error::TxError;
use crate::Result;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A transaction marker: the undo-log position at the time it was taken.
/// Rolling back to a savepoint undoes everything logged after it without
/// aborting the whole transaction.
#[derive(Debug, Clone, Copy)]
pub struct Savepoint(usize);

type UndoOp = Box<dyn FnOnce() + Send>;

/// The session's current transaction.
///
/// Mutating operations on maps and in-memory indexes log inverse operations
/// here; a statement-level failure rolls the log back to the statement's
/// savepoint. The table core never opens its own transaction - it borrows
/// the session's.
pub struct Transaction {
    id: u64,
    open: AtomicBool,
    undo: Mutex<Vec<UndoOp>>,
    registry: Arc<TxRegistry>,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Fails with [`TxError::Closed`]; cursors call this on every step so
    /// iteration cannot outlive its transaction.
    pub fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TxError::Closed.into())
        }
    }

    pub fn set_savepoint(&self) -> Savepoint {
        Savepoint(self.undo.lock().len())
    }

    pub fn rollback_to_savepoint(&self, savepoint: Savepoint) -> Result<()> {
        self.ensure_open()?;
        let ops = {
            let mut undo = self.undo.lock();
            let at = savepoint.0.min(undo.len());
            undo.split_off(at)
        };
        // Inverse operations run newest-first, outside the log lock: they
        // touch map and index state guarded by their own locks.
        for op in ops.into_iter().rev() {
            op();
        }
        Ok(())
    }

    /// Records the inverse of a mutation that has already been applied.
    pub(crate) fn log_undo(&self, op: UndoOp) {
        self.undo.lock().push(op);
    }

    pub fn commit(&self) {
        self.undo.lock().clear();
        self.close();
    }

    pub fn rollback(&self) {
        let ops = std::mem::take(&mut *self.undo.lock());
        for op in ops.into_iter().rev() {
            op();
        }
        self.close();
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.registry.close(self.id);
    }
}

/// Registry of open transaction ids.
///
/// Unique-constraint clashes consult it to classify a conflict: a clashing
/// entry whose writer is still open (and is another transaction) surfaces as
/// `ConcurrentUpdate` rather than `DuplicateKey`.
#[derive(Default)]
pub struct TxRegistry {
    next_id: AtomicU64,
    open: Mutex<HashSet<u64>>,
}

impl TxRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn begin(self: &Arc<Self>) -> Arc<Transaction> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.open.lock().insert(id);
        Arc::new(Transaction {
            id,
            open: AtomicBool::new(true),
            undo: Mutex::new(Vec::new()),
            registry: self.clone(),
        })
    }

    pub fn is_open(&self, id: u64) -> bool {
        self.open.lock().contains(&id)
    }

    /// True iff `writer` is an uncommitted write of a transaction other than
    /// `me`.
    pub(crate) fn is_concurrent(&self, writer: u64, me: u64) -> bool {
        writer != me && self.is_open(writer)
    }

    fn close(&self, id: u64) {
        self.open.lock().remove(&id);
    }
}
