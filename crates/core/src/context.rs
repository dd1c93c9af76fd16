use crate::lock::LockSync;
use crate::schema::{Catalog, MemoryCatalog, SessionId};
use crate::store::{KeyValueStore, MemoryStore};
use crate::tx::{Transaction, TxRegistry};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    Serializable,
}

/// Engine-level settings. A value of this struct is carried inside the
/// [`Context`] and threaded through every operation; there is no global
/// mutable engine state.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Multi-threaded mode: every table gets its own lock monitor. In
    /// single-threaded mode all tables share the database-wide monitor.
    pub multithreaded: bool,
    /// Row-level multi-versioning. When on, write operations take shared
    /// table locks and plain reads take none.
    pub mvcc: bool,
    pub isolation: IsolationLevel,
    /// NULL sort position in index keys.
    pub nulls_last: bool,
    /// Initial `next_analyze` threshold; `0` disables the analyze trigger.
    pub analyze_auto: u32,
    /// Sample size budget for one analyze pass; a pass reads a tenth of it.
    pub analyze_sample: u32,
    /// Row budget for index builds; the block-merge strategy fills blocks of
    /// half this size.
    pub max_memory_rows: usize,
    pub default_lock_timeout: Duration,
    /// Whether the backing store is treated as disk-backed (selects the
    /// block-merge build strategy).
    pub persistent: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            multithreaded: true,
            mvcc: false,
            isolation: IsolationLevel::ReadCommitted,
            nulls_last: false,
            analyze_auto: 2000,
            analyze_sample: 10000,
            max_memory_rows: 40000,
            default_lock_timeout: Duration::from_secs(2),
            persistent: false,
        }
    }
}

/// Progress callback for long-running index builds, keyed
/// `"<table>:<index>"` with `(current, total)` row counters.
pub type ProgressListener = dyn Fn(&str, u64, u64) + Send + Sync;

/// Shared handles threaded through all table operations: the backing store,
/// the schema catalog, the transaction registry, and the engine-wide
/// counters and synchronization points.
pub struct Context {
    pub settings: EngineSettings,
    pub store: Arc<dyn KeyValueStore>,
    pub catalog: Arc<dyn Catalog>,
    pub(crate) registry: Arc<TxRegistry>,
    /// The database-wide lock monitor, used by every table when
    /// `multithreaded` is off.
    pub(crate) db_sync: Arc<LockSync>,
    /// Serializes deadlock detections engine-wide; one walk at a time.
    pub(crate) deadlock_guard: Mutex<()>,
    modification_seq: AtomicU64,
    session_seq: AtomicU64,
    progress: RwLock<Option<Arc<ProgressListener>>>,
}

impl Context {
    pub fn new(settings: EngineSettings) -> Arc<Self> {
        let store = MemoryStore::new(settings.persistent);
        Self::with_store(settings, store, Arc::new(MemoryCatalog::new()))
    }

    pub fn with_store(
        settings: EngineSettings,
        store: Arc<dyn KeyValueStore>,
        catalog: Arc<dyn Catalog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            store,
            catalog,
            registry: TxRegistry::new(),
            db_sync: Arc::new(LockSync::default()),
            deadlock_guard: Mutex::new(()),
            modification_seq: AtomicU64::new(0),
            session_seq: AtomicU64::new(0),
            progress: RwLock::new(None),
        })
    }

    pub fn begin_transaction(&self) -> Arc<Transaction> {
        self.registry.begin()
    }

    /// Monotone data-modification counter shared by all tables.
    pub fn next_modification_id(&self) -> u64 {
        self.modification_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn next_session_id(&self) -> SessionId {
        SessionId(self.session_seq.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn set_progress_listener(&self, listener: Arc<ProgressListener>) {
        *self.progress.write() = Some(listener);
    }

    pub(crate) fn report_progress(&self, key: &str, current: u64, total: u64) {
        if let Some(listener) = self.progress.read().as_ref() {
            listener(key, current, total);
        }
    }
}
