use super::{PrimaryIndex, TableIndex};
use crate::context::Context;
use crate::error::{DbError, IndexError};
use crate::row::{Row, SearchKey, Value};
use crate::session::Session;
use crate::store::MapValue;
use crate::Result;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// Populates a freshly created index from the table's scan index.
///
/// Memory-backed tables (and the in-memory hash indexes) go through the
/// buffered strategy; disk-backed secondary indexes go through the external
/// block merge so the build never holds more than the configured row budget
/// in memory. Progress is reported as `"<table>:<index>"`.
pub(crate) fn rebuild_index(
    ctx: &Context,
    session: &Session,
    table_name: &str,
    scan: &Arc<PrimaryIndex>,
    target: &TableIndex,
) -> Result<()> {
    let total = scan.row_count_approximation();
    let progress_key = format!("{table_name}:{}", target.name());
    log::trace!("INDEX REBUILDING: {progress_key}, {total} rows");

    let block_merge = matches!(target, TableIndex::Secondary(_)) && ctx.store.is_persistent();
    if block_merge {
        rebuild_block_merge(ctx, session, scan, target, &progress_key, total)?;
    } else {
        rebuild_buffered(ctx, session, scan, target, &progress_key, total)?;
    }
    target.mark_built();
    log::trace!("INDEX REBUILT: {progress_key}");
    Ok(())
}

/// Reads the scan in chunks of `max_memory_rows`, sorts each chunk by the
/// new index's row order, and inserts in order.
fn rebuild_buffered(
    ctx: &Context,
    session: &Session,
    scan: &Arc<PrimaryIndex>,
    target: &TableIndex,
    progress_key: &str,
    total: u64,
) -> Result<()> {
    let max = ctx.settings.max_memory_rows.max(1);
    let mut cursor = scan.find(session, None, None)?;
    let mut buffer: Vec<(SearchKey, Row)> = Vec::new();
    let mut added = 0u64;
    while cursor.next()? {
        let Some(row) = cursor.get() else { break };
        buffer.push((target.key_of(row)?, row.clone()));
        if buffer.len() >= max {
            flush_sorted(ctx, session, target, &mut buffer, progress_key, &mut added, total)?;
        }
    }
    flush_sorted(ctx, session, target, &mut buffer, progress_key, &mut added, total)
}

fn flush_sorted(
    ctx: &Context,
    session: &Session,
    target: &TableIndex,
    buffer: &mut Vec<(SearchKey, Row)>,
    progress_key: &str,
    added: &mut u64,
    total: u64,
) -> Result<()> {
    buffer.sort_by(|a, b| a.0.cmp(&b.0));
    for (_, row) in buffer.drain(..) {
        target.add(session, &row)?;
        *added += 1;
        ctx.report_progress(progress_key, *added, total);
    }
    Ok(())
}

struct MergeEntry {
    key: SearchKey,
    row: Row,
    src: usize,
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for MergeEntry {}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap, the merge needs the minimum.
        self.key.cmp(&other.key).then(self.src.cmp(&other.src)).reverse()
    }
}

/// External block merge: stream the scan into sorted blocks of
/// `max_memory_rows / 2` rows, each written to a freshly allocated
/// temporary map, then merge all blocks into the target index. Duplicates
/// are detected during the merge so unique violations surface promptly.
/// Temporary maps are removed on every exit path.
fn rebuild_block_merge(
    ctx: &Context,
    session: &Session,
    scan: &Arc<PrimaryIndex>,
    target: &TableIndex,
    progress_key: &str,
    total: u64,
) -> Result<()> {
    let store = ctx.store.clone();
    let block_size = (ctx.settings.max_memory_rows / 2).max(1);
    let tx = session.transaction();

    let mut blocks = scopeguard::guard(Vec::<String>::new(), |names| {
        for name in names {
            if let Err(err) = store.remove_map(&name) {
                log::warn!("failed to remove temporary map `{name}`: {err}");
            }
        }
    });

    let mut cursor = scan.find(session, None, None)?;
    let mut buffer: Vec<(SearchKey, Row)> = Vec::new();
    loop {
        let more = cursor.next()?;
        if more {
            let Some(row) = cursor.get() else { break };
            buffer.push((target.key_of(row)?, row.clone()));
        }
        if (!more && !buffer.is_empty()) || buffer.len() >= block_size {
            buffer.sort_by(|a, b| a.0.cmp(&b.0));
            let name = ctx.store.next_temporary_map_name();
            let block = ctx.store.open_map(&name);
            for (key, row) in buffer.drain(..) {
                block.put(&tx, key, MapValue::Row(row))?;
            }
            blocks.push(name);
        }
        if !more {
            break;
        }
    }

    // Multi-way merge over the sorted blocks.
    let mut sources: Vec<_> = blocks
        .iter()
        .map(|name| ctx.store.open_map(name).range(None, None).into_iter())
        .collect();
    let mut heap = BinaryHeap::new();
    for (src, source) in sources.iter_mut().enumerate() {
        if let Some((key, value)) = source.next() {
            heap.push(MergeEntry {
                key,
                row: expect_row(value, target)?,
                src,
            });
        }
    }

    let unique_cols = target.schema().cols.len();
    let mut previous_key: Option<Vec<Value>> = None;
    let mut added = 0u64;
    while let Some(entry) = heap.pop() {
        if target.is_unique() {
            let prefix: Vec<Value> = entry.key.values()[..unique_cols].to_vec();
            if !prefix.iter().any(Value::is_null) && previous_key.as_ref() == Some(&prefix) {
                let value = prefix.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
                return Err(IndexError::UniqueConstraintViolation {
                    index_name: target.name().to_owned(),
                    table_name: progress_key.split(':').next().unwrap_or_default().to_owned(),
                    value,
                }
                .into());
            }
            previous_key = Some(prefix);
        }
        target.add(session, &entry.row)?;
        added += 1;
        ctx.report_progress(progress_key, added, total);
        if let Some((key, value)) = sources[entry.src].next() {
            heap.push(MergeEntry {
                key,
                row: expect_row(value, target)?,
                src: entry.src,
            });
        }
    }
    Ok(())
}

fn expect_row(value: MapValue, target: &TableIndex) -> Result<Row> {
    match value {
        MapValue::Row(row) => Ok(row),
        MapValue::RowId(_) => Err(DbError::Internal(format!(
            "temporary block for `{}` holds a bare row id",
            target.name()
        ))),
    }
}
