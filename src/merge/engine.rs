//! Background table merge engine.
//!
//! One logical worker waits for "fresh meat" (a new table appended to the
//! active set), asks the merge policy for an eligible run, merges it
//! outside any store lock against reference-held source tables, and hands
//! the result back through the narrow [`MergeContext`] interface for
//! atomic publication. Failures are logged and never crash the store: an
//! unpublished merge just leaves its sources live for a later attempt.
//!
//! Shutdown mirrors the worker's start: the abort flag stops an in-flight
//! merge at the next key boundary, the broadcast channel stops the loop,
//! and `close` joins the task.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

use crate::codec::DeleteCodec;
use crate::error::Result;
use crate::merge::policy::{select_candidate, MergePolicy};
use crate::merge::sort::{MergeOutcome, MergeSort};
use crate::table::sorted::{SortedTable, TableWriter};
use crate::table::TableSet;

/// The orchestrator surface the merge engine drives: allocate an id,
/// resolve its path, snapshot the live stack, publish a result.
pub(crate) trait MergeContext: Send + Sync + 'static {
    fn next_table_id(&self) -> Result<u64>;

    fn table_path(&self, table_id: u64) -> PathBuf;

    /// Reference-held snapshot of the active table set, or `None` once
    /// the store is closing.
    fn table_stack(&self) -> Option<Arc<TableSet>>;

    /// Publishes a completed merge: splice `result` in place of the
    /// contiguous `source_ids` run.
    fn tables_merged(&self, source_ids: &[u64], result: SortedTable) -> Result<()>;
}

/// Terminal and transient states of one merge run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Running,
    Succeeded,
    Aborted,
    Failed,
}

/// One merge operation: sources, output bookkeeping, and run state.
pub(crate) struct TableMerge {
    source_ids: Vec<u64>,
    generation: u32,
    out_id: u64,
    out_path: PathBuf,
    row_width: usize,
    state: RunState,
    sorter: MergeSort,
}

impl TableMerge {
    fn new(
        sources: Vec<Arc<SortedTable>>,
        delete_codec: Option<Arc<dyn DeleteCodec>>,
        back_set: Option<TableSet>,
        out_id: u64,
        out_path: PathBuf,
        generation: u32,
        abort: Arc<AtomicBool>,
    ) -> Result<Self> {
        let source_ids = sources.iter().map(|t| t.id()).collect();
        let row_width = sources[0].row_width();
        let sorter = MergeSort::new(sources, delete_codec, back_set, abort)?;
        Ok(Self {
            source_ids,
            generation,
            out_id,
            out_path,
            row_width,
            state: RunState::Init,
            sorter,
        })
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn source_ids(&self) -> &[u64] {
        &self.source_ids
    }

    /// Runs the merge. `Ok(None)` means the merge was aborted (or netted
    /// zero rows) and its output discarded; the partial file never
    /// survives an abort or a failure.
    fn run(&mut self) -> Result<Option<SortedTable>> {
        self.state = RunState::Running;
        let mut writer = match TableWriter::create(&self.out_path, self.row_width) {
            Ok(writer) => writer,
            Err(e) => {
                self.state = RunState::Failed;
                return Err(e);
            }
        };

        match self.sorter.merge_into(&mut writer) {
            Ok(MergeOutcome::Complete { rows: 0 }) => {
                // Sources cancelled out perfectly; nothing to publish.
                tracing::warn!(
                    sources = ?self.source_ids,
                    "discarding empty merge result"
                );
                writer.discard()?;
                self.state = RunState::Succeeded;
                Ok(None)
            }
            Ok(MergeOutcome::Complete { .. }) => {
                writer.finish()?;
                let order = Arc::clone(self.sorter.sources()[0].order());
                let table =
                    SortedTable::open(&self.out_path, self.row_width, order, self.out_id)?;
                self.state = RunState::Succeeded;
                Ok(Some(table))
            }
            Ok(MergeOutcome::Aborted) => {
                writer.discard()?;
                self.state = RunState::Aborted;
                Ok(None)
            }
            Err(e) => {
                let _ = writer.discard();
                self.state = RunState::Failed;
                Err(e)
            }
        }
    }
}

pub(crate) struct TableMergeEngine {
    fresh_meat: Arc<Notify>,
    shutdown_tx: broadcast::Sender<()>,
    abort: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TableMergeEngine {
    /// Spawns the worker. Must be called within a tokio runtime.
    pub fn start(
        ctx: Arc<dyn MergeContext>,
        policy: MergePolicy,
        delete_codec: Option<Arc<dyn DeleteCodec>>,
    ) -> Self {
        let fresh_meat = Arc::new(Notify::new());
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let abort = Arc::new(AtomicBool::new(false));

        let worker = {
            let fresh_meat = Arc::clone(&fresh_meat);
            let abort = Arc::clone(&abort);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = fresh_meat.notified() => {
                            run_merges(ctx.as_ref(), &policy, delete_codec.clone(), &abort);
                        }
                        _ = shutdown_rx.recv() => {
                            tracing::debug!("table merge engine shutting down");
                            break;
                        }
                    }
                }
            })
        };

        Self {
            fresh_meat,
            shutdown_tx,
            abort,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Wakes the worker: the active table set grew.
    pub fn notify_fresh_meat(&self) {
        self.fresh_meat.notify_one();
    }

    /// Stops the worker: aborts any in-flight merge at its next key
    /// boundary and joins the task. No merge runs after this returns.
    pub async fn close(&self) {
        self.abort.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for TableMergeEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            tracing::warn!("table merge engine dropped without close; aborting worker");
            handle.abort();
        }
    }
}

/// Drains merge work: keeps folding eligible runs until the policy finds
/// nothing more, the store closes, or the abort flag trips.
fn run_merges(
    ctx: &dyn MergeContext,
    policy: &MergePolicy,
    delete_codec: Option<Arc<dyn DeleteCodec>>,
    abort: &Arc<AtomicBool>,
) {
    loop {
        if abort.load(Ordering::SeqCst) {
            return;
        }
        let Some(stack) = ctx.table_stack() else { return };
        let sizes: Vec<u64> = stack.tables().iter().map(|t| t.byte_size()).collect();
        let Some(candidate) = select_candidate(&sizes, policy) else {
            return;
        };

        let sources = stack.tables()[candidate.start..candidate.start + candidate.count].to_vec();
        let back_set = if candidate.start > 0 {
            match TableSet::new(
                Arc::clone(stack.order()),
                stack.row_width(),
                stack.tables()[..candidate.start].to_vec(),
                None,
                stack.commit_id(),
            ) {
                Ok(set) => Some(set),
                Err(e) => {
                    tracing::error!(error = %e, "failed to assemble back set");
                    return;
                }
            }
        } else {
            None
        };

        let merge_result = (|| {
            let out_id = ctx.next_table_id()?;
            let out_path = ctx.table_path(out_id);
            let mut merge = TableMerge::new(
                sources,
                delete_codec.clone(),
                back_set,
                out_id,
                out_path,
                candidate.generation,
                Arc::clone(abort),
            )?;
            tracing::info!(
                sources = ?merge.source_ids(),
                out_table = merge.out_id,
                generation = merge.generation,
                "starting table merge"
            );
            let table = merge.run()?;
            Ok::<_, crate::error::Error>((merge, table))
        })();

        match merge_result {
            Ok((merge, Some(table))) => {
                let out_path = merge.out_path.clone();
                if let Err(e) = ctx.tables_merged(merge.source_ids(), table) {
                    tracing::error!(
                        sources = ?merge.source_ids(),
                        error = %e,
                        "merge result rejected; sources remain live"
                    );
                    let _ = std::fs::remove_file(&out_path);
                    return;
                }
                tracing::info!(
                    sources = ?merge.source_ids(),
                    out_table = merge.out_id,
                    elapsed_ms = merge.sorter.time_taken().map(|d| d.as_millis() as u64),
                    "table merge published"
                );
            }
            Ok((merge, None)) => {
                // Aborted, or an empty result that was never published.
                // Either way the stack is unchanged, so trying again now
                // would only re-select the same run; wait for fresh meat.
                if merge.state() == RunState::Aborted {
                    tracing::info!(sources = ?merge.source_ids(), "table merge aborted");
                }
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "table merge failed");
                return;
            }
        }
    }
}
