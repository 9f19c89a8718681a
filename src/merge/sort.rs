//! K-way merge of sorted tables into one output table.
//!
//! Sources are ordered oldest first; when several sources carry the same
//! key, the newest source's row wins and the rest are discarded. A
//! tombstone is physically dropped from the output only when the merge
//! output would already be the oldest possible location for its key: no
//! back set was supplied, or the supplied back set provably holds no row
//! for the key. Otherwise the tombstone is retained so nothing older gets
//! resurrected.
//!
//! Cancellation is cooperative: an abort flag is polled between keys. An
//! aborted or failed merge leaves a partial output file behind; the
//! caller must discard it and never publish it.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::codec::DeleteCodec;
use crate::error::{Error, Result};
use crate::order::RowOrder;
use crate::table::sorted::{SortedTable, SortedTableIter, TableWriter};
use crate::table::TableSet;

/// How a merge run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// All sources drained; `rows` rows written.
    Complete { rows: u64 },
    /// The abort flag was observed; output is partial and must be
    /// discarded.
    Aborted,
}

struct Source {
    iter: SortedTableIter,
    head: Option<Vec<u8>>,
}

impl Source {
    fn advance(&mut self) -> Result<()> {
        self.head = match self.iter.next() {
            Some(Ok(row)) => Some(row),
            Some(Err(e)) => return Err(e),
            None => None,
        };
        Ok(())
    }
}

pub struct MergeSort {
    sources: Vec<Arc<SortedTable>>,
    order: Arc<dyn RowOrder>,
    delete_codec: Option<Arc<dyn DeleteCodec>>,
    back_set: Option<TableSet>,
    abort: Arc<AtomicBool>,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

impl MergeSort {
    /// `sources` oldest first; `back_set` is the stack of all older
    /// generations not participating, or `None` when the merge includes
    /// the oldest generation.
    pub fn new(
        sources: Vec<Arc<SortedTable>>,
        delete_codec: Option<Arc<dyn DeleteCodec>>,
        back_set: Option<TableSet>,
        abort: Arc<AtomicBool>,
    ) -> Result<Self> {
        if sources.len() < 2 {
            return Err(Error::InvalidState(format!(
                "merge needs at least 2 sources, got {}",
                sources.len()
            )));
        }
        let order = Arc::clone(sources[0].order());
        for source in &sources[1..] {
            if source.row_width() != sources[0].row_width()
                || !Arc::ptr_eq(source.order(), &order)
            {
                return Err(Error::Config(format!(
                    "merge source {} doesn't match the first source's layout",
                    source.id()
                )));
            }
        }
        Ok(Self {
            sources,
            order,
            delete_codec,
            back_set,
            abort,
            started_at: None,
            finished_at: None,
        })
    }

    /// Signals the merge to stop at the next key boundary.
    pub fn abort(&self) {
        self.abort.store(true, AtomicOrdering::SeqCst);
    }

    /// The source tables, oldest first.
    pub fn sources(&self) -> &[Arc<SortedTable>] {
        &self.sources
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.finished_at
    }

    pub fn time_taken(&self) -> Option<Duration> {
        Some(self.finished_at? - self.started_at?)
    }

    /// Runs the merge, streaming the surviving rows into `out` in
    /// ascending row order.
    pub fn merge_into(&mut self, out: &mut TableWriter) -> Result<MergeOutcome> {
        if self.started_at.is_some() {
            return Err(Error::InvalidState("merge already ran".to_string()));
        }
        self.started_at = Some(Instant::now());
        let outcome = self.run(out);
        self.finished_at = Some(Instant::now());
        outcome
    }

    fn run(&mut self, out: &mut TableWriter) -> Result<MergeOutcome> {
        let mut fronts = Vec::with_capacity(self.sources.len());
        for table in &self.sources {
            let mut source = Source {
                iter: SortedTableIter::new(Arc::clone(table)),
                head: None,
            };
            source.advance()?;
            fronts.push(source);
        }

        loop {
            if self.abort.load(AtomicOrdering::SeqCst) {
                return Ok(MergeOutcome::Aborted);
            }

            // Winner: smallest key; among equals the newest source.
            let mut winner: Option<usize> = None;
            for (index, source) in fronts.iter().enumerate() {
                let Some(head) = &source.head else { continue };
                winner = Some(match winner {
                    None => index,
                    Some(best) => {
                        // Safe: best always holds a head row.
                        let best_head = fronts[best].head.as_ref().unwrap();
                        match self.order.compare(head, best_head) {
                            Ordering::Less => index,
                            Ordering::Equal => index.max(best),
                            Ordering::Greater => best,
                        }
                    }
                });
            }
            let Some(winner) = winner else { break };
            let row = fronts[winner].head.take().unwrap();

            // Consume the winning key from every source carrying it.
            for source in fronts.iter_mut() {
                let matches = source
                    .head
                    .as_ref()
                    .is_some_and(|head| self.order.compare(head, &row) == Ordering::Equal);
                if matches {
                    source.head = None;
                }
                if source.head.is_none() {
                    source.advance()?;
                }
            }

            if self.droppable_tombstone(&row)? {
                continue;
            }
            out.append(&row)?;
        }

        Ok(MergeOutcome::Complete {
            rows: out.row_count(),
        })
    }

    /// Whether `row` is a tombstone that no older table could contradict.
    fn droppable_tombstone(&self, row: &[u8]) -> Result<bool> {
        let Some(codec) = &self.delete_codec else {
            return Ok(false);
        };
        if !codec.is_deleted(row) {
            return Ok(false);
        }
        match &self.back_set {
            None => Ok(true),
            Some(back_set) => Ok(back_set.raw_row(row)?.is_none()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MagicDeleteCodec;
    use crate::order::LexOrder;
    use std::path::Path;
    use tempfile::tempdir;

    fn row(key: u32, value: u32) -> Vec<u8> {
        let mut row = key.to_be_bytes().to_vec();
        row.extend_from_slice(&value.to_be_bytes());
        row
    }

    fn order() -> Arc<dyn RowOrder> {
        Arc::new(LexOrder::new(4))
    }

    fn table(
        path: &Path,
        order: &Arc<dyn RowOrder>,
        id: u64,
        rows: &[(u32, u32)],
    ) -> Arc<SortedTable> {
        let mut writer = TableWriter::create(path, 8).unwrap();
        for (k, v) in rows {
            writer.append(&row(*k, *v)).unwrap();
        }
        writer.finish().unwrap();
        Arc::new(SortedTable::open(path, 8, Arc::clone(order), id).unwrap())
    }

    fn run_merge(
        dir: &Path,
        sources: Vec<Arc<SortedTable>>,
        codec: Option<Arc<dyn DeleteCodec>>,
        back_set: Option<TableSet>,
    ) -> Result<Vec<Vec<u8>>> {
        let out_path = dir.join("out.stbl");
        let mut writer = TableWriter::create(&out_path, 8)?;
        let mut merge = MergeSort::new(
            sources,
            codec,
            back_set,
            Arc::new(AtomicBool::new(false)),
        )?;
        let outcome = merge.merge_into(&mut writer)?;
        assert!(matches!(outcome, MergeOutcome::Complete { .. }));
        assert!(merge.time_taken().is_some());
        writer.finish()?;

        let out = Arc::new(SortedTable::open(
            &out_path,
            8,
            Arc::clone(merge.sources[0].order()),
            99,
        )?);
        SortedTableIter::new(out).collect()
    }

    #[test]
    fn newest_source_shadows_older() -> Result<()> {
        let dir = tempdir().unwrap();
        let order = order();
        let old = table(
            &dir.path().join("T1.stbl"),
            &order,
            1,
            &[(1, 1), (3, 1), (5, 1)],
        );
        let mid = table(&dir.path().join("T2.stbl"), &order, 2, &[(3, 2), (7, 2)]);
        let new = table(&dir.path().join("T3.stbl"), &order, 3, &[(3, 3), (9, 3)]);

        let rows = run_merge(dir.path(), vec![old, mid, new], None, None)?;
        assert_eq!(
            rows,
            vec![row(1, 1), row(3, 3), row(5, 1), row(7, 2), row(9, 3)]
        );
        Ok(())
    }

    #[test]
    fn tombstone_dropped_without_back_set() -> Result<()> {
        let dir = tempdir().unwrap();
        let order = order();
        let codec: Arc<dyn DeleteCodec> = Arc::new(MagicDeleteCodec::u32(4, 0));

        let old = table(&dir.path().join("T1.stbl"), &order, 1, &[(1, 1), (2, 2)]);
        // Key 1 deleted (value 0 is the magic).
        let new = table(&dir.path().join("T2.stbl"), &order, 2, &[(1, 0)]);

        let rows = run_merge(dir.path(), vec![old, new], Some(codec), None)?;
        assert_eq!(rows, vec![row(2, 2)]);
        Ok(())
    }

    #[test]
    fn tombstone_retained_when_back_set_holds_key() -> Result<()> {
        let dir = tempdir().unwrap();
        let order = order();
        let codec: Arc<dyn DeleteCodec> = Arc::new(MagicDeleteCodec::u32(4, 0));

        let back = table(&dir.path().join("T0.stbl"), &order, 1, &[(1, 77)]);
        let back_set = TableSet::new(Arc::clone(&order), 8, vec![back], None, 1)?;

        let old = table(&dir.path().join("T1.stbl"), &order, 2, &[(2, 2)]);
        let new = table(&dir.path().join("T2.stbl"), &order, 3, &[(1, 0)]);

        let rows = run_merge(dir.path(), vec![old, new], Some(codec), Some(back_set))?;
        // The tombstone for key 1 survives: the back set still holds a
        // live row that it must keep shadowing.
        assert_eq!(rows, vec![row(1, 0), row(2, 2)]);
        Ok(())
    }

    #[test]
    fn tombstone_dropped_when_back_set_lacks_key() -> Result<()> {
        let dir = tempdir().unwrap();
        let order = order();
        let codec: Arc<dyn DeleteCodec> = Arc::new(MagicDeleteCodec::u32(4, 0));

        let back = table(&dir.path().join("T0.stbl"), &order, 1, &[(8, 8)]);
        let back_set = TableSet::new(Arc::clone(&order), 8, vec![back], None, 1)?;

        let old = table(&dir.path().join("T1.stbl"), &order, 2, &[(2, 2)]);
        let new = table(&dir.path().join("T2.stbl"), &order, 3, &[(1, 0)]);

        let rows = run_merge(dir.path(), vec![old, new], Some(codec), Some(back_set))?;
        assert_eq!(rows, vec![row(2, 2)]);
        Ok(())
    }

    #[test]
    fn sources_cancelling_to_nothing() -> Result<()> {
        let dir = tempdir().unwrap();
        let order = order();
        let codec: Arc<dyn DeleteCodec> = Arc::new(MagicDeleteCodec::u32(4, 0));

        let put = table(&dir.path().join("T1.stbl"), &order, 1, &[(5, 5)]);
        let del = table(&dir.path().join("T2.stbl"), &order, 2, &[(5, 0)]);

        let rows = run_merge(dir.path(), vec![put, del], Some(codec), None)?;
        assert!(rows.is_empty());
        Ok(())
    }

    #[test]
    fn abort_stops_early_without_publishing() -> Result<()> {
        let dir = tempdir().unwrap();
        let order = order();
        let a = table(&dir.path().join("T1.stbl"), &order, 1, &[(1, 1), (2, 1)]);
        let b = table(&dir.path().join("T2.stbl"), &order, 2, &[(3, 2), (4, 2)]);

        let abort = Arc::new(AtomicBool::new(true));
        let out_path = dir.path().join("out.stbl");
        let mut writer = TableWriter::create(&out_path, 8)?;
        let mut merge = MergeSort::new(vec![a, b], None, None, abort)?;

        assert_eq!(merge.merge_into(&mut writer)?, MergeOutcome::Aborted);
        writer.discard()?;
        assert!(!out_path.exists());
        Ok(())
    }

    #[test]
    fn rejects_single_source() {
        let dir = tempdir().unwrap();
        let order = order();
        let only = table(&dir.path().join("T1.stbl"), &order, 1, &[(1, 1)]);
        assert!(MergeSort::new(
            vec![only],
            None,
            None,
            Arc::new(AtomicBool::new(false))
        )
        .is_err());
    }
}
