//! Merge eligibility policy.
//!
//! Tables are binned into size generations: generation 0 holds tables no
//! larger than a few write-ahead flushes, each following generation holds
//! tables up to `generation_factor` times larger. A contiguous run of
//! same-generation tables becomes a merge candidate once it is long
//! enough. Younger generations are preferred since they are the most
//! numerous and the cheapest to fold, mirroring the usual
//! smallest-tables-first tiering.

use itertools::Itertools;

/// Thresholds governing when the write-ahead buffer flushes and which
/// table runs are eligible for compaction. Exact values are tuning, not
/// algorithm; the defaults favor small test-friendly stores.
#[derive(Debug, Clone)]
pub struct MergePolicy {
    /// Write-ahead buffer size (bytes) that triggers a flush.
    pub write_ahead_flush_trigger: u64,

    /// Minimum run length before a same-generation run is merged.
    pub min_tables_in_merge: usize,

    /// Upper bound on how many tables one merge consumes.
    pub max_tables_in_merge: usize,

    /// Size multiplier between successive generations.
    pub generation_factor: u64,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            write_ahead_flush_trigger: 1024 * 1024,
            min_tables_in_merge: 4,
            max_tables_in_merge: 16,
            generation_factor: 4,
        }
    }
}

impl MergePolicy {
    /// Set the write-ahead flush trigger (bytes).
    pub fn write_ahead_flush_trigger(mut self, bytes: u64) -> Self {
        self.write_ahead_flush_trigger = bytes;
        self
    }

    /// Set the minimum number of tables per merge.
    pub fn min_tables_in_merge(mut self, count: usize) -> Self {
        self.min_tables_in_merge = count;
        self
    }

    /// Set the maximum number of tables per merge.
    pub fn max_tables_in_merge(mut self, count: usize) -> Self {
        self.max_tables_in_merge = count;
        self
    }

    /// Set the size multiplier between generations.
    pub fn generation_factor(mut self, factor: u64) -> Self {
        self.generation_factor = factor;
        self
    }

    /// Generation of a table of `size` bytes. Generation `g` admits sizes
    /// up to `flush_trigger * factor^(g+1)`.
    pub fn generation(&self, size: u64) -> u32 {
        let mut ceiling = self
            .write_ahead_flush_trigger
            .saturating_mul(self.generation_factor)
            .max(1);
        let mut generation = 0;
        while size > ceiling {
            generation += 1;
            ceiling = ceiling.saturating_mul(self.generation_factor);
        }
        generation
    }
}

/// A contiguous run of tables selected for one merge, by position in the
/// oldest-first table stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeCandidate {
    pub start: usize,
    pub count: usize,
    pub generation: u32,
}

/// Picks the next run to compact from the oldest-first table sizes, or
/// `None` when nothing is eligible.
///
/// Runs of same-generation neighbors shorter than `min_tables_in_merge`
/// are skipped; among eligible runs the youngest generation wins, ties
/// going to the run nearest the newest end of the stack. A run longer
/// than `max_tables_in_merge` is truncated at its oldest end so the merge
/// output lands where the run began.
pub(crate) fn select_candidate(sizes: &[u64], policy: &MergePolicy) -> Option<MergeCandidate> {
    let min_run = policy.min_tables_in_merge.max(2);

    let mut best: Option<MergeCandidate> = None;
    let mut start = 0;
    for (generation, run) in &sizes.iter().chunk_by(|size| policy.generation(**size)) {
        let count = run.count();
        if count >= min_run {
            let better = match &best {
                None => true,
                Some(b) => generation <= b.generation,
            };
            if better {
                best = Some(MergeCandidate {
                    start,
                    count: count.min(policy.max_tables_in_merge.max(2)),
                    generation,
                });
            }
        }
        start += count;
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> MergePolicy {
        MergePolicy::default()
            .write_ahead_flush_trigger(100)
            .min_tables_in_merge(3)
            .max_tables_in_merge(8)
            .generation_factor(4)
    }

    #[test]
    fn generations_grow_by_factor() {
        let p = policy();
        assert_eq!(p.generation(100), 0);
        assert_eq!(p.generation(400), 0);
        assert_eq!(p.generation(401), 1);
        assert_eq!(p.generation(1600), 1);
        assert_eq!(p.generation(1601), 2);
    }

    #[test]
    fn no_candidate_below_min_run() {
        let p = policy();
        assert_eq!(select_candidate(&[], &p), None);
        assert_eq!(select_candidate(&[100, 100], &p), None);
        // Runs broken up by a bigger table don't combine.
        assert_eq!(select_candidate(&[100, 100, 5000, 100, 100], &p), None);
    }

    #[test]
    fn picks_young_run() {
        let p = policy();
        let candidate = select_candidate(&[5000, 100, 100, 100], &p).unwrap();
        assert_eq!(candidate.start, 1);
        assert_eq!(candidate.count, 3);
        assert_eq!(candidate.generation, 0);
    }

    #[test]
    fn prefers_youngest_generation() {
        let p = policy();
        // Three old generation-2 tables, then three fresh ones.
        let sizes = [2000, 2000, 2000, 100, 100, 100];
        let candidate = select_candidate(&sizes, &p).unwrap();
        assert_eq!(candidate.start, 3);
        assert_eq!(candidate.generation, 0);
    }

    #[test]
    fn truncates_long_runs() {
        let p = policy();
        let sizes = vec![100u64; 12];
        let candidate = select_candidate(&sizes, &p).unwrap();
        assert_eq!(candidate.start, 0);
        assert_eq!(candidate.count, 8);
    }
}
