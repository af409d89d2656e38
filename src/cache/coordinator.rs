// Multi-writer coordination.
//
// When several writers share one container, metadata writes funnel through
// a designated writer while every rank keeps its own cache coherent. The
// coordinator tracks dirtied/cleaned/candidate address sets and dirty-byte
// growth; crossing the byte threshold schedules a sync point, at which the
// writer flushes enough to reach its clean watermark and the cohort absorbs
// the cleaned set.
//
// The transport is abstracted behind `CohortLink` so the engine composes
// with any collective layer; `LoopbackLink` is the single-process stand-in
// used by tests.

use crate::common::Addr;
use crate::error::{ErrorKind, Result};
use std::collections::BTreeSet;
use std::fmt::Debug;
use tracing::{debug, trace};

/// Enables extra collective-call sanity barriers around sync points.
pub const SANITY_BARRIER_ENV: &str = "COFFER_COLL_SANITY_BARRIERS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorStrategy {
    /// All metadata writes happen on rank 0.
    Rank0Only,
    /// Flush work is spread over the cohort from an agreed candidate set.
    Distributed,
}

/// Collective transport between cohort ranks.
pub trait CohortLink: Debug + Send {
    fn rank(&self) -> u32;

    fn cohort_size(&self) -> u32;

    /// Writer side: publish the addresses cleaned at this sync point.
    fn broadcast_cleaned(&mut self, addrs: &[Addr]) -> Result<()>;

    /// Follower side: receive the cleaned addresses for this sync point.
    fn collect_cleaned(&mut self) -> Result<Vec<Addr>>;

    /// All ranks: exchange candidate sets and return the agreed set.
    fn exchange_candidates(&mut self, local: &[Addr]) -> Result<Vec<Addr>>;

    fn barrier(&mut self) -> Result<()>;
}

/// Single-process loopback transport: one rank that talks to itself.
#[derive(Debug, Default)]
pub struct LoopbackLink {
    pending_cleaned: Vec<Addr>,
}

impl CohortLink for LoopbackLink {
    fn rank(&self) -> u32 {
        0
    }

    fn cohort_size(&self) -> u32 {
        1
    }

    fn broadcast_cleaned(&mut self, addrs: &[Addr]) -> Result<()> {
        self.pending_cleaned = addrs.to_vec();
        Ok(())
    }

    fn collect_cleaned(&mut self) -> Result<Vec<Addr>> {
        Ok(std::mem::take(&mut self.pending_cleaned))
    }

    fn exchange_candidates(&mut self, local: &[Addr]) -> Result<Vec<Addr>> {
        Ok(local.to_vec())
    }

    fn barrier(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The auxiliary record a multi-writer cache carries.
#[derive(Debug)]
pub struct Coordinator {
    strategy: CoordinatorStrategy,
    link: Box<dyn CohortLink>,
    dirty_bytes: usize,
    dirty_bytes_threshold: usize,
    dirtied: BTreeSet<Addr>,
    cleaned: BTreeSet<Addr>,
    candidates: BTreeSet<Addr>,
    sync_points: u64,
    sanity_barriers: bool,
}

impl Coordinator {
    pub fn new(
        strategy: CoordinatorStrategy,
        link: Box<dyn CohortLink>,
        dirty_bytes_threshold: usize,
    ) -> Self {
        let sanity_barriers = std::env::var_os(SANITY_BARRIER_ENV).is_some();
        Self {
            strategy,
            link,
            dirty_bytes: 0,
            dirty_bytes_threshold,
            dirtied: BTreeSet::new(),
            cleaned: BTreeSet::new(),
            candidates: BTreeSet::new(),
            sync_points: 0,
            sanity_barriers,
        }
    }

    pub fn strategy(&self) -> CoordinatorStrategy {
        self.strategy
    }

    pub fn rank(&self) -> u32 {
        self.link.rank()
    }

    pub fn cohort_size(&self) -> u32 {
        self.link.cohort_size()
    }

    /// Whether this rank may write metadata right now.
    pub fn can_write(&self) -> bool {
        match self.strategy {
            CoordinatorStrategy::Rank0Only => self.link.rank() == 0,
            CoordinatorStrategy::Distributed => true,
        }
    }

    pub fn dirty_bytes(&self) -> usize {
        self.dirty_bytes
    }

    pub fn sync_points(&self) -> u64 {
        self.sync_points
    }

    // ------------------------------------------------------------------
    // Byte accounting
    // ------------------------------------------------------------------

    pub fn log_inserted(&mut self, addr: Addr, size: usize) {
        self.dirtied.insert(addr);
        self.dirty_bytes += size;
        trace!(addr, size, total = self.dirty_bytes, "coordinator insert");
    }

    pub fn log_dirtied(&mut self, addr: Addr, size: usize) {
        if self.dirtied.insert(addr) {
            self.dirty_bytes += size;
        }
    }

    pub fn log_cleaned(&mut self, addr: Addr) {
        if self.dirtied.remove(&addr) {
            self.cleaned.insert(addr);
        }
    }

    pub fn log_moved(&mut self, old: Addr, new: Addr, size: usize) {
        if self.dirtied.remove(&old) {
            self.dirtied.insert(new);
        } else {
            self.log_dirtied(new, size);
        }
    }

    /// Resize accounting. Deliberately accrues the entry's size *before*
    /// the resize against the threshold, matching long-standing behavior
    /// that callers have come to depend on; see the pinning test before
    /// changing this.
    pub fn log_resized(&mut self, addr: Addr, old_size: usize, _new_size: usize) {
        if self.dirtied.insert(addr) {
            self.dirty_bytes += old_size;
        }
    }

    pub fn should_sync(&self) -> bool {
        self.dirty_bytes >= self.dirty_bytes_threshold
    }

    // ------------------------------------------------------------------
    // Sync points
    // ------------------------------------------------------------------

    /// Agree on the candidate set for this sync point. Every rank must
    /// arrive with the same dirtied set; disagreement is fatal.
    pub fn negotiate_candidates(&mut self) -> Result<Vec<Addr>> {
        if self.sanity_barriers {
            self.link.barrier()?;
        }
        let local: Vec<Addr> = self.dirtied.iter().copied().collect();
        let agreed = self.link.exchange_candidates(&local)?;
        let agreed_set: BTreeSet<Addr> = agreed.iter().copied().collect();
        if agreed_set != self.dirtied {
            return Err(ErrorKind::CoordinatorDesync(format!(
                "rank {} candidate set has {} entries, cohort agreed on {}",
                self.link.rank(),
                self.dirtied.len(),
                agreed_set.len()
            ))
            .into());
        }
        self.candidates = agreed_set;
        Ok(agreed)
    }

    /// Writer side: record what was flushed and publish it.
    pub fn complete_sync_writer(&mut self, flushed: &[Addr]) -> Result<()> {
        for addr in flushed {
            self.log_cleaned(*addr);
        }
        self.link.broadcast_cleaned(flushed)?;
        self.finish_sync(flushed.len());
        Ok(())
    }

    /// Follower side: absorb the cleaned set published by the writer.
    pub fn complete_sync_follower(&mut self) -> Result<Vec<Addr>> {
        let cleaned = self.link.collect_cleaned()?;
        for addr in &cleaned {
            self.log_cleaned(*addr);
        }
        self.finish_sync(cleaned.len());
        Ok(cleaned)
    }

    fn finish_sync(&mut self, cleaned: usize) {
        self.dirty_bytes = 0;
        self.cleaned.clear();
        self.candidates.clear();
        self.sync_points += 1;
        debug!(
            rank = self.link.rank(),
            cleaned,
            sync_points = self.sync_points,
            "sync point complete"
        );
        if self.sanity_barriers {
            let _ = self.link.barrier();
        }
    }
}
