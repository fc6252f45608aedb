//! Transactions.
//!
//! A transaction bumps the xid, so that every node it touches is copied to a fresh block
//! before modification while the last committed state stays intact on disk. Commit queues
//! the blocks released along the way, returns old enough queued blocks to the bitmap, and
//! writes the space manager and the superblock. Abort restores the state captured at start.

use apfs_core::key::{pair_key, Key};
use apfs_core::records::build_fq_value;
use tracing::{debug, warn};

use crate::btree::{Query, QueryFlags};
use crate::container::Container;
use crate::error::{Error, Result};
use crate::metrics::Metric;
use crate::spaceman::{FreeQueueEntry, FreeQueueTotals, SFQ_MAIN};

impl Container {
    /// Opens a transaction. Only one may be open at a time.
    pub fn transaction_start(&mut self) -> Result<()> {
        if self.snapshot.is_some() {
            return Err(Error::InvalidArgument(
                "a transaction is already open".into(),
            ));
        }
        self.snapshot = Some(self.state.clone());
        self.inode_undo.clear();
        self.state.xid += 1;
        debug!(xid = self.state.xid, "transaction started");
        Ok(())
    }

    /// Makes the open transaction durable. On failure the transaction is aborted.
    pub fn transaction_commit(&mut self) -> Result<()> {
        self.require_transaction()?;
        let metrics = self.metrics.clone();
        let _timer = metrics.record(Metric::CommitTime);

        match self.flush() {
            Ok(()) => {
                self.snapshot = None;
                self.inode_undo.clear();
                debug!(xid = self.state.xid, "transaction committed");
                Ok(())
            }
            Err(err) => {
                warn!(xid = self.state.xid, %err, "commit failed");
                self.transaction_abort();
                Err(err)
            }
        }
    }

    /// Discards the open transaction. Does nothing if none is open.
    pub fn transaction_abort(&mut self) {
        let Some(state) = self.snapshot.take() else {
            return;
        };
        debug!(xid = self.state.xid, "transaction aborted");
        self.state = state;
        self.undo_inode_cache();
        // Blocks written by the aborted transaction may be handed out again.
        self.clear_node_cache();
    }

    /// Runs `f` in a transaction of its own, committing on success and aborting on failure.
    pub fn transaction<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.transaction_start()?;
        let out = match f(self) {
            Ok(out) => out,
            Err(err) => {
                self.transaction_abort();
                return Err(err);
            }
        };
        self.transaction_commit()?;
        Ok(out)
    }

    fn flush(&mut self) -> Result<()> {
        self.reclaim()?;
        self.flush_pending_frees()?;
        self.write_spaceman()?;
        self.write_superblock()?;
        self.sync()
    }

    /// Main free queue entries old enough to be reused, in key order.
    fn reclaimable(&self, limit: u64) -> Result<Vec<FreeQueueEntry>> {
        let fq = &self.state.spaceman.fq[SFQ_MAIN];
        let mut totals = FreeQueueTotals::default();
        let mut entries = Vec::new();
        let mut query = Query::new(Key::default(), QueryFlags::default());
        let mut more = query.first(&fq.tree, self)?;
        while more {
            let entry = self.state.spaceman.parse_free_queue_record(
                query.current_key(),
                query.current_value(),
                &mut totals,
            )?;
            // Keys sort by xid first.
            if entry.xid > limit {
                break;
            }
            entries.push(entry);
            more = query.step(&fq.tree, self)?;
        }
        Ok(entries)
    }

    /// Returns to the bitmap the queued blocks freed at least `reclaim_delay` transactions
    /// ago.
    fn reclaim(&mut self) -> Result<()> {
        let xid = self.state.xid;
        let Some(limit) = xid.checked_sub(self.reclaim_delay.max(1)) else {
            return Ok(());
        };
        let entries = self.reclaimable(limit)?;
        if entries.is_empty() {
            return Ok(());
        }

        let mut fq = self.state.spaceman.fq[SFQ_MAIN].clone();
        let mut blocks = 0;
        for entry in &entries {
            fq.tree
                .remove(self, &Key::free_queue(entry.xid, entry.paddr))?;
            for bno in entry.paddr..entry.paddr + entry.count {
                self.state.spaceman.free_now(bno)?;
            }
            fq.count = fq.count.checked_sub(entry.count).ok_or_else(|| {
                Error::corrupted("free queue holds more blocks than its count")
            })?;
            blocks += entry.count;
        }

        let mut query = Query::new(Key::default(), QueryFlags::default());
        fq.oldest_xid = if query.first(&fq.tree, self)? {
            let mut totals = FreeQueueTotals::default();
            self.state
                .spaceman
                .parse_free_queue_record(query.current_key(), query.current_value(), &mut totals)?
                .xid
        } else {
            0
        };
        self.state.spaceman.fq[SFQ_MAIN] = fq;

        self.metrics.count_n(Metric::BlocksReclaimed, blocks);
        debug!(xid, blocks, entries = entries.len(), "reclaimed free queue entries");
        Ok(())
    }

    /// Queues the blocks released during the transaction. Updating the free queue may
    /// release more blocks, so this runs until nothing is left.
    fn flush_pending_frees(&mut self) -> Result<()> {
        let xid = self.state.xid;
        while !self.state.pending_frees.is_empty() {
            let batch = std::mem::take(&mut self.state.pending_frees);
            let mut fq = self.state.spaceman.fq[SFQ_MAIN].clone();
            for bno in batch {
                fq.tree.insert(self, &pair_key(xid, bno), &build_fq_value(1))?;
                fq.count += 1;
                if fq.oldest_xid == 0 {
                    fq.oldest_xid = xid;
                }
            }
            self.state.spaceman.fq[SFQ_MAIN] = fq;
        }
        Ok(())
    }
}
