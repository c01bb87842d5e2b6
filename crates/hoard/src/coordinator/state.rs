use std::collections::{HashSet, VecDeque};

use super::task::ResourceTask;
use crate::handle::{DownloadProgress, Phase};
use crate::store::Progress;

/// Independent discovery channels of one download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Channel {
    Primary,
    Side,
}

/// Result of recording one task completion.
#[derive(Debug)]
pub(crate) struct Completion {
    /// Backlog task that now owns the freed worker slot.
    pub next: Option<ResourceTask>,
    /// Whether the root record's progress should be written now.
    pub checkpoint: bool,
}

/// Counters, backlog and phase of one download.
///
/// Owned by the aggregator task only; workers never touch it.
#[derive(Debug)]
pub(crate) struct DownloadState {
    concurrency: usize,
    checkpoint_interval: u64,
    phase: Phase,
    total: u64,
    completed: u64,
    failed: u64,
    in_flight: usize,
    backlog: VecDeque<ResourceTask>,
    seen: HashSet<String>,
    primary_done: bool,
    side_done: bool,
}

impl DownloadState {
    pub fn new(owner: &str, concurrency: usize, checkpoint_interval: u64) -> Self {
        Self {
            concurrency: concurrency.max(1),
            checkpoint_interval: checkpoint_interval.max(1),
            phase: Phase::Discovering,
            total: 0,
            completed: 0,
            failed: 0,
            in_flight: 0,
            backlog: VecDeque::new(),
            // The root record is written by the coordinator itself.
            seen: HashSet::from([owner.to_string()]),
            primary_done: false,
            side_done: false,
        }
    }

    /// Count a newly discovered resource.
    ///
    /// Returns the task if a worker slot is free; otherwise it is backlogged.
    /// Keys already seen in this run are ignored.
    pub fn enqueue(&mut self, task: ResourceTask) -> Option<ResourceTask> {
        if !self.seen.insert(task.key.clone()) {
            return None;
        }
        self.total += 1;
        if self.in_flight < self.concurrency {
            self.in_flight += 1;
            Some(task)
        } else {
            self.backlog.push_back(task);
            None
        }
    }

    /// Record that a started task ended, successfully or not.
    pub fn complete(&mut self, failed: bool) -> Completion {
        self.completed += 1;
        if failed {
            self.failed += 1;
        }
        self.in_flight = self.in_flight.saturating_sub(1);

        let next = self.backlog.pop_front();
        if next.is_some() {
            self.in_flight += 1;
        }

        Completion {
            next,
            checkpoint: self.is_finished() || self.completed % self.checkpoint_interval == 0,
        }
    }

    /// Mark a discovery channel as exhausted.
    ///
    /// Once both channels are done the backlog is ordered by playback offset.
    pub fn channel_done(&mut self, channel: Channel) {
        match channel {
            Channel::Primary => self.primary_done = true,
            Channel::Side => self.side_done = true,
        }
        if self.is_settled() && self.phase == Phase::Discovering {
            self.backlog
                .make_contiguous()
                .sort_by(|a, b| a.playback_offset.total_cmp(&b.playback_offset));
            self.phase = Phase::Downloading;
        }
    }

    /// Enter a phase the counters cannot reach on their own.
    ///
    /// `Finished` is only ever set here, after the final checkpoint has landed.
    pub fn stop(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub fn is_settled(&self) -> bool {
        self.primary_done && self.side_done
    }

    pub fn is_finished(&self) -> bool {
        self.is_settled() && self.completed == self.total
    }

    pub fn progress(&self) -> DownloadProgress {
        DownloadProgress {
            completed: self.completed,
            total: self.total,
            failed: self.failed,
            phase: self.phase,
        }
    }

    /// Progress as persisted on the root record.
    pub fn checkpoint(&self) -> Progress {
        Progress::new(self.completed, self.total, self.is_settled())
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    #[cfg(test)]
    pub fn backlog_keys(&self) -> Vec<&str> {
        self.backlog.iter().map(|t| t.key.as_str()).collect()
    }
}
