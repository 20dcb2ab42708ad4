//! Job queues, concurrency budget and the header distribution pass.

use super::assignments::ReleasedJobs;
use super::peers::Candidate;
use super::throughput::ThroughputEstimator;
use super::types::DownloadJob;
use crate::chain::{BlockHeader, ChainState};
use alloy_primitives::B256;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashSet, VecDeque};

/// A header the pass decided to give to `candidates[peer_index]`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PlannedAssignment {
    pub(crate) job_id: u64,
    pub(crate) peer_index: usize,
    pub(crate) header: BlockHeader,
}

#[derive(Debug, Default)]
pub(crate) struct AssignmentPlan {
    pub(crate) assigned: Vec<PlannedAssignment>,
    /// Headers no known peer claims; terminal for the caller.
    pub(crate) failed: Vec<B256>,
    pub(crate) reassigned: usize,
    /// Ordinary work was skipped because too few slots were free.
    pub(crate) deferred: bool,
}

/// Queue/budget/throughput domain.
#[derive(Debug)]
pub(crate) struct QueueState {
    ordinary: VecDeque<DownloadJob>,
    reassign: VecDeque<DownloadJob>,
    /// Every header currently waiting in either queue.
    queued: HashSet<B256>,
    pub(crate) throughput: ThroughputEstimator,
    rng: StdRng,
}

impl QueueState {
    pub(crate) fn new(throughput: ThroughputEstimator, rng_seed: Option<u64>) -> Self {
        let rng = match rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            ordinary: VecDeque::new(),
            reassign: VecDeque::new(),
            queued: HashSet::new(),
            throughput,
            rng,
        }
    }

    /// Queues `job`, skipping headers already waiting in either queue.
    /// Returns how many headers were queued.
    pub(crate) fn enqueue(&mut self, mut job: DownloadJob, high_priority: bool) -> usize {
        let queued = &mut self.queued;
        job.headers.retain(|header| queued.insert(header.hash));
        let count = job.headers.len();
        if count == 0 {
            return 0;
        }
        if high_priority {
            self.reassign.push_back(job);
        } else {
            self.ordinary.push_back(job);
        }
        count
    }

    /// Queues released work for priority reassignment; returns the header count.
    pub(crate) fn enqueue_released(&mut self, released: ReleasedJobs) -> usize {
        released
            .into_iter()
            .map(|(job_id, headers)| self.enqueue(DownloadJob::new(job_id, headers), true))
            .sum()
    }

    pub(crate) fn pending_headers(&self) -> usize {
        self.ordinary
            .iter()
            .chain(self.reassign.iter())
            .map(|job| job.headers.len())
            .sum()
    }

    pub(crate) fn clear(&mut self) {
        self.ordinary.clear();
        self.reassign.clear();
        self.queued.clear();
    }

    /// One distribution pass.
    ///
    /// The reassignment queue is drained completely regardless of budget.
    /// Ordinary jobs are only served when at least `threshold` of the budget
    /// is free, and then only up to the slots the reassigned work left over.
    pub(crate) fn plan_assignments(
        &mut self,
        in_flight: usize,
        threshold: f64,
        candidates: &[Candidate],
        chain: &dyn ChainState,
    ) -> AssignmentPlan {
        let mut plan = AssignmentPlan::default();
        let max_concurrent = self.throughput.max_concurrent();
        let empty_slots = max_concurrent.saturating_sub(in_flight);

        distribute(&mut self.reassign, usize::MAX, candidates, chain, &mut self.rng, &mut plan);
        plan.reassigned = plan.assigned.len();
        self.forget_planned(&plan);

        let min_free = ((max_concurrent as f64 * threshold).ceil() as usize).max(1);
        if empty_slots < min_free {
            plan.deferred = !self.ordinary.is_empty();
            return plan;
        }
        let remaining = empty_slots.saturating_sub(plan.reassigned);
        if remaining > 0 {
            distribute(&mut self.ordinary, remaining, candidates, chain, &mut self.rng, &mut plan);
            self.forget_planned(&plan);
        }
        plan
    }

    /// Headers that left the queues in this pass may be queued again.
    fn forget_planned(&mut self, plan: &AssignmentPlan) {
        for planned in &plan.assigned {
            self.queued.remove(&planned.header.hash);
        }
        for hash in &plan.failed {
            self.queued.remove(hash);
        }
    }
}

/// Consumes headers from the front of `queue` until `limit` assignments were
/// made or the queue is empty. The first header nobody claims fails together
/// with everything behind it in the same job.
fn distribute<R: Rng>(
    queue: &mut VecDeque<DownloadJob>,
    limit: usize,
    candidates: &[Candidate],
    chain: &dyn ChainState,
    rng: &mut R,
    plan: &mut AssignmentPlan,
) {
    let mut taken = 0usize;
    while taken < limit {
        let Some(job) = queue.front_mut() else {
            break;
        };
        while taken < limit {
            let Some(header) = job.headers.pop_front() else {
                break;
            };
            match select_weighted(candidates, &header, chain, rng) {
                Some(peer_index) => {
                    plan.assigned.push(PlannedAssignment {
                        job_id: job.id,
                        peer_index,
                        header,
                    });
                    taken += 1;
                }
                None => {
                    plan.failed.push(header.hash);
                    plan.failed.extend(job.headers.drain(..).map(|h| h.hash));
                    break;
                }
            }
        }
        if job.headers.is_empty() {
            queue.pop_front();
        }
    }
}

/// Weighted random draw proportional to quality score among the peers whose
/// claimed tip contains `header`. A drawn peer that does not claim the header
/// leaves the pool and the draw repeats.
pub(crate) fn select_weighted<R: Rng>(
    candidates: &[Candidate],
    header: &BlockHeader,
    chain: &dyn ChainState,
    rng: &mut R,
) -> Option<usize> {
    let mut pool: Vec<usize> = (0..candidates.len()).collect();
    let mut total: f64 = candidates.iter().map(|c| c.quality_score).sum();

    while !pool.is_empty() {
        let mut draw = rng.gen::<f64>() * total;
        let mut picked = pool.len() - 1;
        for (pos, &index) in pool.iter().enumerate() {
            draw -= candidates[index].quality_score;
            if draw < 0.0 {
                picked = pos;
                break;
            }
        }
        let index = pool[picked];
        if chain.is_ancestor_or_self(header, &candidates[index].tip) {
            return Some(index);
        }
        total -= candidates[index].quality_score;
        pool.swap_remove(picked);
    }
    None
}
