//! Weighted round-robin node selection.
//!
//! Selection is smooth weighted round robin: every candidate carries a
//! running score that grows by its weight on each pick, the highest score
//! wins and pays back the total weight. Over any run of `sum(weights)` picks
//! each node is chosen exactly `weight` times, interleaved rather than in
//! bursts, using one counter per node. Candidates are reshuffled and scores
//! reset whenever the shared availability epoch changes, and the fresh cycle
//! is entered at a random point so that outputs sharing a node list do not
//! all begin on the heaviest node.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use log::{debug, warn};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};

use crate::{error::DeliveryError, node::Node};

/// Upper bound, per candidate, on the picks skipped when entering a cycle.
const START_SPREAD: usize = 6;

#[derive(Debug)]
struct Candidate {
    index: usize,
    weight: i64,
    score: i64,
}

#[derive(Debug, Default)]
struct WeightTable {
    epoch: Option<u64>,
    candidates: Vec<Candidate>,
}

impl WeightTable {
    /// Advance every available candidate and return the winner's node index.
    fn next(&mut self, available: &[bool]) -> Option<usize> {
        let mut total = 0i64;
        let mut best: Option<(usize, i64)> = None;
        for (slot, candidate) in self.candidates.iter_mut().enumerate() {
            if !available[candidate.index] {
                continue;
            }
            candidate.score += candidate.weight;
            total += candidate.weight;
            if best.is_none_or(|(_, score)| candidate.score > score) {
                best = Some((slot, candidate.score));
            }
        }
        let (slot, _) = best?;
        let winner = &mut self.candidates[slot];
        winner.score -= total;
        Some(winner.index)
    }
}

/// Picks the destination for each chunk.
#[derive(Debug)]
pub struct NodeSelector {
    nodes: Vec<Arc<Node>>,
    epoch: Arc<AtomicU64>,
    table: Mutex<WeightTable>,
    rng: Mutex<StdRng>,
}

impl NodeSelector {
    /// `epoch` must be the counter shared with every node in `nodes`.
    pub fn new(nodes: Vec<Arc<Node>>, epoch: Arc<AtomicU64>) -> Self {
        Self::with_rng(nodes, epoch, StdRng::from_entropy())
    }

    /// Selector with a deterministic candidate order.
    pub fn with_seed(nodes: Vec<Arc<Node>>, epoch: Arc<AtomicU64>, seed: u64) -> Self {
        Self::with_rng(nodes, epoch, StdRng::seed_from_u64(seed))
    }

    fn with_rng(nodes: Vec<Arc<Node>>, epoch: Arc<AtomicU64>, rng: StdRng) -> Self {
        Self {
            nodes,
            epoch,
            table: Mutex::new(WeightTable::default()),
            rng: Mutex::new(rng),
        }
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Choose a node among available primaries, else available standbys.
    pub fn pick(&self) -> Result<Arc<Node>, DeliveryError> {
        let epoch = self.epoch.load(Ordering::Acquire);
        let now = Instant::now();
        let available: Vec<bool> = self.nodes.iter().map(|n| n.available_at(now)).collect();

        let mut table = self.table.lock();
        if table.epoch != Some(epoch) {
            table.candidates = self.build_candidates(&available);
            table.epoch = Some(epoch);
            let skip = match table.candidates.len() {
                0 => 0,
                n => self.rng.lock().gen_range(0..n * START_SPREAD),
            };
            for _ in 0..skip {
                table.next(&available);
            }
        }
        table
            .next(&available)
            .map(|index| Arc::clone(&self.nodes[index]))
            .ok_or(DeliveryError::NoAvailableNode)
    }

    fn build_candidates(&self, available: &[bool]) -> Vec<Candidate> {
        let mut indices: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| available[i] && !self.nodes[i].standby())
            .collect();
        if indices.is_empty() {
            indices = (0..self.nodes.len())
                .filter(|&i| available[i] && self.nodes[i].standby())
                .collect();
            if let Some(&first) = indices.first() {
                warn!(
                    "no primary forwarding server is available; using standby '{}'",
                    self.nodes[first].name()
                );
            }
        }
        indices.shuffle(&mut *self.rng.lock());
        debug!("rebuilt forward weight table over {} nodes", indices.len());
        indices
            .into_iter()
            .map(|index| Candidate {
                index,
                weight: i64::from(self.nodes[index].weight()),
                score: 0,
            })
            .collect()
    }
}
