use std::cmp::Ordering;

use collective::CommContext;
use common::state::{Action, Frame, ParticleState};
use common::Float;
use itertools::Itertools;

/// One training sample: a start state, per-step ground-truth target frames,
/// and the action plan that produced them.
#[derive(Debug, Clone)]
pub struct Sample<T: Float> {
    /// Position of this sample in the dataset, used as its loss-table key.
    pub index: usize,
    /// The initial particle state.
    pub state: ParticleState<T>,
    /// The per-step target frames.
    pub targets: Vec<Frame<T>>,
    /// The action plan.
    pub actions: Vec<Action<T>>,
}

/// A replicated loss-table entry. Versions decide which rank's record wins
/// during synchronization.
#[derive(Debug, Clone, Copy)]
struct Entry<T> {
    /// The last recorded rollout loss for the sample.
    loss: T,
    /// Bumped on every local record.
    version: u64,
}

/// The in-memory dataset plus the per-sample loss table that drives focal
/// resampling.
///
/// Every worker holds a full replica; only the loss table is synchronized,
/// through [`sync_losses`](PointCloudDataset::sync_losses).
pub struct PointCloudDataset<T: Float> {
    /// All samples, indexed by their loss-table key.
    samples: Vec<Sample<T>>,
    /// The replicated per-sample loss table.
    losses: Vec<Entry<T>>,
}

impl<T: Float + 'static> PointCloudDataset<T> {
    /// Wraps raw rollouts into an indexed dataset with a cold loss table.
    pub fn new(rollouts: Vec<(ParticleState<T>, Vec<Frame<T>>, Vec<Action<T>>)>) -> Self {
        let samples = rollouts
            .into_iter()
            .enumerate()
            .map(|(index, (state, targets, actions))| Sample {
                index,
                state,
                targets,
                actions,
            })
            .collect_vec();
        let losses = vec![
            Entry {
                loss: T::zero(),
                version: 0,
            };
            samples.len()
        ];

        Self { samples, losses }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the dataset is empty.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The sample with loss-table key `index`.
    pub fn get(&self, index: usize) -> &Sample<T> {
        &self.samples[index]
    }

    /// Records a fresh rollout loss for `index`, superseding older records
    /// on every rank after the next synchronization.
    pub fn record_loss(&mut self, index: usize, loss: T) {
        let entry = &mut self.losses[index];
        entry.loss = loss;
        entry.version += 1;
    }

    /// The recorded loss for `index`.
    pub fn loss(&self, index: usize) -> T {
        self.losses[index].loss
    }

    /// Merges the loss tables of all ranks: for each sample the
    /// highest-version record wins, ties going to the lowest rank, so every
    /// replica ends bit-identical.
    pub fn sync_losses(&mut self, ctx: &CommContext) {
        let local = self
            .losses
            .iter()
            .enumerate()
            .map(|(index, entry)| (index, entry.version, entry.loss))
            .collect_vec();
        let contributions = ctx.allgather(local);

        for contribution in contributions {
            for (index, version, loss) in contribution {
                if version > self.losses[index].version {
                    self.losses[index] = Entry { loss, version };
                }
            }
        }
    }

    /// The `k` highest-loss sample indices (fewer if the dataset is
    /// smaller), ties broken by index so all synchronized replicas select
    /// the same subset.
    pub fn focal_subset(&self, k: usize) -> Vec<usize> {
        self.losses
            .iter()
            .enumerate()
            .sorted_by(|(ia, a), (ib, b)| {
                b.loss
                    .partial_cmp(&a.loss)
                    .unwrap_or(Ordering::Equal)
                    .then(ia.cmp(ib))
            })
            .take(k)
            .map(|(index, _)| index)
            .collect_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::PointCloudDataset;
    use collective::CommGroup;
    use common::state::ParticleState;

    fn dataset(n: usize) -> PointCloudDataset<f64> {
        PointCloudDataset::new(
            (0..n)
                .map(|_| (ParticleState::zeroed(2, 3), vec![], vec![]))
                .collect(),
        )
    }

    #[test]
    fn test_focal_subset_prefers_high_loss() {
        let mut data = dataset(5);
        data.record_loss(0, 1.0);
        data.record_loss(1, 9.0);
        data.record_loss(2, 3.0);
        data.record_loss(3, 9.0);
        data.record_loss(4, 0.5);

        assert_eq!(data.focal_subset(3), vec![1, 3, 2]);
    }

    #[test]
    fn test_focal_subset_caps_at_dataset_size() {
        let data = dataset(3);
        assert_eq!(data.focal_subset(10).len(), 3);
    }

    #[test]
    fn test_sync_losses_converges_across_ranks() {
        // Each rank records a disjoint half of the table; after one sync
        // every replica holds the union.
        let results = CommGroup::run(2, |ctx| {
            let mut data = dataset(4);
            if ctx.rank() == 0 {
                data.record_loss(0, 4.0);
                data.record_loss(1, 2.0);
            } else {
                data.record_loss(2, 8.0);
                data.record_loss(3, 1.0);
            }
            data.sync_losses(&ctx);
            (0..4).map(|i| data.loss(i)).collect::<Vec<_>>()
        });

        for table in results {
            assert_eq!(table, vec![4.0, 2.0, 8.0, 1.0]);
        }
    }

    #[test]
    fn test_sync_losses_newest_version_wins() {
        let results = CommGroup::run(2, |ctx| {
            let mut data = dataset(1);
            data.record_loss(0, 1.0);
            if ctx.rank() == 1 {
                // A second record on rank 1 supersedes everyone's first.
                data.record_loss(0, 7.0);
            }
            data.sync_losses(&ctx);
            data.loss(0)
        });

        assert_eq!(results, vec![7.0, 7.0]);
    }
}
