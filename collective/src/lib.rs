//! The collective-communication layer for the latent-physics trainer.
//!
//! A [`CommGroup`] spawns one worker per rank; every worker receives an
//! explicitly constructed [`CommContext`] carrying its rank, the world
//! size, and the collective operations. Simulators and models must be
//! constructed inside the worker closure, after the group has launched —
//! nothing live crosses a worker boundary, only values passing through the
//! collectives.
//!
//! Every collective is a strict barrier: all ranks must reach the same
//! call in the same order, and a rank that skips a call stalls the whole
//! group. Callers that locally skip work (for example after a NaN
//! gradient) therefore issue degenerate, zero-weighted contributions
//! instead of skipping the call.

use std::any::Any;
use std::sync::{Arc, Condvar, Mutex};

use common::Float;

/// The two phases of one collective round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Ranks are depositing their contributions.
    Deposit,
    /// All contributions are in; ranks are reading the round out.
    Harvest,
}

/// Shared slot table for one worker group.
struct Round {
    /// Current phase of the in-flight round.
    phase: Phase,
    /// Per-rank contributions for the in-flight round.
    buffers: Vec<Option<Arc<dyn Any + Send + Sync>>>,
    /// Ranks that have deposited this round.
    deposited: usize,
    /// Ranks that have read the round out.
    harvested: usize,
}

/// The rendezvous shared by all ranks of one group.
struct Shared {
    /// The slot table, guarded for phase transitions.
    round: Mutex<Round>,
    /// Signals phase transitions.
    cv: Condvar,
}

/// Handle for launching a group of workers.
pub struct CommGroup;

impl CommGroup {
    /// Runs `f` on `world` worker threads, each with its own
    /// [`CommContext`], and returns the per-rank results in rank order.
    ///
    /// # Panics
    /// If `world` is zero, or if any worker panics.
    pub fn run<R, F>(world: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(CommContext) -> R + Send + Sync,
    {
        assert!(world > 0, "worker group needs at least one rank");
        log::debug!("launching worker group with {world} ranks");

        let shared = Arc::new(Shared {
            round: Mutex::new(Round {
                phase: Phase::Deposit,
                buffers: vec![None; world],
                deposited: 0,
                harvested: 0,
            }),
            cv: Condvar::new(),
        });

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..world)
                .map(|rank| {
                    let shared = Arc::clone(&shared);
                    let f = &f;
                    scope.spawn(move || {
                        f(CommContext {
                            rank,
                            world,
                            shared,
                        })
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().expect("worker thread panicked"))
                .collect()
        })
    }
}

/// Per-worker collective context: rank, world size, and the collective
/// operations. Created once per worker at group launch and dropped at
/// worker exit.
pub struct CommContext {
    /// This worker's rank.
    rank: usize,
    /// The number of workers in the group.
    world: usize,
    /// The group rendezvous.
    shared: Arc<Shared>,
}

impl CommContext {
    /// This worker's rank.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// The number of workers in the group.
    pub fn world_size(&self) -> usize {
        self.world
    }

    /// True on the designated checkpoint-writing rank.
    pub fn is_root(&self) -> bool {
        self.rank == 0
    }

    /// All-gathers one value per rank; every rank receives the
    /// contributions in rank order. This is the primitive every other
    /// collective is built from, and it blocks until all ranks arrive.
    pub fn allgather<U: Clone + Send + Sync + 'static>(&self, item: U) -> Vec<U> {
        if self.world == 1 {
            return vec![item];
        }

        let mut round = self
            .shared
            .round
            .lock()
            .expect("collective rendezvous poisoned");

        // A fast rank may arrive while the previous round is still being
        // read out; wait for the table to clear.
        while round.phase == Phase::Harvest {
            round = self
                .shared
                .cv
                .wait(round)
                .expect("collective rendezvous poisoned");
        }

        round.buffers[self.rank] = Some(Arc::new(item));
        round.deposited += 1;
        if round.deposited == self.world {
            round.phase = Phase::Harvest;
            self.shared.cv.notify_all();
        } else {
            while round.phase == Phase::Deposit {
                round = self
                    .shared
                    .cv
                    .wait(round)
                    .expect("collective rendezvous poisoned");
            }
        }

        let out: Vec<U> = round
            .buffers
            .iter()
            .map(|slot| {
                slot.as_ref()
                    .and_then(|any| any.downcast_ref::<U>())
                    .expect("collective round mixed contribution types")
                    .clone()
            })
            .collect();

        round.harvested += 1;
        if round.harvested == self.world {
            round.buffers.iter_mut().for_each(|slot| *slot = None);
            round.deposited = 0;
            round.harvested = 0;
            round.phase = Phase::Deposit;
            self.shared.cv.notify_all();
        }

        out
    }

    /// Blocks until every rank reaches this call.
    pub fn barrier(&self) {
        let _ = self.allgather(());
    }

    /// Averages `value` across ranks with unit weight.
    pub fn avg<T: Float + 'static>(&self, value: T) -> T {
        self.avg_weighted(value, T::one())
    }

    /// Averages `value` across ranks, weighting each contribution.
    ///
    /// A rank with nothing to contribute passes a zero weight so the
    /// barrier is still satisfied; if every rank does so the average is
    /// zero.
    pub fn avg_weighted<T: Float + 'static>(&self, value: T, weight: T) -> T {
        let contributions = self.allgather((value, weight));
        let (total, total_weight) = contributions
            .into_iter()
            .fold((T::zero(), T::zero()), |(acc, acc_w), (v, w)| {
                (acc + v * w, acc_w + w)
            });

        if total_weight > T::zero() {
            total / total_weight
        } else {
            T::zero()
        }
    }

    /// Element-wise averages `data` across ranks in place (all-reduce
    /// semantics: every rank ends with the identical averaged buffer).
    ///
    /// # Panics
    /// If ranks contribute buffers of different lengths.
    pub fn avg_slice<T: Float + 'static>(&self, data: &mut [T]) {
        if self.world == 1 {
            return;
        }

        let contributions = self.allgather(data.to_vec());
        for contribution in &contributions {
            assert_eq!(
                contribution.len(),
                data.len(),
                "ranks contributed buffers of different lengths"
            );
        }

        let scale = num::cast::<usize, T>(self.world).expect("world size fits in the float type");
        for (i, out) in data.iter_mut().enumerate() {
            let mut acc = T::zero();
            for contribution in &contributions {
                acc = acc + contribution[i];
            }
            *out = acc / scale;
        }
    }

    /// Overwrites `data` on every rank with the `root` rank's buffer,
    /// making the buffers bit-identical.
    pub fn broadcast_slice<T: Float + 'static>(&self, data: &mut [T], root: usize) {
        if self.world == 1 {
            return;
        }

        let contributions = self.allgather(data.to_vec());
        data.copy_from_slice(&contributions[root]);
    }
}

/// Computes how many workers to launch for a run, given the requested
/// logical batch size and a per-accelerator worker cap. Called once, before
/// any simulator or model is constructed.
pub fn suggested_worker_count(batch_size: usize, per_device_cap: usize) -> usize {
    let detected = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let slots = per_device_cap.max(1) * detected;

    batch_size.clamp(1, slots)
}
