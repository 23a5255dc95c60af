//! Single-agent trajectory optimization: gradient descent on an action
//! sequence through a differentiable rollout engine, with best-so-far
//! retention and a per-iteration on-disk trajectory archive.

mod step;

use std::path::Path;

use common::config::{InitSampler, OptimKind, SolverConfig};
use common::error::EngineError;
use common::interfaces::RolloutEngine;
use common::state::Action;
use common::Float;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub use step::{build_optimizer, Adam, Momentum, StepOptimizer};

/// The outcome of one optimization run.
#[derive(Debug, Clone)]
pub struct Solution<T> {
    /// The lowest rollout loss seen across all iterations.
    pub best_loss: T,
    /// The action sequence that produced [`best_loss`](Solution::best_loss).
    pub best_actions: Vec<Action<T>>,
    /// The rollout loss of every iterate, in order.
    pub losses: Vec<T>,
}

/// Gradient-based trajectory search over one engine.
///
/// Each iteration runs a recorded rollout of the current action sequence,
/// reads the per-step action gradients back, applies the configured update
/// rule, then replays the updated sequence gradient-free while archiving
/// every visited state and action. The iterate with the lowest loss is
/// retained, so a final divergent update can never degrade the returned
/// plan.
pub struct TrajectoryOptimizer<T: Float, E> {
    /// The rollout engine; optimization always restarts from its state at
    /// call time.
    engine: E,
    /// Frozen optimization configuration.
    cfg: SolverConfig<T>,
    /// The per-iteration update rule.
    optim: Box<dyn StepOptimizer<T>>,
    /// Seeded generator for action initialization.
    rng: StdRng,
}

impl<T, E> TrajectoryOptimizer<T, E>
where
    T: Float,
    E: RolloutEngine<T>,
{
    /// Builds an optimizer around `engine` with the given update rule.
    pub fn new(engine: E, cfg: SolverConfig<T>, kind: OptimKind, lr: T, seed: u64) -> Self {
        Self {
            engine,
            cfg,
            optim: step::build_optimizer(kind, lr),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Borrows the engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Samples an initial action sequence over the configured horizon.
    fn init_actions(&mut self) -> Vec<Action<T>> {
        let dim = self.engine.action_dim();
        let range = self
            .cfg
            .init_range
            .to_f64()
            .expect("init_range fits in f64");

        (0..self.cfg.horizon)
            .map(|_| {
                (0..dim)
                    .map(|_| match self.cfg.init_sampler {
                        InitSampler::Uniform if range > 0.0 => {
                            T::from(self.rng.gen_range(-range..=range))
                                .expect("sample fits in the float type")
                        }
                        InitSampler::Uniform => T::zero(),
                    })
                    .collect()
            })
            .collect()
    }

    /// Optimizes an action sequence from the engine's current state over
    /// the configured iteration count, archiving each iterate's trajectory
    /// under `output_dir/raw_data/<exp_name>/`.
    ///
    /// The engine is restored to its starting state before returning, so
    /// repeated calls optimize from the same point unless the caller steps
    /// the engine in between.
    pub fn solve(
        &mut self,
        output_dir: &Path,
        exp_name: &str,
        init_actions: Option<Vec<Action<T>>>,
    ) -> Result<Solution<T>, EngineError> {
        self.run(output_dir, exp_name, init_actions, self.cfg.n_iters)
    }

    /// Optimizes a plan long enough to cover `num_steps`: the iteration
    /// count is derived as `ceil(num_steps / horizon)` so longer requested
    /// trajectories buy more refinement of the single plan.
    pub fn solve_action(
        &mut self,
        output_dir: &Path,
        exp_name: &str,
        num_steps: usize,
    ) -> Result<Solution<T>, EngineError> {
        let horizon = self.cfg.horizon;
        let n_iters = (num_steps + horizon - 1) / horizon;

        self.run(output_dir, exp_name, None, n_iters)
    }

    /// The optimization loop shared by both entry points.
    ///
    /// After every gradient update the updated sequence is replayed without
    /// recording; each visited state is persisted before the step that
    /// leaves it (plus the final state), the executed actions are buffered
    /// with one trailing all-zero row per iteration, and the full buffer is
    /// written as `action.npy` at the end. Each iteration therefore adds
    /// `horizon + 1` entries to both archives.
    fn run(
        &mut self,
        output_dir: &Path,
        exp_name: &str,
        init_actions: Option<Vec<Action<T>>>,
        n_iters: usize,
    ) -> Result<Solution<T>, EngineError> {
        let root = output_dir.join("raw_data").join(exp_name);
        let state_dir = root.join("state");
        std::fs::create_dir_all(&state_dir)?;

        let start = self.engine.snapshot();
        let mut actions = init_actions.unwrap_or_else(|| self.init_actions());

        let mut best_loss = T::infinity();
        let mut best_actions = actions.clone();
        let mut losses = Vec::with_capacity(n_iters);
        let mut action_buffer: Vec<Action<T>> = Vec::new();
        let mut pc_cnt = 0usize;

        for iter in 0..n_iters {
            self.engine.reset_to(&start, self.cfg.softness, false)?;
            self.engine.start_recording();
            for action in &actions {
                self.engine.step(action);
                self.engine.accumulate_loss(self.cfg.decay_factor);
            }
            self.engine.stop_recording();

            let loss = self.engine.loss();
            losses.push(loss);
            if loss < best_loss {
                best_loss = loss;
                best_actions = actions.clone();
            }
            log::debug!("trajectory iteration {iter}: loss {:?}", loss.to_f64());

            let grads = self.engine.action_gradients();
            self.optim.step(&mut actions, &grads);

            // Archive the updated iterate's trajectory.
            self.engine.reset_to(&start, self.cfg.softness, false)?;
            for action in &actions {
                self.engine
                    .save_state(&state_dir.join(format!("{pc_cnt:05}.bin")))?;
                self.engine.step(action);
                action_buffer.push(action.clone());
                pc_cnt += 1;
            }
            self.engine
                .save_state(&state_dir.join(format!("{pc_cnt:05}.bin")))?;
            action_buffer.push(vec![T::zero(); self.engine.action_dim()]);
            pc_cnt += 1;
        }

        self.engine.reset_to(&start, self.cfg.softness, false)?;
        write_npy(&root.join("action.npy"), &action_buffer)?;

        Ok(Solution {
            best_loss,
            best_actions,
            losses,
        })
    }
}

/// Writes a 2-D little-endian `.npy` (format version 1.0) from a row list.
fn write_npy<T: Float>(path: &Path, rows: &[Action<T>]) -> std::io::Result<()> {
    let cols = rows.first().map_or(0, |r| r.len());
    let descr = match std::mem::size_of::<T>() {
        4 => "<f4",
        _ => "<f8",
    };

    let mut dict = format!(
        "{{'descr': '{descr}', 'fortran_order': False, 'shape': ({}, {cols}), }}",
        rows.len()
    );
    // Magic (8) + header-length field (2) + dict must total a multiple of
    // 64, with the dict terminated by a newline.
    let unpadded = 8 + 2 + dict.len() + 1;
    let padded = (unpadded + 63) / 64 * 64;
    dict.extend(std::iter::repeat(' ').take(padded - unpadded));
    dict.push('\n');

    let mut bytes = Vec::with_capacity(10 + dict.len() + rows.len() * cols * 8);
    bytes.extend_from_slice(b"\x93NUMPY\x01\x00");
    bytes.extend_from_slice(&(dict.len() as u16).to_le_bytes());
    bytes.extend_from_slice(dict.as_bytes());

    let flat: Vec<T> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    bytes.extend_from_slice(bytemuck::cast_slice(&flat));

    std::fs::write(path, bytes)
}
