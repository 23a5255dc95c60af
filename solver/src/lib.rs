//! The rollout coordinator: turns a raw initial point cloud, an action
//! plan, and a target trajectory into (optionally) a gradient signal usable
//! to update the encoder/decoder model.
//!
//! Both operations run the same pipeline — encode the first frame,
//! correspond the decoded cloud to the truth, substitute it into a copy of
//! the state, simulate — and differ only in whether the engine records
//! gradients. Divergent (NaN) gradients are an expected outcome of
//! differentiating through contact-rich dynamics; they are gated into a
//! `None` result, never raised as errors.

use common::config::SolverConfig;
use common::error::SolverError;
use common::interfaces::{AssignmentOracle, LatentModel, RolloutEngine};
use common::state::{Action, Assignment, Frame, ParticleState};
use common::Float;

/// The cap on compared points when the oracle computes the correspondence
/// distance.
pub const CORRESPONDENCE_CAP: usize = 3000;

/// The outcome of one gradient rollout.
///
/// `decoded` and `gradient` are `None` exactly when the clamped state
/// gradient contained a non-finite value; the losses are reported either
/// way so skipped batches still contribute to monitoring.
#[derive(Debug, Clone)]
pub struct Rollout<T> {
    /// The decoded, correspondence-reordered first frame, when usable.
    pub decoded: Option<Frame<T>>,
    /// The clamped gradient of the rollout loss with respect to the
    /// model's decoded output (scattered back through the correspondence,
    /// so it feeds the model's backward pass directly), when finite.
    pub gradient: Option<Frame<T>>,
    /// The correspondence distance between the decoded cloud and the true
    /// first frame (zero in the assignment-only variant).
    pub loss_first: T,
    /// The accumulated rollout loss.
    pub loss: T,
}

/// The effective rollout length for a configured step count and a target
/// length: a configured value only ever shortens the rollout, and
/// non-positive stored values fall back to the full target length.
pub fn effective_steps(configured: Option<usize>, target_len: usize) -> usize {
    match configured {
        Some(steps) if steps > 0 && steps < target_len => steps,
        _ => target_len,
    }
}

/// The rollout coordinator. Owns one engine, one model, and one oracle;
/// callers on the same process must not interleave concurrent calls
/// against the same instance, since both the engine cursor and the model
/// activations are single-buffered.
pub struct Solver<T: Float, E, M, O> {
    /// The differentiable rollout engine.
    engine: E,
    /// The point-cloud autoencoder.
    model: M,
    /// The loss/assignment oracle.
    oracle: O,
    /// Frozen coordinator configuration.
    cfg: SolverConfig<T>,
}

impl<T, E, M, O> Solver<T, E, M, O>
where
    T: Float,
    E: RolloutEngine<T>,
    M: LatentModel<T>,
    O: AssignmentOracle<T>,
{
    /// Builds a coordinator around an engine, model, and oracle.
    pub fn new(engine: E, model: M, oracle: O, cfg: SolverConfig<T>) -> Self {
        Self {
            engine,
            model,
            oracle,
            cfg,
        }
    }

    /// The coordinator configuration.
    pub fn config(&self) -> &SolverConfig<T> {
        &self.cfg
    }

    /// Borrows the model, e.g. for parameter synchronization.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Mutably borrows the model for the update procedure.
    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    /// Borrows the engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Runs the encode/correspond/substitute pipeline shared by both
    /// operations, returning the first-frame loss and the staged state
    /// with the decoded cloud substituted in.
    fn stage(
        &mut self,
        state: &ParticleState<T>,
    ) -> Result<(T, Frame<T>, ParticleState<T>, Assignment), SolverError> {
        let decoded = self.model.forward(&state.positions);

        let (loss_first, assignment) = if self.cfg.report_first_loss {
            self.oracle
                .distance_assign(&decoded, &state.positions, CORRESPONDENCE_CAP)
        } else {
            let assignment = self
                .oracle
                .assign(&decoded, &state.positions, CORRESPONDENCE_CAP);
            (T::zero(), assignment)
        };
        let reordered = assignment.apply(&decoded);

        if reordered.len() != state.n_particles() {
            return Err(SolverError::ShapeMismatch {
                expected: state.n_particles(),
                decoded: reordered.len(),
            });
        }

        let mut staged = state.clone();
        staged.positions = reordered.clone();

        Ok((loss_first, reordered, staged, assignment))
    }

    /// Advances the engine over the effective rollout, accumulating the
    /// decayed loss. The caller decides whether the engine is recording.
    fn roll(
        &mut self,
        staged: &ParticleState<T>,
        actions: &[Action<T>],
        targets: &[Frame<T>],
    ) -> Result<usize, SolverError> {
        let steps = effective_steps(self.cfg.steps, targets.len());
        if actions.len() < steps {
            return Err(SolverError::PlanTooShort {
                needed: steps,
                available: actions.len(),
            });
        }

        self.engine.reset_to(staged, self.cfg.softness, false)?;
        Ok(steps)
    }

    /// Gradient rollout: encode, correspond, substitute, then simulate in
    /// gradient-recording mode and read back the clamped state gradient.
    ///
    /// The caller's `state`, `actions`, and `targets` are never mutated;
    /// the coordinator deep-copies before substituting.
    pub fn solve_multistep(
        &mut self,
        state: &ParticleState<T>,
        actions: &[Action<T>],
        targets: &[Frame<T>],
    ) -> Result<Rollout<T>, SolverError> {
        let (loss_first, reordered, staged, assignment) = self.stage(state)?;
        let steps = self.roll(&staged, actions, targets)?;

        self.engine.start_recording();
        for t in 0..steps {
            self.engine.set_target(&targets[t]);
            self.engine.step(&actions[t]);
            self.engine.accumulate_loss(self.cfg.decay_factor);
        }
        self.engine.stop_recording();

        let loss = self.engine.loss();

        // The engine differentiates against the substituted (reordered)
        // frame; scatter back through the correspondence so the gradient
        // lines up with the model's output order.
        let staged_gradient = self.engine.state_gradient();
        let mut gradient = staged_gradient.clone();
        for (slot, &decoded_idx) in assignment.0.iter().enumerate() {
            gradient[decoded_idx] = staged_gradient[slot];
        }

        // Clip against numerical blow-up from the adjoint pass. NaN is
        // preserved here so the gate below can see it; num's min/max would
        // silently wash it out.
        let one = T::one();
        let mut finite = true;
        for point in gradient.iter_mut() {
            for g in point.as_array_mut() {
                if g.is_nan() {
                    finite = false;
                } else {
                    *g = num::clamp(*g, -one, one);
                    if !g.is_finite() {
                        finite = false;
                    }
                }
            }
        }

        if finite {
            Ok(Rollout {
                decoded: Some(reordered),
                gradient: Some(gradient),
                loss_first,
                loss,
            })
        } else {
            log::warn!("NaN detected in state gradient; dropping this step");
            Ok(Rollout {
                decoded: None,
                gradient: None,
                loss_first,
                loss,
            })
        }
    }

    /// Gradient-free rollout: the identical pipeline without recording.
    /// Used for cheap evaluation passes that populate the loss table
    /// without paying for the backward sweep.
    pub fn exec_multistep(
        &mut self,
        state: &ParticleState<T>,
        actions: &[Action<T>],
        targets: &[Frame<T>],
    ) -> Result<(T, T), SolverError> {
        let (loss_first, _reordered, staged, _assignment) = self.stage(state)?;
        let steps = self.roll(&staged, actions, targets)?;

        for t in 0..steps {
            self.engine.set_target(&targets[t]);
            self.engine.step(&actions[t]);
            self.engine.accumulate_loss(self.cfg.decay_factor);
        }

        Ok((loss_first, self.engine.loss()))
    }
}

#[cfg(test)]
mod tests {
    use super::{effective_steps, Solver};
    use common::config::SolverConfig;
    use common::state::ParticleState;
    use common::vector::Vector;
    use spring_system::{
        LinearAutoEncoder, NearestNeighbourOracle, SpringConfig, SpringEngine,
    };

    fn test_solver(
        n: usize,
        steps: Option<usize>,
    ) -> Solver<f64, SpringEngine<f64>, LinearAutoEncoder<f64>, NearestNeighbourOracle> {
        let engine = SpringEngine::new(SpringConfig::build(n).finalize().unwrap());
        let model = LinearAutoEncoder::new(n, 16, 1e-2, 7);
        let cfg = SolverConfig::build().steps(steps).finalize().unwrap();
        Solver::new(engine, model, NearestNeighbourOracle, cfg)
    }

    fn sample_state(n: usize) -> ParticleState<f64> {
        let mut state = ParticleState::zeroed(n, 3);
        for (i, p) in state.positions.iter_mut().enumerate() {
            *p = Vector::new([i as f64 * 0.1, 0.5, 0.25]);
        }
        state
    }

    #[test]
    fn test_effective_steps_table() {
        // Unset, zero, and over-length configurations all fall back to the
        // target length; only 0 < s < L shortens.
        assert_eq!(effective_steps(None, 10), 10);
        assert_eq!(effective_steps(Some(0), 10), 10);
        assert_eq!(effective_steps(Some(10), 10), 10);
        assert_eq!(effective_steps(Some(17), 10), 10);
        assert_eq!(effective_steps(Some(3), 10), 3);
    }

    #[test]
    fn test_exec_multistep_leaves_inputs_untouched() {
        let n = 6;
        let mut solver = test_solver(n, None);
        let state = sample_state(n);
        let actions = vec![vec![0.1f64, 0.0, 0.0]; 4];
        let targets = vec![state.positions.clone(); 4];

        let state_before = state.clone();
        let actions_before = actions.clone();
        let targets_before = targets.clone();

        solver.exec_multistep(&state, &actions, &targets).unwrap();

        assert_eq!(state, state_before);
        assert_eq!(actions, actions_before);
        assert_eq!(targets, targets_before);
    }

    #[test]
    fn test_solve_multistep_gradient_shape_and_clamp() {
        let n = 6;
        let mut solver = test_solver(n, None);
        let state = sample_state(n);
        let actions = vec![vec![0.2f64, -0.1, 0.05]; 3];
        let targets = vec![vec![Vector::new([0.9f64, 0.9, 0.9]); n]; 3];

        let rollout = solver.solve_multistep(&state, &actions, &targets).unwrap();
        let gradient = rollout.gradient.expect("finite gradient expected");

        assert_eq!(gradient.len(), n);
        for point in &gradient {
            for &g in point.as_array() {
                assert!((-1.0..=1.0).contains(&g), "gradient element out of clamp range");
            }
        }
    }

    #[test]
    fn test_exec_multistep_is_deterministic() {
        let n = 5;
        let state = sample_state(n);
        let actions = vec![vec![0.1f64, 0.2, -0.3], vec![0.0, 0.1, 0.0]];
        let targets = vec![state.positions.clone(), state.positions.clone()];

        let mut a = test_solver(n, None);
        let mut b = test_solver(n, None);
        let (first_a, loss_a) = a.exec_multistep(&state, &actions, &targets).unwrap();
        let (first_b, loss_b) = b.exec_multistep(&state, &actions, &targets).unwrap();

        assert_eq!(first_a.to_bits(), first_b.to_bits());
        assert_eq!(loss_a.to_bits(), loss_b.to_bits());
    }

    #[test]
    fn test_plan_too_short_is_an_error() {
        let n = 4;
        let mut solver = test_solver(n, None);
        let state = sample_state(n);
        let actions = vec![vec![0.0f64; 3]; 2];
        let targets = vec![state.positions.clone(); 5];

        assert!(solver.exec_multistep(&state, &actions, &targets).is_err());
    }

    #[test]
    fn test_nan_gradient_is_gated_not_raised() {
        use common::error::EngineError;
        use common::interfaces::RolloutEngine;
        use common::state::{Action, Frame};
        use std::path::Path;

        /// Engine whose adjoint pass always diverges.
        struct NanEngine {
            n: usize,
            loss: f64,
        }

        impl RolloutEngine<f64> for NanEngine {
            fn n_particles(&self) -> usize {
                self.n
            }
            fn action_dim(&self) -> usize {
                3
            }
            fn reset_to(
                &mut self,
                _state: &ParticleState<f64>,
                _softness: f64,
                _soft_reset: bool,
            ) -> Result<(), EngineError> {
                self.loss = 0.0;
                Ok(())
            }
            fn set_target(&mut self, _target: &Frame<f64>) {}
            fn step(&mut self, _action: &Action<f64>) {}
            fn accumulate_loss(&mut self, _decay: f64) {
                self.loss += 1.0;
            }
            fn start_recording(&mut self) {}
            fn stop_recording(&mut self) {}
            fn loss(&self) -> f64 {
                self.loss
            }
            fn state_gradient(&self) -> Frame<f64> {
                vec![Vector::new([f64::NAN, 0.0, 0.0]); self.n]
            }
            fn action_gradients(&self) -> Vec<Action<f64>> {
                vec![]
            }
            fn snapshot(&self) -> ParticleState<f64> {
                ParticleState::zeroed(self.n, 3)
            }
            fn save_state(&self, _path: &Path) -> Result<(), EngineError> {
                Ok(())
            }
        }

        let n = 4;
        let engine = NanEngine { n, loss: 0.0 };
        let model = LinearAutoEncoder::new(n, 8, 1e-2, 3);
        let cfg = SolverConfig::build().finalize().unwrap();
        let mut solver = Solver::new(engine, model, NearestNeighbourOracle, cfg);

        let state = sample_state(n);
        let actions = vec![vec![0.0f64; 3]; 2];
        let targets = vec![state.positions.clone(); 2];

        let rollout = solver.solve_multistep(&state, &actions, &targets).unwrap();
        assert!(rollout.decoded.is_none());
        assert!(rollout.gradient.is_none());
        // The evaluation loss still counts for monitoring.
        assert_eq!(rollout.loss, 2.0);
    }

    #[test]
    fn test_configured_steps_shorten_rollout() {
        let n = 4;
        let mut long = test_solver(n, None);
        let mut short = test_solver(n, Some(1));
        let state = sample_state(n);
        let actions = vec![vec![0.3f64, 0.0, 0.0]; 4];
        let targets = vec![vec![Vector::new([1.0f64, 1.0, 1.0]); n]; 4];

        let (_, loss_long) = long.exec_multistep(&state, &actions, &targets).unwrap();
        let (_, loss_short) = short.exec_multistep(&state, &actions, &targets).unwrap();

        // One accumulated term cannot exceed four of the same sign.
        assert!(loss_short < loss_long);
    }
}
