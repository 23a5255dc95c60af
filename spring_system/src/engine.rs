use std::path::Path;

use common::config::LossKind;
use common::error::{ConfigError, EngineError};
use common::interfaces::RolloutEngine;
use common::state::{Action, Frame, ParticleState};
use common::vector::Vector;
use common::Float;

/// Configuration of the damped point-mass system.
///
/// Each step pulls every particle toward the action's force-field centre
/// `c` with stiffness `k` under velocity damping `mu`:
///
/// ```text
/// vel' = (1 - mu) * vel + dt * k * (c - pos)
/// pos' = pos + dt * vel'
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SpringConfig<T: Float> {
    /// Number of particles.
    pub n_particles: usize,
    /// Integration step size.
    pub dt: T,
    /// Pull stiffness toward the action centre.
    pub stiffness: T,
    /// Velocity damping in `[0, 1)`.
    pub damping: T,
    /// The per-step loss function, fixed at construction.
    pub loss_kind: LossKind,
    /// The default target used when no per-step target has been set
    /// (trajectory optimization runs against a fixed goal).
    pub goal: Vector<T, 3>,
}

impl<T: Float> SpringConfig<T> {
    /// Starts a builder for `n_particles` particles.
    pub fn build(n_particles: usize) -> SpringConfigBuilder<T> {
        SpringConfigBuilder {
            n_particles,
            dt: T::from(0.05).unwrap_or_else(T::one),
            stiffness: T::from(2.0).unwrap_or_else(T::one),
            damping: T::from(0.1).unwrap_or_else(T::zero),
            loss_kind: LossKind::Generic,
            goal: Vector::broadcast(T::from(0.5).unwrap_or_else(T::zero)),
        }
    }
}

/// Builder for [`SpringConfig`].
#[derive(Debug, Clone)]
pub struct SpringConfigBuilder<T: Float> {
    n_particles: usize,
    dt: T,
    stiffness: T,
    damping: T,
    loss_kind: LossKind,
    goal: Vector<T, 3>,
}

impl<T: Float> SpringConfigBuilder<T> {
    /// Sets the integration step size.
    pub fn dt(mut self, dt: T) -> Self {
        self.dt = dt;
        self
    }

    /// Sets the pull stiffness.
    pub fn stiffness(mut self, stiffness: T) -> Self {
        self.stiffness = stiffness;
        self
    }

    /// Sets the velocity damping.
    pub fn damping(mut self, damping: T) -> Self {
        self.damping = damping;
        self
    }

    /// Sets the per-step loss function.
    pub fn loss_kind(mut self, loss_kind: LossKind) -> Self {
        self.loss_kind = loss_kind;
        self
    }

    /// Sets the default goal position.
    pub fn goal(mut self, goal: Vector<T, 3>) -> Self {
        self.goal = goal;
        self
    }

    /// Validates and freezes the configuration.
    pub fn finalize(self) -> Result<SpringConfig<T>, ConfigError> {
        if self.n_particles == 0 {
            return Err(ConfigError::InvalidValue {
                field: "n_particles",
                reason: "must be positive".to_owned(),
            });
        }
        if !(self.dt > T::zero()) {
            return Err(ConfigError::InvalidValue {
                field: "dt",
                reason: "must be positive".to_owned(),
            });
        }
        if !(self.damping >= T::zero() && self.damping < T::one()) {
            return Err(ConfigError::InvalidValue {
                field: "damping",
                reason: "must lie in [0, 1)".to_owned(),
            });
        }

        Ok(SpringConfig {
            n_particles: self.n_particles,
            dt: self.dt,
            stiffness: self.stiffness,
            damping: self.damping,
            loss_kind: self.loss_kind,
            goal: self.goal,
        })
    }
}

/// One recorded loss term.
struct LossRecord<T: Float> {
    /// The decay weight applied to this term.
    weight: T,
    /// Positions after the step the term was measured at.
    positions: Frame<T>,
    /// Velocities after the step (used by the state loss).
    velocities: Frame<T>,
    /// The target frame the term was measured against.
    target: Frame<T>,
    /// Chamfer argmin target index per particle, fixed during the forward
    /// pass so the backward sweep differentiates the selected branch.
    nearest: Option<Vec<usize>>,
}

/// One step of the recorded tape.
struct TraceStep<T: Float> {
    /// The loss term attached to this step, if any.
    loss: Option<LossRecord<T>>,
}

/// The damped point-mass rollout engine.
pub struct SpringEngine<T: Float> {
    /// Frozen system configuration.
    cfg: SpringConfig<T>,
    /// The live particle state.
    state: ParticleState<T>,
    /// The target frame for the next accumulated loss term.
    target: Frame<T>,
    /// Contact softness handed over on reset (carried, not used by these
    /// linear dynamics).
    softness: T,
    /// Accumulated scalar loss since the last reset.
    loss: T,
    /// Steps taken since the last reset.
    steps_taken: usize,
    /// Whether the tape is being recorded.
    recording: bool,
    /// The recorded tape, one entry per step.
    trace: Vec<TraceStep<T>>,
    /// d loss / d initial positions, valid after `stop_recording`.
    state_grad: Frame<T>,
    /// d loss / d action per step, valid after `stop_recording`.
    action_grads: Vec<Action<T>>,
}

impl<T: Float> SpringEngine<T> {
    /// Builds an engine with every particle at the origin.
    pub fn new(cfg: SpringConfig<T>) -> Self {
        let n = cfg.n_particles;
        let target = vec![cfg.goal; n];
        Self {
            cfg,
            state: ParticleState::zeroed(n, 3),
            target,
            softness: T::zero(),
            loss: T::zero(),
            steps_taken: 0,
            recording: false,
            trace: Vec::new(),
            state_grad: vec![Vector::zero(); n],
            action_grads: Vec::new(),
        }
    }

    /// The engine configuration.
    pub fn config(&self) -> &SpringConfig<T> {
        &self.cfg
    }

    /// Reads the action's force-field centre, padding missing components
    /// with zero.
    fn centre(action: &Action<T>) -> Vector<T, 3> {
        Vector::from_idx(|i| action.get(i).copied().unwrap_or_else(T::zero))
    }

    /// The current step's loss term against the current target, together
    /// with the chamfer argmin indices when that loss is selected.
    fn step_loss(&self) -> (T, Option<Vec<usize>>) {
        let n = self.cfg.n_particles;
        let inv_n = T::one() / num::cast::<usize, T>(n).expect("particle count fits in float");

        match self.cfg.loss_kind {
            LossKind::Chamfer => {
                let mut total = T::zero();
                let mut nearest = Vec::with_capacity(n);
                for p in &self.state.positions {
                    let mut best = T::infinity();
                    let mut best_j = 0;
                    for (j, t) in self.target.iter().enumerate() {
                        let d = (*p - *t).norm_sq();
                        if d < best {
                            best = d;
                            best_j = j;
                        }
                    }
                    total = total + best;
                    nearest.push(best_j);
                }
                (total * inv_n, Some(nearest))
            }
            LossKind::State => {
                let mut total = T::zero();
                for (p, t) in self.state.positions.iter().zip(&self.target) {
                    total = total + (*p - *t).norm_sq();
                }
                for v in &self.state.velocities {
                    total = total + v.norm_sq();
                }
                (total * inv_n, None)
            }
            LossKind::Emd | LossKind::Generic => {
                let mut total = T::zero();
                for (p, t) in self.state.positions.iter().zip(&self.target) {
                    total = total + (*p - *t).norm_sq();
                }
                (total * inv_n, None)
            }
        }
    }

    /// Runs the reverse (adjoint) sweep over the recorded tape.
    fn backward_sweep(&mut self) {
        let n = self.cfg.n_particles;
        let dt = self.cfg.dt;
        let k = self.cfg.stiffness;
        let keep = T::one() - self.cfg.damping;
        let two = T::one() + T::one();
        let inv_n = T::one() / num::cast::<usize, T>(n).expect("particle count fits in float");

        let mut g_pos: Frame<T> = vec![Vector::zero(); n];
        let mut g_vel: Frame<T> = vec![Vector::zero(); n];
        let mut action_grads: Vec<Action<T>> = vec![vec![T::zero(); 3]; self.trace.len()];

        for (t, step) in self.trace.iter().enumerate().rev() {
            if let Some(record) = &step.loss {
                let w = record.weight;
                match self.cfg.loss_kind {
                    LossKind::Chamfer => {
                        let nearest = record
                            .nearest
                            .as_ref()
                            .expect("chamfer record carries argmin indices");
                        for i in 0..n {
                            let diff = record.positions[i] - record.target[nearest[i]];
                            g_pos[i] += diff * (two * w * inv_n);
                        }
                    }
                    LossKind::State => {
                        for i in 0..n {
                            let diff = record.positions[i] - record.target[i];
                            g_pos[i] += diff * (two * w * inv_n);
                            g_vel[i] += record.velocities[i] * (two * w * inv_n);
                        }
                    }
                    LossKind::Emd | LossKind::Generic => {
                        for i in 0..n {
                            let diff = record.positions[i] - record.target[i];
                            g_pos[i] += diff * (two * w * inv_n);
                        }
                    }
                }
            }

            // Dynamics adjoint:
            //   pos' = pos + dt * vel'
            //   vel' = keep * vel + dt * k * (c - pos)
            let mut g_action = Vector::<T, 3>::zero();
            for i in 0..n {
                let g_vel_total = g_vel[i] + g_pos[i] * dt;
                g_action += g_vel_total * (dt * k);
                g_pos[i] = g_pos[i] - g_vel_total * (dt * k);
                g_vel[i] = g_vel_total * keep;
            }
            action_grads[t] = g_action.as_array().to_vec();
        }

        self.state_grad = g_pos;
        self.action_grads = action_grads;
    }
}

impl<T: Float> RolloutEngine<T> for SpringEngine<T> {
    fn n_particles(&self) -> usize {
        self.cfg.n_particles
    }

    fn action_dim(&self) -> usize {
        3
    }

    fn reset_to(
        &mut self,
        state: &ParticleState<T>,
        softness: T,
        soft_reset: bool,
    ) -> Result<(), EngineError> {
        if !state.is_consistent() {
            return Err(EngineError::InconsistentState);
        }
        if state.n_particles() != self.cfg.n_particles {
            return Err(EngineError::ParticleCountMismatch {
                expected: self.cfg.n_particles,
                found: state.n_particles(),
            });
        }

        self.state = state.clone();
        self.softness = softness;
        self.steps_taken = 0;
        self.trace.clear();
        if !soft_reset {
            self.loss = T::zero();
        }

        Ok(())
    }

    fn set_target(&mut self, target: &Frame<T>) {
        self.target = target.clone();
    }

    fn step(&mut self, action: &Action<T>) {
        let c = Self::centre(action);
        let dt = self.cfg.dt;
        let k = self.cfg.stiffness;
        let keep = T::one() - self.cfg.damping;

        for (pos, vel) in self
            .state
            .positions
            .iter_mut()
            .zip(self.state.velocities.iter_mut())
        {
            let acc = (c - *pos) * k;
            *vel = *vel * keep + acc * dt;
            *pos += *vel * dt;
        }
        self.state.actuator = action.clone();
        self.steps_taken += 1;

        if self.recording {
            self.trace.push(TraceStep { loss: None });
        }
    }

    fn accumulate_loss(&mut self, decay: T) {
        let exponent = self.steps_taken.saturating_sub(1) as i32;
        let weight = decay.powi(exponent);
        let (term, nearest) = self.step_loss();
        self.loss = self.loss + term * weight;

        if self.recording {
            if let Some(step) = self.trace.last_mut() {
                step.loss = Some(LossRecord {
                    weight,
                    positions: self.state.positions.clone(),
                    velocities: self.state.velocities.clone(),
                    target: self.target.clone(),
                    nearest,
                });
            }
        }
    }

    fn start_recording(&mut self) {
        self.recording = true;
        self.trace.clear();
    }

    fn stop_recording(&mut self) {
        self.backward_sweep();
        self.recording = false;
    }

    fn loss(&self) -> T {
        self.loss
    }

    fn state_gradient(&self) -> Frame<T> {
        self.state_grad.clone()
    }

    fn action_gradients(&self) -> Vec<Action<T>> {
        self.action_grads.clone()
    }

    fn snapshot(&self) -> ParticleState<T> {
        self.state.clone()
    }

    fn save_state(&self, path: &Path) -> Result<(), EngineError> {
        let n = self.cfg.n_particles as u64;
        let mut bytes = Vec::with_capacity(8 + 2 * self.state.positions.len() * 3 * 8);
        bytes.extend_from_slice(&n.to_le_bytes());
        bytes.extend_from_slice(bytemuck::cast_slice(&self.state.positions));
        bytes.extend_from_slice(bytemuck::cast_slice(&self.state.velocities));
        std::fs::write(path, bytes)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{SpringConfig, SpringEngine};
    use common::config::LossKind;
    use common::interfaces::RolloutEngine;
    use common::state::{Action, Frame, ParticleState};
    use common::vector::Vector;

    fn start_state(n: usize) -> ParticleState<f64> {
        let mut state = ParticleState::zeroed(n, 3);
        for (i, p) in state.positions.iter_mut().enumerate() {
            *p = Vector::new([0.1 * i as f64, 0.3, 0.7 - 0.05 * i as f64]);
        }
        state
    }

    fn run_loss(
        engine: &mut SpringEngine<f64>,
        state: &ParticleState<f64>,
        actions: &[Action<f64>],
        targets: &[Frame<f64>],
        decay: f64,
    ) -> f64 {
        engine.reset_to(state, 666.0, false).unwrap();
        for (action, target) in actions.iter().zip(targets) {
            engine.set_target(target);
            engine.step(action);
            engine.accumulate_loss(decay);
        }
        engine.loss()
    }

    #[test]
    fn test_reset_rejects_wrong_particle_count() {
        let mut engine = SpringEngine::new(SpringConfig::build(4).finalize().unwrap());
        let state = ParticleState::<f64>::zeroed(5, 3);
        assert!(engine.reset_to(&state, 0.0, false).is_err());
    }

    #[test]
    fn test_rollout_is_deterministic() {
        let cfg = SpringConfig::build(5).finalize().unwrap();
        let state = start_state(5);
        let actions = vec![vec![0.2, -0.1, 0.3]; 3];
        let targets = vec![vec![Vector::new([0.5, 0.5, 0.5]); 5]; 3];

        let a = run_loss(&mut SpringEngine::new(cfg.clone()), &state, &actions, &targets, 0.99);
        let b = run_loss(&mut SpringEngine::new(cfg), &state, &actions, &targets, 0.99);

        assert_eq!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn test_decay_weights_later_steps_less() {
        // Two identical per-step losses: decayed accumulation must be
        // strictly below undecayed accumulation.
        let cfg = SpringConfig::build(3).finalize().unwrap();
        let state = start_state(3);
        let actions = vec![vec![0.0, 0.0, 0.0]; 2];
        let targets = vec![vec![Vector::new([5.0, 5.0, 5.0]); 3]; 2];

        let decayed = run_loss(&mut SpringEngine::new(cfg.clone()), &state, &actions, &targets, 0.5);
        let flat = run_loss(&mut SpringEngine::new(cfg), &state, &actions, &targets, 1.0);

        assert!(decayed < flat);
    }

    /// Central finite difference of the rollout loss with respect to one
    /// scalar input, with the input restored afterwards.
    fn finite_difference(mut f: impl FnMut(f64) -> f64, x: f64) -> f64 {
        let eps = 1e-6;
        (f(x + eps) - f(x - eps)) / (2.0 * eps)
    }

    fn check_gradients(kind: LossKind) {
        let n = 3;
        let cfg = SpringConfig::build(n).loss_kind(kind).finalize().unwrap();
        let state = start_state(n);
        let actions = vec![vec![0.3, -0.2, 0.1], vec![-0.1, 0.4, 0.0]];
        let targets = vec![
            vec![Vector::new([0.4, 0.2, 0.6]); n],
            vec![Vector::new([0.6, 0.1, 0.4]); n],
        ];
        let decay = 0.9;

        let mut engine = SpringEngine::new(cfg.clone());
        engine.reset_to(&state, 666.0, false).unwrap();
        engine.start_recording();
        for (action, target) in actions.iter().zip(&targets) {
            engine.set_target(target);
            engine.step(action);
            engine.accumulate_loss(decay);
        }
        engine.stop_recording();
        let state_grad = engine.state_gradient();
        let action_grads = engine.action_gradients();

        // d loss / d initial positions.
        let mut fd_engine = SpringEngine::new(cfg.clone());
        for i in 0..n {
            for d in 0..3 {
                let numeric = finite_difference(
                    |x| {
                        let mut perturbed = state.clone();
                        perturbed.positions[i][d] = x;
                        run_loss(&mut fd_engine, &perturbed, &actions, &targets, decay)
                    },
                    state.positions[i][d],
                );
                assert!(
                    (state_grad[i][d] - numeric).abs() < 1e-5,
                    "state grad mismatch at particle {i} dim {d}: {} vs {numeric}",
                    state_grad[i][d]
                );
            }
        }

        // d loss / d actions.
        for t in 0..actions.len() {
            for d in 0..3 {
                let numeric = finite_difference(
                    |x| {
                        let mut perturbed = actions.clone();
                        perturbed[t][d] = x;
                        run_loss(&mut fd_engine, &state, &perturbed, &targets, decay)
                    },
                    actions[t][d],
                );
                assert!(
                    (action_grads[t][d] - numeric).abs() < 1e-5,
                    "action grad mismatch at step {t} dim {d}: {} vs {numeric}",
                    action_grads[t][d]
                );
            }
        }
    }

    #[test]
    fn test_adjoint_matches_finite_difference_emd() {
        check_gradients(LossKind::Emd);
    }

    #[test]
    fn test_adjoint_matches_finite_difference_chamfer() {
        check_gradients(LossKind::Chamfer);
    }

    #[test]
    fn test_adjoint_matches_finite_difference_state() {
        check_gradients(LossKind::State);
    }

    #[test]
    fn test_snapshot_restores_exactly() {
        let cfg = SpringConfig::build(4).finalize().unwrap();
        let mut engine = SpringEngine::new(cfg);
        let state = start_state(4);
        engine.reset_to(&state, 666.0, false).unwrap();
        let snapshot = engine.snapshot();

        engine.step(&vec![0.5, 0.5, 0.5]);
        assert_ne!(engine.snapshot(), snapshot);

        engine.reset_to(&snapshot, 666.0, false).unwrap();
        assert_eq!(engine.snapshot(), snapshot);
    }
}
