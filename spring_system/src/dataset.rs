use common::interfaces::RolloutEngine;
use common::state::{Action, Frame, ParticleState};
use common::vector::Vector;
use common::Float;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::engine::{SpringConfig, SpringEngine};

/// One training sample: a start state, the per-step ground-truth target
/// frames, and the action sequence that produced them.
pub type RolloutSample<T> = (ParticleState<T>, Vec<Frame<T>>, Vec<Action<T>>);

/// Generates `n_samples` reproducible rollouts of length `horizon`.
///
/// Start positions are drawn uniformly from the unit cube with zero
/// velocities; actions are small random force-field centres. The targets
/// come from rolling the engine itself forward, so a perfect model and
/// plan reach exactly zero loss.
pub fn synthetic_rollouts<T: Float>(
    cfg: &SpringConfig<T>,
    n_samples: usize,
    horizon: usize,
    seed: u64,
) -> Vec<RolloutSample<T>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut engine = SpringEngine::new(cfg.clone());
    let mut samples = Vec::with_capacity(n_samples);

    for _ in 0..n_samples {
        let mut state = ParticleState::zeroed(cfg.n_particles, 3);
        for p in state.positions.iter_mut() {
            *p = Vector::from_idx(|_| {
                T::from(rng.gen_range(0.0f64..1.0)).expect("sample fits in the float type")
            });
        }

        let actions: Vec<Action<T>> = (0..horizon)
            .map(|_| {
                (0..3)
                    .map(|_| {
                        T::from(rng.gen_range(-0.3f64..0.3))
                            .expect("sample fits in the float type")
                    })
                    .collect()
            })
            .collect();

        engine
            .reset_to(&state, T::zero(), false)
            .expect("generated state matches the engine's particle count");
        let mut targets = Vec::with_capacity(horizon);
        for action in &actions {
            engine.step(action);
            targets.push(engine.snapshot().positions);
        }

        samples.push((state, targets, actions));
    }

    samples
}
