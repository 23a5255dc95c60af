use std::path::Path;

use crate::error::{CheckpointError, EngineError};
use crate::rope::RopeMut;
use crate::state::{Action, Assignment, Frame, ParticleState};
use crate::Float;

/// The interface for a differentiable rollout engine.
///
/// Callers drive the engine through a strict sequence: [`reset_to`], then
/// per step [`set_target`], [`step`], [`accumulate_loss`]; a recorded
/// rollout wraps the step loop in [`start_recording`]/[`stop_recording`]
/// and reads gradients back afterwards. The engine owns a single mutable
/// cursor, so calls against one instance must never interleave.
///
/// [`reset_to`]: RolloutEngine::reset_to
/// [`set_target`]: RolloutEngine::set_target
/// [`step`]: RolloutEngine::step
/// [`accumulate_loss`]: RolloutEngine::accumulate_loss
/// [`start_recording`]: RolloutEngine::start_recording
/// [`stop_recording`]: RolloutEngine::stop_recording
pub trait RolloutEngine<T: Float> {
    /// The number of particles the engine simulates.
    fn n_particles(&self) -> usize;

    /// The length of one action vector.
    fn action_dim(&self) -> usize;

    /// Resets the simulator to `state`, clearing the accumulated loss and
    /// any recorded tape.
    ///
    /// Fails if `state` disagrees with the engine's particle count; a
    /// mismatch here would otherwise produce silent physical nonsense.
    fn reset_to(
        &mut self,
        state: &ParticleState<T>,
        softness: T,
        soft_reset: bool,
    ) -> Result<(), EngineError>;

    /// Sets the target frame the next accumulated loss term is measured
    /// against.
    fn set_target(&mut self, target: &Frame<T>);

    /// Advances the simulation by one step under `action`.
    fn step(&mut self, action: &Action<T>);

    /// Adds the current step's loss term, weighted by `decay` raised to the
    /// number of steps taken since the last reset.
    fn accumulate_loss(&mut self, decay: T);

    /// Enters gradient-recording mode.
    fn start_recording(&mut self);

    /// Leaves gradient-recording mode, finalizing gradient bookkeeping so
    /// that [`state_gradient`](RolloutEngine::state_gradient) and
    /// [`action_gradients`](RolloutEngine::action_gradients) become valid.
    fn stop_recording(&mut self);

    /// The scalar loss accumulated since the last reset.
    fn loss(&self) -> T;

    /// The gradient of the accumulated loss with respect to the initial
    /// particle positions of the last recorded rollout.
    fn state_gradient(&self) -> Frame<T>;

    /// The gradient of the accumulated loss with respect to each action of
    /// the last recorded rollout, in step order.
    fn action_gradients(&self) -> Vec<Action<T>>;

    /// A deep copy of the engine's current state.
    fn snapshot(&self) -> ParticleState<T>;

    /// Persists the engine's current state to `path`.
    fn save_state(&self, path: &Path) -> Result<(), EngineError>;
}

/// The interface for the loss/assignment oracle pairing a decoded point
/// cloud with a ground-truth point cloud.
///
/// At most `cap` point pairs participate in the distance computation; the
/// correspondence itself always covers the full clouds.
pub trait AssignmentOracle<T: Float> {
    /// Computes a one-to-one correspondence only.
    fn assign(&self, predicted: &Frame<T>, truth: &Frame<T>, cap: usize) -> Assignment;

    /// Computes the correspondence together with the scalar matched
    /// distance.
    fn distance_assign(&self, predicted: &Frame<T>, truth: &Frame<T>, cap: usize)
        -> (T, Assignment);
}

/// The interface for the point-cloud encoder/decoder model, including its
/// update rule and checkpoint I/O.
pub trait LatentModel<T: Float> {
    /// Encodes `cloud` to the latent code and decodes it back to a full
    /// point cloud, retaining the activations needed by
    /// [`backward`](LatentModel::backward).
    fn forward(&mut self, cloud: &Frame<T>) -> Frame<T>;

    /// Clears all accumulated parameter gradients.
    fn zero_grad(&mut self);

    /// Back-propagates `output_grad` (the gradient of a scalar loss with
    /// respect to the last forward pass's output) into the parameter
    /// gradients, keeping the stored activations so a further backward pass
    /// could reuse them.
    fn backward(&mut self, output_grad: &Frame<T>);

    /// Applies one update step from the accumulated gradients.
    fn step(&mut self);

    /// All parameter buffers, flattened into one logical vector.
    fn parameter_rope_mut(&mut self) -> RopeMut<'_, T>;

    /// All gradient buffers, flattened into one logical vector in the same
    /// order as [`parameter_rope_mut`](LatentModel::parameter_rope_mut).
    fn gradient_rope_mut(&mut self) -> RopeMut<'_, T>;

    /// Persists the full weight set to `path`.
    fn save(&self, path: &Path) -> Result<(), CheckpointError>;

    /// Persists the encoder weights alone to `path`.
    fn save_encoder(&self, path: &Path) -> Result<(), CheckpointError>;

    /// Loads a full weight set from `path`. Fatal on failure; no fallback
    /// model is constructed.
    fn load(&mut self, path: &Path) -> Result<(), CheckpointError>;
}
