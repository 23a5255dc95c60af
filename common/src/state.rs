use crate::vector::Vector;

/// One time step of particle positions.
pub type Frame<T> = Vec<Vector<T, 3>>;

/// One actuator command for a single simulation step.
pub type Action<T> = Vec<T>;

/// The full particle configuration at one instant: five homogeneous
/// per-particle buffers.
///
/// `ParticleState` is a value type. Components that need to modify a state
/// (for example to substitute a decoded first frame) must clone it first;
/// no live state is ever shared between the coordinator, the engine, and
/// the dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleState<T> {
    /// Particle positions.
    pub positions: Frame<T>,
    /// Particle velocities.
    pub velocities: Frame<T>,
    /// Per-particle deformation descriptors (row-major 3x3).
    pub deformation: Vec<Vector<T, 9>>,
    /// Per-particle affine velocity-field descriptors (row-major 3x3).
    pub affine: Vec<Vector<T, 9>>,
    /// The actuator pose buffer.
    pub actuator: Vec<T>,
}

impl<T: crate::Float> ParticleState<T> {
    /// A state of `n` particles at the origin with zeroed buffers and an
    /// actuator pose of `action_dim` zeros.
    pub fn zeroed(n: usize, action_dim: usize) -> Self {
        Self {
            positions: vec![Vector::zero(); n],
            velocities: vec![Vector::zero(); n],
            deformation: vec![Vector::zero(); n],
            affine: vec![Vector::zero(); n],
            actuator: vec![T::zero(); action_dim],
        }
    }

    /// The number of particles described by this state.
    pub fn n_particles(&self) -> usize {
        self.positions.len()
    }

    /// Checks that every per-particle buffer agrees on the particle count.
    pub fn is_consistent(&self) -> bool {
        let n = self.positions.len();
        self.velocities.len() == n && self.deformation.len() == n && self.affine.len() == n
    }
}

/// A one-to-one correspondence between a decoded point cloud and the
/// ground-truth particle ordering.
///
/// Slot `i` of the ground truth is paired with decoded point
/// `assignment[i]`. Recomputed on every rollout because the decoder's
/// output order never matches the physical ordering the simulator expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment(pub Vec<usize>);

impl Assignment {
    /// The identity correspondence over `n` points.
    pub fn identity(n: usize) -> Self {
        Self((0..n).collect())
    }

    /// Reorders `decoded` so that slot `i` holds the decoded point assigned
    /// to ground-truth slot `i`.
    ///
    /// # Panics
    /// If the assignment refers to an index outside `decoded`.
    pub fn apply<T: Copy>(&self, decoded: &[Vector<T, 3>]) -> Vec<Vector<T, 3>> {
        self.0.iter().map(|&j| decoded[j]).collect()
    }

    /// The number of paired points.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Checks if the correspondence is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{Assignment, ParticleState};
    use crate::vector::Vector;

    #[test]
    fn test_zeroed_state_is_consistent() {
        let state = ParticleState::<f64>::zeroed(8, 3);
        assert_eq!(state.n_particles(), 8);
        assert!(state.is_consistent());
    }

    #[test]
    fn test_assignment_apply_reorders() {
        let decoded = vec![
            Vector::new([0.0f64, 0.0, 0.0]),
            Vector::new([1.0, 1.0, 1.0]),
            Vector::new([2.0, 2.0, 2.0]),
        ];
        let assignment = Assignment(vec![2, 0, 1]);
        let reordered = assignment.apply(&decoded);

        assert_eq!(reordered[0], decoded[2]);
        assert_eq!(reordered[1], decoded[0]);
        assert_eq!(reordered[2], decoded[1]);
    }
}
