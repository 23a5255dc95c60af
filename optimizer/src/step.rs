use common::config::OptimKind;
use common::state::Action;
use common::Float;

/// A first-order update rule over a trajectory of action vectors.
///
/// Implementations hold their own moment buffers, sized on first use, so
/// one instance must only ever see trajectories of a single shape.
pub trait StepOptimizer<T: Float> {
    /// Applies one in-place update to `actions` from `grads`.
    ///
    /// # Panics
    /// If `grads` does not match the shape of `actions`.
    fn step(&mut self, actions: &mut [Action<T>], grads: &[Action<T>]);
}

/// Builds the configured update rule.
pub fn build_optimizer<T: Float>(kind: OptimKind, lr: T) -> Box<dyn StepOptimizer<T>> {
    match kind {
        OptimKind::Adam => Box::new(Adam::new(lr)),
        OptimKind::Momentum => Box::new(Momentum::new(lr)),
    }
}

/// Flattened shape check shared by both rules.
fn check_shapes<T: Float>(actions: &[Action<T>], grads: &[Action<T>]) {
    assert_eq!(
        actions.len(),
        grads.len(),
        "gradient trajectory length does not match the action trajectory"
    );
    for (a, g) in actions.iter().zip(grads) {
        assert_eq!(a.len(), g.len(), "gradient step width does not match the action");
    }
}

/// Adam with bias-corrected moment estimates.
pub struct Adam<T: Float> {
    /// Step size.
    lr: T,
    /// First-moment decay.
    beta1: T,
    /// Second-moment decay.
    beta2: T,
    /// Denominator fuzz.
    epsilon: T,
    /// First-moment buffer, one entry per action trajectory element.
    m: Vec<T>,
    /// Second-moment buffer.
    v: Vec<T>,
    /// Update count, for bias correction.
    t: i32,
}

impl<T: Float> Adam<T> {
    /// Builds the rule with the standard moment decays.
    pub fn new(lr: T) -> Self {
        Self {
            lr,
            beta1: T::from(0.9).unwrap_or_else(T::zero),
            beta2: T::from(0.999).unwrap_or_else(T::zero),
            epsilon: T::from(1e-8).unwrap_or_else(T::zero),
            m: Vec::new(),
            v: Vec::new(),
            t: 0,
        }
    }
}

impl<T: Float> StepOptimizer<T> for Adam<T> {
    fn step(&mut self, actions: &mut [Action<T>], grads: &[Action<T>]) {
        check_shapes(actions, grads);
        let total: usize = actions.iter().map(|a| a.len()).sum();
        if self.m.is_empty() {
            self.m = vec![T::zero(); total];
            self.v = vec![T::zero(); total];
        }

        self.t += 1;
        let one = T::one();
        let bias1 = one - self.beta1.powi(self.t);
        let bias2 = one - self.beta2.powi(self.t);

        let mut idx = 0;
        for (action, grad) in actions.iter_mut().zip(grads) {
            for (p, &g) in action.iter_mut().zip(grad) {
                self.m[idx] = self.beta1 * self.m[idx] + (one - self.beta1) * g;
                self.v[idx] = self.beta2 * self.v[idx] + (one - self.beta2) * g * g;
                let m_hat = self.m[idx] / bias1;
                let v_hat = self.v[idx] / bias2;
                *p = *p - self.lr * m_hat / (v_hat.sqrt() + self.epsilon);
                idx += 1;
            }
        }
    }
}

/// Classical momentum.
pub struct Momentum<T: Float> {
    /// Step size.
    lr: T,
    /// Velocity decay.
    beta: T,
    /// Velocity buffer.
    velocity: Vec<T>,
}

impl<T: Float> Momentum<T> {
    /// Builds the rule with the standard decay.
    pub fn new(lr: T) -> Self {
        Self {
            lr,
            beta: T::from(0.9).unwrap_or_else(T::zero),
            velocity: Vec::new(),
        }
    }
}

impl<T: Float> StepOptimizer<T> for Momentum<T> {
    fn step(&mut self, actions: &mut [Action<T>], grads: &[Action<T>]) {
        check_shapes(actions, grads);
        let total: usize = actions.iter().map(|a| a.len()).sum();
        if self.velocity.is_empty() {
            self.velocity = vec![T::zero(); total];
        }

        let mut idx = 0;
        for (action, grad) in actions.iter_mut().zip(grads) {
            for (p, &g) in action.iter_mut().zip(grad) {
                self.velocity[idx] = self.beta * self.velocity[idx] + g;
                *p = *p - self.lr * self.velocity[idx];
                idx += 1;
            }
        }
    }
}
