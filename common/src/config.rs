use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::Float;

/// The closed set of per-step loss functions understood by a rollout engine.
///
/// Resolved once at configuration time; there is no string-keyed dispatch
/// past this point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LossKind {
    /// Nearest-neighbour (chamfer) point-set distance.
    Chamfer,
    /// Index-matched earth-mover surrogate distance.
    Emd,
    /// Full-state distance: matched positions plus a velocity penalty.
    State,
    /// The engine's default loss.
    #[default]
    Generic,
}

impl FromStr for LossKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chamfer" => Ok(Self::Chamfer),
            "emd" => Ok(Self::Emd),
            "state" => Ok(Self::State),
            "loss" => Ok(Self::Generic),
            other => Err(ConfigError::UnknownLoss(other.to_owned())),
        }
    }
}

/// The closed set of step-generation optimizers for trajectory search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimKind {
    /// Adam with bias-corrected moment estimates.
    #[default]
    Adam,
    /// Classical momentum.
    Momentum,
}

impl FromStr for OptimKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Adam" => Ok(Self::Adam),
            "Momentum" => Ok(Self::Momentum),
            other => Err(ConfigError::UnknownOptim(other.to_owned())),
        }
    }
}

/// The closed set of action-initialization samplers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitSampler {
    /// Uniform within `[-init_range, init_range]`.
    #[default]
    Uniform,
}

impl FromStr for InitSampler {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uniform" => Ok(Self::Uniform),
            other => Err(ConfigError::UnknownSampler(other.to_owned())),
        }
    }
}

/// Immutable configuration for the rollout coordinator and the trajectory
/// optimizer. Constructed once through [`SolverConfig::build`]; unknown or
/// out-of-range options are rejected at construction, not at first use.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverConfig<T: Float> {
    /// The contact-softness parameter handed to the engine on reset.
    pub softness: T,
    /// The trajectory horizon (actions per plan).
    pub horizon: usize,
    /// Iterations of trajectory optimization.
    pub n_iters: usize,
    /// Half-width of the uniform action-initialization range.
    pub init_range: T,
    /// How initial actions are sampled when none are supplied.
    pub init_sampler: InitSampler,
    /// Per-step loss decay: later steps contribute less.
    pub decay_factor: T,
    /// Optional fixed rollout length. `None` or a non-positive stored value
    /// means "use the full target length".
    pub steps: Option<usize>,
    /// Whether the correspondence distance is reported as `loss_first`
    /// (the focal variant) or dropped to a constant zero (the plain
    /// variant).
    pub report_first_loss: bool,
}

impl<T: Float> SolverConfig<T> {
    /// Starts a builder seeded with the historical defaults.
    pub fn build() -> SolverConfigBuilder<T> {
        SolverConfigBuilder {
            softness: T::from(666.0).unwrap_or_else(T::one),
            horizon: 50,
            n_iters: 100,
            init_range: T::zero(),
            init_sampler: InitSampler::Uniform,
            decay_factor: T::from(0.99).unwrap_or_else(T::one),
            steps: None,
            report_first_loss: true,
        }
    }
}

/// Builder for [`SolverConfig`].
#[derive(Debug, Clone)]
pub struct SolverConfigBuilder<T: Float> {
    /// See [`SolverConfig::softness`].
    softness: T,
    /// See [`SolverConfig::horizon`].
    horizon: usize,
    /// See [`SolverConfig::n_iters`].
    n_iters: usize,
    /// See [`SolverConfig::init_range`].
    init_range: T,
    /// See [`SolverConfig::init_sampler`].
    init_sampler: InitSampler,
    /// See [`SolverConfig::decay_factor`].
    decay_factor: T,
    /// See [`SolverConfig::steps`].
    steps: Option<usize>,
    /// See [`SolverConfig::report_first_loss`].
    report_first_loss: bool,
}

impl<T: Float> SolverConfigBuilder<T> {
    /// Sets the contact softness.
    pub fn softness(mut self, softness: T) -> Self {
        self.softness = softness;
        self
    }

    /// Sets the trajectory horizon.
    pub fn horizon(mut self, horizon: usize) -> Self {
        self.horizon = horizon;
        self
    }

    /// Sets the trajectory-optimization iteration count.
    pub fn n_iters(mut self, n_iters: usize) -> Self {
        self.n_iters = n_iters;
        self
    }

    /// Sets the action-initialization range.
    pub fn init_range(mut self, init_range: T) -> Self {
        self.init_range = init_range;
        self
    }

    /// Sets the action-initialization sampler.
    pub fn init_sampler(mut self, init_sampler: InitSampler) -> Self {
        self.init_sampler = init_sampler;
        self
    }

    /// Sets the per-step loss decay factor.
    pub fn decay_factor(mut self, decay_factor: T) -> Self {
        self.decay_factor = decay_factor;
        self
    }

    /// Sets the fixed rollout step count.
    pub fn steps(mut self, steps: Option<usize>) -> Self {
        self.steps = steps;
        self
    }

    /// Selects the correspondence variant.
    pub fn report_first_loss(mut self, report: bool) -> Self {
        self.report_first_loss = report;
        self
    }

    /// Validates and freezes the configuration.
    pub fn finalize(self) -> Result<SolverConfig<T>, ConfigError> {
        if self.horizon == 0 {
            return Err(ConfigError::InvalidValue {
                field: "horizon",
                reason: "must be positive".to_owned(),
            });
        }
        if !(self.decay_factor > T::zero() && self.decay_factor <= T::one()) {
            return Err(ConfigError::InvalidValue {
                field: "decay_factor",
                reason: "must lie in (0, 1]".to_owned(),
            });
        }
        if self.init_range < T::zero() {
            return Err(ConfigError::InvalidValue {
                field: "init_range",
                reason: "must be non-negative".to_owned(),
            });
        }

        Ok(SolverConfig {
            softness: self.softness,
            horizon: self.horizon,
            n_iters: self.n_iters,
            init_range: self.init_range,
            init_sampler: self.init_sampler,
            decay_factor: self.decay_factor,
            steps: self.steps,
            report_first_loss: self.report_first_loss,
        })
    }
}

/// Immutable configuration for a training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig<T: Float> {
    /// Number of epochs to run.
    pub epochs: usize,
    /// Requested logical batch size; also bounds the worker count.
    pub batch_size: usize,
    /// Size of the focal subset rebuilt before each gradient phase.
    pub focal_size: usize,
    /// Learning rate for the model's update rule.
    pub lr: T,
    /// Experiment tag used in checkpoint names.
    pub exp_name: String,
    /// Output directory created before workers launch.
    pub output_dir: PathBuf,
    /// Directory holding pretrained and produced weight files.
    pub pretrained_dir: PathBuf,
    /// Seed shared by every worker.
    pub seed: u64,
    /// Worker-process cap per accelerator.
    pub procs_per_device: usize,
}

impl<T: Float> TrainConfig<T> {
    /// Starts a builder with the historical defaults.
    pub fn build() -> TrainConfigBuilder<T> {
        TrainConfigBuilder {
            epochs: 20,
            batch_size: 1,
            focal_size: 1000,
            lr: T::from(1e-3).unwrap_or_else(T::one),
            exp_name: "latent".to_owned(),
            output_dir: PathBuf::from("out"),
            pretrained_dir: PathBuf::from("pretrain_model"),
            seed: 0,
            procs_per_device: 2,
        }
    }
}

/// Builder for [`TrainConfig`].
#[derive(Debug, Clone)]
pub struct TrainConfigBuilder<T: Float> {
    /// See [`TrainConfig::epochs`].
    epochs: usize,
    /// See [`TrainConfig::batch_size`].
    batch_size: usize,
    /// See [`TrainConfig::focal_size`].
    focal_size: usize,
    /// See [`TrainConfig::lr`].
    lr: T,
    /// See [`TrainConfig::exp_name`].
    exp_name: String,
    /// See [`TrainConfig::output_dir`].
    output_dir: PathBuf,
    /// See [`TrainConfig::pretrained_dir`].
    pretrained_dir: PathBuf,
    /// See [`TrainConfig::seed`].
    seed: u64,
    /// See [`TrainConfig::procs_per_device`].
    procs_per_device: usize,
}

impl<T: Float> TrainConfigBuilder<T> {
    /// Sets the epoch count.
    pub fn epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    /// Sets the logical batch size.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the focal subset size.
    pub fn focal_size(mut self, focal_size: usize) -> Self {
        self.focal_size = focal_size;
        self
    }

    /// Sets the learning rate.
    pub fn lr(mut self, lr: T) -> Self {
        self.lr = lr;
        self
    }

    /// Sets the experiment tag.
    pub fn exp_name(mut self, exp_name: impl Into<String>) -> Self {
        self.exp_name = exp_name.into();
        self
    }

    /// Sets the output directory.
    pub fn output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    /// Sets the weight-file directory.
    pub fn pretrained_dir(mut self, pretrained_dir: impl Into<PathBuf>) -> Self {
        self.pretrained_dir = pretrained_dir.into();
        self
    }

    /// Sets the run seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the per-accelerator worker cap.
    pub fn procs_per_device(mut self, procs_per_device: usize) -> Self {
        self.procs_per_device = procs_per_device;
        self
    }

    /// Validates and freezes the configuration.
    pub fn finalize(self) -> Result<TrainConfig<T>, ConfigError> {
        if self.epochs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "epochs",
                reason: "must be positive".to_owned(),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "batch_size",
                reason: "must be positive".to_owned(),
            });
        }
        if self.focal_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "focal_size",
                reason: "must be positive".to_owned(),
            });
        }
        if !(self.lr > T::zero()) {
            return Err(ConfigError::InvalidValue {
                field: "lr",
                reason: "must be positive".to_owned(),
            });
        }
        if self.procs_per_device == 0 {
            return Err(ConfigError::InvalidValue {
                field: "procs_per_device",
                reason: "must be positive".to_owned(),
            });
        }

        Ok(TrainConfig {
            epochs: self.epochs,
            batch_size: self.batch_size,
            focal_size: self.focal_size,
            lr: self.lr,
            exp_name: self.exp_name,
            output_dir: self.output_dir,
            pretrained_dir: self.pretrained_dir,
            seed: self.seed,
            procs_per_device: self.procs_per_device,
        })
    }
}
