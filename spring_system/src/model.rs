use std::path::Path;

use common::error::CheckpointError;
use common::interfaces::LatentModel;
use common::rope::RopeMut;
use common::state::Frame;
use common::vector::Vector;
use common::Float;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Magic tag of a full-model checkpoint.
const MODEL_MAGIC: &[u8; 4] = b"LPAE";
/// Magic tag of an encoder-only checkpoint.
const ENCODER_MAGIC: &[u8; 4] = b"LPEN";

/// A deterministic linear point-cloud autoencoder.
///
/// The encoder maps the flattened cloud (`3 * n` values) to a latent code;
/// the decoder maps the code back to a full cloud. Linear layers keep the
/// backward pass exact while still exposing the full [`LatentModel`]
/// surface: gradient accumulation, an update rule, rope views for the
/// collectives, and checkpoint I/O.
pub struct LinearAutoEncoder<T: Float> {
    /// Number of particles in one cloud.
    n_particles: usize,
    /// Latent code width.
    latent_dim: usize,
    /// Step size of the update rule.
    lr: T,
    /// Encoder weights, row-major `latent_dim x 3n`.
    w_enc: Vec<T>,
    /// Encoder bias, `latent_dim`.
    b_enc: Vec<T>,
    /// Decoder weights, row-major `3n x latent_dim`.
    w_dec: Vec<T>,
    /// Decoder bias, `3n`.
    b_dec: Vec<T>,
    /// Accumulated encoder weight gradients.
    g_w_enc: Vec<T>,
    /// Accumulated encoder bias gradients.
    g_b_enc: Vec<T>,
    /// Accumulated decoder weight gradients.
    g_w_dec: Vec<T>,
    /// Accumulated decoder bias gradients.
    g_b_dec: Vec<T>,
    /// Input activations of the last forward pass.
    last_input: Vec<T>,
    /// Latent activations of the last forward pass.
    last_latent: Vec<T>,
}

impl<T: Float> LinearAutoEncoder<T> {
    /// Builds a model with seeded uniform weights in `[-0.05, 0.05]` and
    /// zero biases. The same seed always yields bit-identical weights.
    pub fn new(n_particles: usize, latent_dim: usize, lr: T, seed: u64) -> Self {
        let features = 3 * n_particles;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut sample = |len: usize| -> Vec<T> {
            (0..len)
                .map(|_| {
                    T::from(rng.gen_range(-0.05f64..=0.05))
                        .expect("weight sample fits in the float type")
                })
                .collect()
        };

        let w_enc = sample(latent_dim * features);
        let w_dec = sample(features * latent_dim);

        Self {
            n_particles,
            latent_dim,
            lr,
            w_enc,
            b_enc: vec![T::zero(); latent_dim],
            w_dec,
            b_dec: vec![T::zero(); features],
            g_w_enc: vec![T::zero(); latent_dim * features],
            g_b_enc: vec![T::zero(); latent_dim],
            g_w_dec: vec![T::zero(); features * latent_dim],
            g_b_dec: vec![T::zero(); features],
            last_input: vec![T::zero(); features],
            last_latent: vec![T::zero(); latent_dim],
        }
    }

    /// Number of particles in one cloud.
    pub fn n_particles(&self) -> usize {
        self.n_particles
    }

    /// Latent code width.
    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    /// Flattens a frame into feature order.
    fn flatten(cloud: &Frame<T>) -> Vec<T> {
        cloud
            .iter()
            .flat_map(|p| p.as_array().iter().copied().collect::<Vec<_>>())
            .collect()
    }

    /// Serializes `buffers` under `magic` with the model dimensions.
    fn write_buffers(
        &self,
        path: &Path,
        magic: &[u8; 4],
        buffers: &[&[T]],
    ) -> Result<(), CheckpointError> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(magic);
        bytes.extend_from_slice(&(self.n_particles as u64).to_le_bytes());
        bytes.extend_from_slice(&(self.latent_dim as u64).to_le_bytes());
        for buffer in buffers {
            bytes.extend_from_slice(bytemuck::cast_slice(buffer));
        }

        std::fs::write(path, bytes).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads a checkpoint under `magic`, returning the raw payload after
    /// the dimension header.
    fn read_payload(&self, path: &Path, magic: &[u8; 4]) -> Result<Vec<u8>, CheckpointError> {
        let bytes = std::fs::read(path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        if bytes.len() < 20 || &bytes[0..4] != magic {
            return Err(CheckpointError::Malformed {
                path: path.to_path_buf(),
                reason: "missing or wrong magic tag".to_owned(),
            });
        }

        let n = u64::from_le_bytes(bytes[4..12].try_into().expect("length checked above"));
        let latent = u64::from_le_bytes(bytes[12..20].try_into().expect("length checked above"));
        if n as usize != self.n_particles || latent as usize != self.latent_dim {
            return Err(CheckpointError::Malformed {
                path: path.to_path_buf(),
                reason: format!(
                    "dimensions {n}x{latent} do not match model {}x{}",
                    self.n_particles, self.latent_dim
                ),
            });
        }

        Ok(bytes[20..].to_vec())
    }
}

impl<T: Float> LatentModel<T> for LinearAutoEncoder<T> {
    fn forward(&mut self, cloud: &Frame<T>) -> Frame<T> {
        assert_eq!(
            cloud.len(),
            self.n_particles,
            "input cloud does not match the model's particle count"
        );

        let features = 3 * self.n_particles;
        let x = Self::flatten(cloud);

        let mut z = self.b_enc.clone();
        for (r, z_r) in z.iter_mut().enumerate() {
            let row = &self.w_enc[r * features..(r + 1) * features];
            for (w, xv) in row.iter().zip(&x) {
                *z_r = *z_r + *w * *xv;
            }
        }

        let mut y = self.b_dec.clone();
        for (r, y_r) in y.iter_mut().enumerate() {
            let row = &self.w_dec[r * self.latent_dim..(r + 1) * self.latent_dim];
            for (w, zv) in row.iter().zip(&z) {
                *y_r = *y_r + *w * *zv;
            }
        }

        self.last_input = x;
        self.last_latent = z;

        (0..self.n_particles)
            .map(|i| Vector::from_idx(|d| y[3 * i + d]))
            .collect()
    }

    fn zero_grad(&mut self) {
        for g in self
            .g_w_enc
            .iter_mut()
            .chain(self.g_b_enc.iter_mut())
            .chain(self.g_w_dec.iter_mut())
            .chain(self.g_b_dec.iter_mut())
        {
            *g = T::zero();
        }
    }

    fn backward(&mut self, output_grad: &Frame<T>) {
        assert_eq!(
            output_grad.len(),
            self.n_particles,
            "output gradient does not match the model's particle count"
        );

        let features = 3 * self.n_particles;
        let g_y = Self::flatten(output_grad);

        // Decoder: y = W_d z + b_d.
        let mut g_z = vec![T::zero(); self.latent_dim];
        for (r, gy_r) in g_y.iter().enumerate() {
            let row = &self.w_dec[r * self.latent_dim..(r + 1) * self.latent_dim];
            let g_row = &mut self.g_w_dec[r * self.latent_dim..(r + 1) * self.latent_dim];
            for c in 0..self.latent_dim {
                g_row[c] = g_row[c] + *gy_r * self.last_latent[c];
                g_z[c] = g_z[c] + row[c] * *gy_r;
            }
            self.g_b_dec[r] = self.g_b_dec[r] + *gy_r;
        }

        // Encoder: z = W_e x + b_e.
        for (r, gz_r) in g_z.iter().enumerate() {
            let g_row = &mut self.g_w_enc[r * features..(r + 1) * features];
            for c in 0..features {
                g_row[c] = g_row[c] + *gz_r * self.last_input[c];
            }
            self.g_b_enc[r] = self.g_b_enc[r] + *gz_r;
        }
    }

    fn step(&mut self) {
        let lr = self.lr;
        for (p, g) in self
            .w_enc
            .iter_mut()
            .zip(&self.g_w_enc)
            .chain(self.b_enc.iter_mut().zip(&self.g_b_enc))
            .chain(self.w_dec.iter_mut().zip(&self.g_w_dec))
            .chain(self.b_dec.iter_mut().zip(&self.g_b_dec))
        {
            *p = *p - lr * *g;
        }
    }

    fn parameter_rope_mut(&mut self) -> RopeMut<'_, T> {
        RopeMut::new([
            &mut self.w_enc[..],
            &mut self.b_enc[..],
            &mut self.w_dec[..],
            &mut self.b_dec[..],
        ])
    }

    fn gradient_rope_mut(&mut self) -> RopeMut<'_, T> {
        RopeMut::new([
            &mut self.g_w_enc[..],
            &mut self.g_b_enc[..],
            &mut self.g_w_dec[..],
            &mut self.g_b_dec[..],
        ])
    }

    fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        self.write_buffers(
            path,
            MODEL_MAGIC,
            &[&self.w_enc, &self.b_enc, &self.w_dec, &self.b_dec],
        )
    }

    fn save_encoder(&self, path: &Path) -> Result<(), CheckpointError> {
        self.write_buffers(path, ENCODER_MAGIC, &[&self.w_enc, &self.b_enc])
    }

    fn load(&mut self, path: &Path) -> Result<(), CheckpointError> {
        let payload = self.read_payload(path, MODEL_MAGIC)?;
        let expected =
            (self.w_enc.len() + self.b_enc.len() + self.w_dec.len() + self.b_dec.len())
                * std::mem::size_of::<T>();
        if payload.len() != expected {
            return Err(CheckpointError::Malformed {
                path: path.to_path_buf(),
                reason: format!("payload holds {} bytes, expected {expected}", payload.len()),
            });
        }

        let mut offset = 0;
        for buffer in [
            &mut self.w_enc,
            &mut self.b_enc,
            &mut self.w_dec,
            &mut self.b_dec,
        ] {
            let len = buffer.len() * std::mem::size_of::<T>();
            buffer.copy_from_slice(bytemuck::cast_slice(&payload[offset..offset + len]));
            offset += len;
        }

        Ok(())
    }
}
