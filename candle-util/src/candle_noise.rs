use candle_core::{DType, Device, Result, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::sync::Mutex;

/// Source of standard-normal noise for reparameterized draws.
///
/// Candle's CPU backend cannot be seeded, so noise is generated on the
/// host with a seedable generator and then moved to the target device.
/// Two sources created with the same seed yield the same sequence of
/// draws.
pub struct NoiseSource {
    rng: Mutex<StdRng>,
}

impl NoiseSource {
    /// A reproducible source
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// A source seeded by the operating system
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Restart the sequence from `seed`
    pub fn reseed(&self, seed: u64) -> Result<()> {
        let mut rng = self.lock()?;
        *rng = StdRng::seed_from_u64(seed);
        Ok(())
    }

    /// Draw a tensor of i.i.d. N(0, 1) noise
    ///
    /// * `shape` - output shape
    /// * `dtype` - output data type
    /// * `device` - target device
    pub fn standard_normal<S: Into<Shape>>(
        &self,
        shape: S,
        dtype: DType,
        device: &Device,
    ) -> Result<Tensor> {
        let shape: Shape = shape.into();
        let ntot = shape.elem_count();

        let eps: Vec<f32> = {
            let mut rng = self.lock()?;
            (0..ntot)
                .map(|_| rng.sample::<f32, _>(StandardNormal))
                .collect()
        };

        Tensor::from_vec(eps, shape, &Device::Cpu)?
            .to_dtype(dtype)?
            .to_device(device)
    }

    /// Draw N(0, 1) noise with the same shape, dtype and device as `x`
    pub fn standard_normal_like(&self, x: &Tensor) -> Result<Tensor> {
        self.standard_normal(x.shape(), x.dtype(), x.device())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, StdRng>> {
        self.rng
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("noise source poisoned: {}", e)))
    }
}

impl Default for NoiseSource {
    fn default() -> Self {
        Self::from_entropy()
    }
}
