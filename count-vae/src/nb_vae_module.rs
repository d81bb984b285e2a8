use crate::nb_vae_config::NbVaeConfig;
use crate::nb_vae_networks::{library_size, DecodedRates, NbVaeNetworks};

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;
use candle_util::candle_data_loader::MinibatchData;
use candle_util::candle_loss_functions::{gaussian_kl_loss, negative_binomial_likelihood};
use candle_util::candle_model_traits::{LossOutput, VaeModuleT};
use candle_util::candle_noise::NoiseSource;
use candle_util::svi::Distribution;
use std::sync::Arc;

/// Variational parameters and a reparameterized latent draw
pub struct NbInferenceOutput {
    pub qz_mean: Tensor,
    /// strictly positive variance
    pub qz_var: Tensor,
    pub z: Tensor,
}

pub struct NbGenerativeInput {
    pub z: Tensor,
    /// row sums of the raw counts (n x 1)
    pub library: Tensor,
}

pub type NbGenerativeOutput = DecodedRates;

/// Negative binomial VAE driven through inference, generative and
/// loss routines
///
/// ```text
/// q(z | x) = N(z_mean(log1p x), z_var(log1p x))
/// p(z)     = N(0, I)
/// p(x | z) = NB(library * decoder(z), exp(log_theta))
/// ```
pub struct NbVaeModule {
    networks: NbVaeNetworks,
    noise: Arc<NoiseSource>,
}

impl NbVaeModule {
    /// Register the parameters in `vs` and keep `noise` for the
    /// reparameterized draws
    pub fn new(config: &NbVaeConfig, vs: VarBuilder, noise: Arc<NoiseSource>) -> Result<Self> {
        Ok(Self {
            networks: NbVaeNetworks::new(config, vs)?,
            noise,
        })
    }

    pub fn config(&self) -> &NbVaeConfig {
        self.networks.config()
    }

    pub fn networks(&self) -> &NbVaeNetworks {
        &self.networks
    }

    pub fn noise(&self) -> &NoiseSource {
        &self.noise
    }
}

impl VaeModuleT for NbVaeModule {
    type InferenceInput = Tensor;
    type InferenceOutput = NbInferenceOutput;
    type GenerativeInput = NbGenerativeInput;
    type GenerativeOutput = NbGenerativeOutput;

    fn get_inference_input(&self, batch: &MinibatchData) -> Result<Tensor> {
        Ok(batch.input()?.clone())
    }

    fn inference(&self, x_nd: &Tensor) -> Result<NbInferenceOutput> {
        let (qz_mean, qz_var) = self.networks.encode(x_nd)?;
        let z = Distribution::normal(qz_mean.clone(), qz_var.sqrt()?).rsample(&self.noise)?;
        Ok(NbInferenceOutput { qz_mean, qz_var, z })
    }

    fn get_generative_input(
        &self,
        batch: &MinibatchData,
        inference_output: &NbInferenceOutput,
    ) -> Result<NbGenerativeInput> {
        Ok(NbGenerativeInput {
            z: inference_output.z.clone(),
            library: library_size(batch.input()?)?,
        })
    }

    fn generative(&self, input: &NbGenerativeInput) -> Result<NbGenerativeOutput> {
        self.networks.decode(&input.z, &input.library)
    }

    fn loss(
        &self,
        batch: &MinibatchData,
        inference_output: &NbInferenceOutput,
        generative_output: &NbGenerativeOutput,
        kl_weight: f64,
    ) -> Result<LossOutput> {
        let x_nd = batch.input()?;

        let llik = negative_binomial_likelihood(
            x_nd,
            &generative_output.px_rate,
            &generative_output.theta,
            self.config().epsilon,
        )?;

        let kl = gaussian_kl_loss(&inference_output.qz_mean, &inference_output.qz_var)?;

        let loss = llik.sub(&(&kl * kl_weight)?)?.mean_all()?.neg()?;

        Ok(LossOutput {
            loss,
            reconstruction_loss: llik.neg()?,
            kl_local: kl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn toy_module(n_input: usize, seed: u64) -> Result<(VarMap, NbVaeModule)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = NbVaeConfig::new(n_input).with_latent(3).with_hidden(16);
        let module = NbVaeModule::new(&config, vb, Arc::new(NoiseSource::from_seed(seed)))?;
        Ok((varmap, module))
    }

    fn toy_counts() -> Result<Tensor> {
        Tensor::new(
            &[
                [0f32, 3., 1., 0., 7.],
                [2., 0., 0., 1., 1.],
                [10., 4., 0., 0., 2.],
            ],
            &Device::Cpu,
        )
    }

    #[test]
    fn test_inference_shapes_and_positive_variance() -> Result<()> {
        let (_, module) = toy_module(5, 1)?;
        let out = module.inference(&toy_counts()?)?;
        assert_eq!(out.qz_mean.dims(), &[3, 3]);
        assert_eq!(out.z.dims(), &[3, 3]);
        let var: Vec<Vec<f32>> = out.qz_var.to_vec2()?;
        assert!(var.iter().flatten().all(|&v| v > 0.));
        Ok(())
    }

    #[test]
    fn test_generative_rates_follow_library() -> Result<()> {
        let (_, module) = toy_module(5, 2)?;
        let batch = MinibatchData::new(toy_counts()?);
        let (_, gen, _) = module.forward(&batch, 1.0)?;

        let scale: Vec<Vec<f32>> = gen.px_scale.to_vec2()?;
        let rate: Vec<Vec<f32>> = gen.px_rate.to_vec2()?;
        let library = [11f32, 4., 16.];

        for ((s, r), l) in scale.iter().zip(rate.iter()).zip(library) {
            assert!((s.iter().sum::<f32>() - 1.).abs() < 1e-5);
            assert!((r.iter().sum::<f32>() - l).abs() < 1e-3 * l.max(1.));
        }
        assert_eq!(gen.theta.dims(), &[1, 5]);
        Ok(())
    }

    #[test]
    fn test_loss_components() -> Result<()> {
        let (_, module) = toy_module(5, 3)?;
        let batch = MinibatchData::new(toy_counts()?);
        let (_, _, out) = module.forward(&batch, 1.0)?;

        let recon: Vec<f32> = out.reconstruction_loss.to_vec1()?;
        let kl: Vec<f32> = out.kl_local.to_vec1()?;
        assert_eq!(recon.len(), 3);
        assert!(kl.iter().all(|&k| k >= -1e-5));

        let expected = recon.iter().zip(kl.iter()).map(|(r, k)| r + k).sum::<f32>() / 3.;
        let loss = out.loss.to_scalar::<f32>()?;
        assert!((loss - expected).abs() < 1e-3 * expected.abs().max(1.));
        Ok(())
    }

    #[test]
    fn test_kl_weight_scales_only_kl() -> Result<()> {
        let (_, module) = toy_module(5, 4)?;
        let batch = MinibatchData::new(toy_counts()?);

        let inf = module.inference(&toy_counts()?)?;
        let gen_in = module.get_generative_input(&batch, &inf)?;
        let gen = module.generative(&gen_in)?;

        let full = module.loss(&batch, &inf, &gen, 1.0)?;
        let none = module.loss(&batch, &inf, &gen, 0.0)?;

        let recon_mean = full.reconstruction_loss.mean_all()?.to_scalar::<f32>()?;
        let loss = none.loss.to_scalar::<f32>()?;
        assert!((loss - recon_mean).abs() < 1e-4 * recon_mean.abs().max(1.));
        Ok(())
    }
}
