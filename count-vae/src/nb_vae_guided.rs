use crate::nb_vae_config::NbVaeConfig;
use crate::nb_vae_networks::{library_size, NbVaeNetworks};

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;
use candle_util::candle_data_loader::MinibatchData;
use candle_util::candle_loss_functions::nb_logits;
use candle_util::svi::{Distribution, GuideTrace, LatentValues, ModelTrace, ProbabilisticModuleT};

/// latent site shared by the model and the guide
pub const LATENT_SITE: &str = "latent";
/// observed count site
pub const OBS_SITE: &str = "obs";

pub struct NbGuidedArgs {
    pub x: Tensor,
    /// raw row sums (n x 1); the guide ignores it
    pub library: Tensor,
}

/// The same negative binomial VAE expressed as a model/guide pair
///
/// Building this module and an [`crate::nb_vae_module::NbVaeModule`]
/// from the same variable map shares every parameter between them.
pub struct NbVaeGuided {
    networks: NbVaeNetworks,
}

impl NbVaeGuided {
    pub fn new(config: &NbVaeConfig, vs: VarBuilder) -> Result<Self> {
        Ok(Self {
            networks: NbVaeNetworks::new(config, vs)?,
        })
    }

    pub fn config(&self) -> &NbVaeConfig {
        self.networks.config()
    }

    pub fn networks(&self) -> &NbVaeNetworks {
        &self.networks
    }
}

impl ProbabilisticModuleT for NbVaeGuided {
    type Args = NbGuidedArgs;

    fn args_from_batch(&self, batch: &MinibatchData) -> Result<NbGuidedArgs> {
        let x = batch.input()?.clone();
        let library = library_size(&x)?;
        Ok(NbGuidedArgs { x, library })
    }

    fn model(&self, args: &NbGuidedArgs, latents: &LatentValues) -> Result<ModelTrace> {
        let nn = args.x.dim(0)?;
        let kk = self.config().n_latent;

        let prior_loc = Tensor::zeros((nn, kk), args.x.dtype(), args.x.device())?;
        let prior = Distribution::standard_normal_like(&prior_loc)?;

        let z = latents.get(LATENT_SITE)?;
        let rates = self.networks.decode(z, &args.library)?;
        let logits = nb_logits(&rates.px_rate, &rates.theta, self.config().epsilon)?;
        let lik = Distribution::negative_binomial(rates.theta.clone(), logits);

        Ok(ModelTrace::new()
            .sample(LATENT_SITE, prior)
            .deterministic("px_scale", rates.px_scale)
            .deterministic("px_rate", rates.px_rate)
            .deterministic("theta", rates.theta)
            .observe(OBS_SITE, lik, args.x.clone()))
    }

    fn guide(&self, args: &NbGuidedArgs) -> Result<GuideTrace> {
        let (qz_mean, qz_var) = self.networks.encode(&args.x)?;
        Ok(GuideTrace::new().sample(LATENT_SITE, Distribution::normal(qz_mean, qz_var.sqrt()?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use candle_util::candle_noise::NoiseSource;
    use candle_util::svi::TraceElbo;

    fn toy() -> Result<(VarMap, NbVaeGuided, MinibatchData)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = NbVaeConfig::new(4).with_latent(2).with_hidden(8);
        let module = NbVaeGuided::new(&config, vb)?;
        let x = Tensor::new(&[[1f32, 0., 5., 2.], [0., 0., 1., 9.]], &Device::Cpu)?;
        Ok((varmap, module, MinibatchData::new(x)))
    }

    #[test]
    fn test_traces() -> Result<()> {
        let (_, module, batch) = toy()?;
        let args = module.args_from_batch(&batch)?;

        let guide = module.guide(&args)?;
        assert_eq!(guide.latent_sites().len(), 1);
        let q = guide
            .site(LATENT_SITE)
            .ok_or_else(|| candle_core::Error::Msg("missing".into()))?;

        let mut latents = LatentValues::new();
        latents.insert(LATENT_SITE, q.dist.mean()?);

        let model = module.model(&args, &latents)?;
        assert_eq!(model.latent_sites().len(), 1);
        assert_eq!(model.observed_sites().len(), 1);
        assert_eq!(model.observed_sites()[0].name.as_ref(), OBS_SITE);

        let rate = model
            .deterministic_value("px_rate")
            .ok_or_else(|| candle_core::Error::Msg("missing".into()))?;
        let sums: Vec<f32> = rate.sum(1)?.to_vec1()?;
        assert!((sums[0] - 8.).abs() < 1e-3);
        assert!((sums[1] - 10.).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn test_missing_latent_value_is_an_error() -> Result<()> {
        let (_, module, batch) = toy()?;
        let args = module.args_from_batch(&batch)?;
        assert!(module.model(&args, &LatentValues::new()).is_err());
        Ok(())
    }

    #[test]
    fn test_finite_loss() -> Result<()> {
        let (_, module, batch) = toy()?;
        let args = module.args_from_batch(&batch)?;
        let noise = NoiseSource::from_seed(5);
        let loss = TraceElbo::default()
            .loss(&module, &args, &noise)?
            .to_scalar::<f32>()?;
        assert!(loss.is_finite());
        Ok(())
    }
}
