use crate::feature_encoder::{FeatureEncoder, OutputLink};
use crate::nb_vae_config::NbVaeConfig;

use candle_core::{Result, Tensor};
use candle_nn::{Module, VarBuilder};

/// Parameters shared by the manual module and the model/guide module
///
/// * `z_mean.*` - encoder of the posterior mean, `log1p(x) -> R^k`
/// * `z_var.*` - encoder of the posterior variance, `log1p(x) -> R^k_+`
/// * `decoder.*` - decoder of expression proportions, `z -> simplex^d`
/// * `log_theta` - per-feature log dispersion (1 x d)
pub struct NbVaeNetworks {
    config: NbVaeConfig,
    z_mean_encoder: FeatureEncoder,
    z_var_encoder: FeatureEncoder,
    decoder: FeatureEncoder,
    log_theta: Tensor,
}

/// Mean, dispersion and proportions of the negative binomial likelihood
pub struct DecodedRates {
    /// per-row proportions (n x d), rows sum to one
    pub px_scale: Tensor,
    /// per-feature dispersion (1 x d)
    pub theta: Tensor,
    /// expected counts, `library * px_scale` (n x d)
    pub px_rate: Tensor,
}

impl NbVaeNetworks {
    pub fn new(config: &NbVaeConfig, vs: VarBuilder) -> Result<Self> {
        config.validate()?;

        let n_input = config.n_input;
        let n_latent = config.n_latent;
        let n_hidden = config.n_hidden;

        let z_mean_encoder = FeatureEncoder::new(
            n_input,
            n_latent,
            n_hidden,
            OutputLink::Identity,
            vs.pp("z_mean"),
        )?;

        let z_var_encoder = FeatureEncoder::new(
            n_input,
            n_latent,
            n_hidden,
            OutputLink::Exp,
            vs.pp("z_var"),
        )?;

        let decoder = FeatureEncoder::new(
            n_latent,
            n_input,
            n_hidden,
            OutputLink::Softmax,
            vs.pp("decoder"),
        )?;

        let log_theta = vs.get_with_hints(
            (1, n_input),
            "log_theta",
            candle_nn::Init::Randn {
                mean: 0.,
                stdev: 1.,
            },
        )?;

        Ok(Self {
            config: config.clone(),
            z_mean_encoder,
            z_var_encoder,
            decoder,
            log_theta,
        })
    }

    pub fn config(&self) -> &NbVaeConfig {
        &self.config
    }

    /// Variational parameters `(qz_mean, qz_var)` of raw counts `x_nd`
    pub fn encode(&self, x_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        let log1p_nd = (x_nd + 1.)?.log()?;
        let qz_mean = self.z_mean_encoder.forward(&log1p_nd)?;
        let qz_var = self.z_var_encoder.forward(&log1p_nd)?;
        Ok((qz_mean, qz_var))
    }

    /// Likelihood parameters of latent states `z_nk` and library sizes
    /// `library_n1` (n x 1)
    pub fn decode(&self, z_nk: &Tensor, library_n1: &Tensor) -> Result<DecodedRates> {
        let px_scale = self.decoder.forward(z_nk)?;
        let theta = self.log_theta.exp()?;
        let px_rate = px_scale.broadcast_mul(library_n1)?;
        Ok(DecodedRates {
            px_scale,
            theta,
            px_rate,
        })
    }
}

/// Observed library size, the row sums of raw counts (n x 1)
pub fn library_size(x_nd: &Tensor) -> Result<Tensor> {
    x_nd.sum_keepdim(x_nd.rank() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_parameter_names() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = NbVaeConfig::new(6).with_latent(2).with_hidden(4);
        let _ = NbVaeNetworks::new(&config, vb)?;

        let names: Vec<String> = candle_util::candle_inference::named_parameters(&varmap)?
            .into_iter()
            .map(|(n, _)| n)
            .collect();

        let mut expected = vec!["log_theta".to_string()];
        for net in ["decoder", "z_mean", "z_var"] {
            for layer in ["fc.0", "fc.1"] {
                for p in ["bias", "weight"] {
                    expected.push(format!("{}.{}.{}", net, layer, p));
                }
            }
        }
        expected.sort();
        assert_eq!(names, expected);

        // 3 two-layer networks + dispersion
        let enc = 6 * 4 + 4 + 4 * 2 + 2;
        let dec = 2 * 4 + 4 + 4 * 6 + 6;
        assert_eq!(
            candle_util::candle_inference::num_parameters(&varmap),
            2 * enc + dec + 6
        );
        Ok(())
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = NbVaeConfig::new(6).with_latent(0);
        assert!(NbVaeNetworks::new(&config, vb).is_err());
    }

    #[test]
    fn test_library_size() -> Result<()> {
        let x = Tensor::new(&[[1f32, 2., 3.], [0., 0., 0.]], &Device::Cpu)?;
        let lib: Vec<Vec<f32>> = library_size(&x)?.to_vec2()?;
        assert_eq!(lib, vec![vec![6.], vec![0.]]);
        Ok(())
    }
}
