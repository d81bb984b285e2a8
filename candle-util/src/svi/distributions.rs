//! Distributions with the operations the trace evaluator needs.

use candle_core::{Result, Tensor};

use crate::candle_loss_functions::negative_binomial_log_prob;
use crate::candle_noise::NoiseSource;

/// 0.5 * ln(2π)
const HALF_LN_2PI: f64 = 0.918_938_533_204_672_7;

#[derive(Clone, Debug)]
pub enum Distribution {
    /// N(loc, scale^2), element-wise
    Normal { loc: Tensor, scale: Tensor },
    /// NB(total_count, logits) with mean `total_count * exp(logits)`
    NegativeBinomial { total_count: Tensor, logits: Tensor },
}

impl Distribution {
    pub fn normal(loc: Tensor, scale: Tensor) -> Self {
        Self::Normal { loc, scale }
    }

    /// N(0, 1) with the shape, dtype and device of `x`
    pub fn standard_normal_like(x: &Tensor) -> Result<Self> {
        Ok(Self::Normal {
            loc: x.zeros_like()?,
            scale: x.ones_like()?,
        })
    }

    pub fn negative_binomial(total_count: Tensor, logits: Tensor) -> Self {
        Self::NegativeBinomial {
            total_count,
            logits,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Normal { .. } => "Normal",
            Self::NegativeBinomial { .. } => "NegativeBinomial",
        }
    }

    /// Element-wise log-density of `value`
    pub fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        match self {
            Self::Normal { loc, scale } => {
                let std_z = value.broadcast_sub(loc)?.broadcast_div(scale)?;
                let log_scale = scale.log()?.broadcast_as(std_z.shape())?;
                ((std_z.sqr()? * (-0.5))? - log_scale)? - HALF_LN_2PI
            }
            Self::NegativeBinomial {
                total_count,
                logits,
            } => negative_binomial_log_prob(value, total_count, logits),
        }
    }

    /// Log-density with the last dimension treated as the event,
    /// i.e., summed over it
    pub fn event_log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let lp = self.log_prob(value)?;
        lp.sum(lp.rank() - 1)
    }

    pub fn mean(&self) -> Result<Tensor> {
        match self {
            Self::Normal { loc, .. } => Ok(loc.clone()),
            Self::NegativeBinomial {
                total_count,
                logits,
            } => logits.exp()?.broadcast_mul(total_count),
        }
    }

    pub fn has_rsample(&self) -> bool {
        matches!(self, Self::Normal { .. })
    }

    /// Reparameterized draw: `loc + scale * eps` with `eps ~ N(0, 1)`,
    /// so the draw stays differentiable in `loc` and `scale`
    pub fn rsample(&self, noise: &NoiseSource) -> Result<Tensor> {
        match self {
            Self::Normal { loc, scale } => {
                let eps = noise.standard_normal_like(loc)?;
                loc.add(&eps.broadcast_mul(scale)?)
            }
            _ => Err(candle_core::Error::Msg(format!(
                "{} has no reparameterized sampler",
                self.name()
            ))),
        }
    }
}

/// Element-wise KL(q || p) when a closed form exists
///
/// ```text
/// KL(N(m1, s1^2) || N(m2, s2^2)) = log(s2/s1) + (s1^2 + (m1 - m2)^2) / (2 s2^2) - 1/2
/// ```
pub fn kl_divergence(q: &Distribution, p: &Distribution) -> Result<Option<Tensor>> {
    match (q, p) {
        (
            Distribution::Normal {
                loc: m1,
                scale: s1,
            },
            Distribution::Normal {
                loc: m2,
                scale: s2,
            },
        ) => {
            let var_ratio = s1.broadcast_div(s2)?.sqr()?;
            let t1 = m1.broadcast_sub(m2)?.broadcast_div(s2)?.sqr()?;
            let kl = ((var_ratio.add(&t1)? - 1.)? - var_ratio.log()?)?;
            Ok(Some((kl * 0.5)?))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_loss_functions::gaussian_kl_loss;
    use candle_core::{DType, Device};

    #[test]
    fn test_normal_log_prob() -> Result<()> {
        let dev = Device::Cpu;
        let d = Distribution::normal(
            Tensor::new(&[0f32, 1.], &dev)?,
            Tensor::new(&[1f32, 2.], &dev)?,
        );
        let lp: Vec<f32> = d.log_prob(&Tensor::new(&[0f32, 3.], &dev)?)?.to_vec1()?;
        let expected = [-HALF_LN_2PI as f32, -0.5 - 2f32.ln() - HALF_LN_2PI as f32];
        for (a, b) in lp.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_kl_matches_closed_form_loss() -> Result<()> {
        let dev = Device::Cpu;
        let mean = Tensor::randn(0f32, 1f32, (4, 6), &dev)?;
        let var = Tensor::randn(0f32, 1f32, (4, 6), &dev)?.exp()?;
        let q = Distribution::normal(mean.clone(), var.sqrt()?);
        let p = Distribution::standard_normal_like(&mean)?;

        let kl = kl_divergence(&q, &p)?.expect("normal-normal");
        let a: Vec<f32> = kl.sum(1)?.to_vec1()?;
        let b: Vec<f32> = gaussian_kl_loss(&mean, &var)?.to_vec1()?;
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-4);
        }
        assert!(kl_divergence(&p, &p)?.expect("kl").sum_all()?.to_scalar::<f32>()?.abs() < 1e-7);
        Ok(())
    }

    #[test]
    fn test_rsample_shift() -> Result<()> {
        let dev = Device::Cpu;
        let loc = Tensor::zeros((2, 3), DType::F32, &dev)?;
        let scale = Tensor::ones((2, 3), DType::F32, &dev)?;

        let z0 = Distribution::normal(loc.clone(), scale.clone())
            .rsample(&NoiseSource::from_seed(5))?;
        let z1 =
            Distribution::normal((&loc + 0.25)?, scale).rsample(&NoiseSource::from_seed(5))?;

        let diff: Vec<Vec<f32>> = (z1 - z0)?.to_vec2()?;
        assert!(diff.iter().flatten().all(|&d| (d - 0.25).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn test_negative_binomial_has_no_rsample() -> Result<()> {
        let dev = Device::Cpu;
        let nb = Distribution::negative_binomial(
            Tensor::ones((1, 3), DType::F32, &dev)?,
            Tensor::zeros((1, 3), DType::F32, &dev)?,
        );
        assert!(!nb.has_rsample());
        assert!(nb.rsample(&NoiseSource::from_seed(0)).is_err());
        let mu: Vec<Vec<f32>> = nb.mean()?.to_vec2()?;
        assert_eq!(mu, vec![vec![1f32; 3]]);
        Ok(())
    }
}
