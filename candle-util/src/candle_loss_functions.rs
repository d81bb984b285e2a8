use candle_core::{Result, Tensor};

/// 0.5 * ln(2π)
const HALF_LN_2PI: f64 = 0.918_938_533_204_672_7;

/// KL divergence of a diagonal Gaussian from the standard normal
///
/// 0.5 * (sigma^2 + mu^2 - 1 - log(sigma^2))
///
/// * `z_mean` - mean of Gaussian distribution
/// * `z_var` - variance of Gaussian distribution (strictly positive)
///
/// Returns the divergence summed over the last dimension
pub fn gaussian_kl_loss(z_mean: &Tensor, z_var: &Tensor) -> Result<Tensor> {
    let kl = ((z_var + z_mean.sqr()?)? - 1.)?.sub(&z_var.log()?)?;
    kl.sum(z_mean.rank() - 1)? * 0.5
}

/// Numerically stable softplus: log(1 + exp(x))
///
/// relu(x) + log(1 + exp(-|x|))
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = (x.abs()?.neg()?.exp()? + 1.)?.log()?;
    x.relu()?.add(&tail)
}

/// log(sigmoid(x)) = -softplus(-x)
pub fn log_sigmoid(x: &Tensor) -> Result<Tensor> {
    softplus(&x.neg()?)?.neg()
}

/// Stirling series for log-gamma on a shifted argument
///
/// ```text
/// lgamma(x) = lgamma(x + 3) - log(x) - log(x + 1) - log(x + 2)
/// lgamma(y) ≈ (y - 1/2) log(y) - y + log(2π)/2 + 1/(12 y) - 1/(360 y^3)
/// ```
///
/// Inputs are clamped away from zero.
pub fn lgamma_stirling(x: &Tensor) -> Result<Tensor> {
    let x = x.clamp(1e-6f32, f32::MAX)?;

    let y = (&x + 3.)?;
    let inv_y = y.recip()?;

    let stirling = (((&y - 0.5)?.mul(&y.log()?)? - &y)? + HALF_LN_2PI)?;
    let series = ((&inv_y / 12.)? - (inv_y.powf(3.)? / 360.)?)?;

    let shift = x
        .log()?
        .add(&(&x + 1.)?.log()?)?
        .add(&(&x + 2.)?.log()?)?;

    stirling.add(&series)?.sub(&shift)
}

/// Element-wise negative binomial log-probability in the
/// `(total_count, logits)` parameterization
///
/// ```text
/// log P(x | r, l) = lgamma(x + r) - lgamma(r) - lgamma(x + 1)
///                 + r * log sigmoid(-l) + x * log sigmoid(l)
/// ```
///
/// The mean is `r * exp(l)`.
///
/// * `x_nd` - observed counts
/// * `total_count` - dispersion `r` (broadcast to `x_nd`)
/// * `logits_nd` - logits `l` (broadcast to `x_nd`)
pub fn negative_binomial_log_prob(
    x_nd: &Tensor,
    total_count: &Tensor,
    logits_nd: &Tensor,
) -> Result<Tensor> {
    let r_nd = total_count.broadcast_as(x_nd.shape())?;
    let l_nd = logits_nd.broadcast_as(x_nd.shape())?;

    let log_unnorm = r_nd
        .mul(&log_sigmoid(&l_nd.neg()?)?)?
        .add(&x_nd.mul(&log_sigmoid(&l_nd)?)?)?;

    let log_norm = lgamma_stirling(&x_nd.add(&r_nd)?)?
        .sub(&lgamma_stirling(&(x_nd + 1.)?)?)?
        .sub(&lgamma_stirling(&r_nd)?)?;

    log_unnorm.add(&log_norm)
}

/// Convert mean and dispersion into negative binomial logits
///
/// logits = log(rate + ε) - log(theta + ε)
///
/// * `rate_nd` - mean of the negative binomial (n x d)
/// * `theta` - dispersion, broadcastable to `rate_nd`
/// * `eps` - stabilizer against log(0)
pub fn nb_logits(rate_nd: &Tensor, theta: &Tensor, eps: f64) -> Result<Tensor> {
    let log_rate = (rate_nd + eps)?.log()?;
    let log_theta = (theta + eps)?.log()?;
    log_rate.broadcast_sub(&log_theta)
}

/// Negative binomial log-likelihood of count data
///
/// llik(i) = sum_w log NB(x(i,w) | theta(w), logits(i,w))
///
/// * `x_nd` - data tensor (observed counts)
/// * `rate_nd` - rate tensor (reconstruction)
/// * `theta` - per-feature dispersion (1 x d or d)
/// * `eps` - logit stabilizer
pub fn negative_binomial_likelihood(
    x_nd: &Tensor,
    rate_nd: &Tensor,
    theta: &Tensor,
    eps: f64,
) -> Result<Tensor> {
    let logits_nd = nb_logits(rate_nd, theta, eps)?;
    negative_binomial_log_prob(x_nd, theta, &logits_nd)?.sum(x_nd.rank() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_lgamma_known_values() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[0.1f32, 0.5, 1.0, 2.0, 5.0, 10.0], &dev)?;
        let lg: Vec<f32> = lgamma_stirling(&x)?.to_vec1()?;
        let expected = [2.252_712_7f32, 0.572_364_9, 0., 0., 3.178_053_8, 12.801_827];
        for (&a, &b) in lg.iter().zip(expected.iter()) {
            approx::assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
        Ok(())
    }

    #[test]
    fn test_kl_standard_normal_is_zero() -> Result<()> {
        let dev = Device::Cpu;
        let mean = Tensor::zeros((3, 4), DType::F32, &dev)?;
        let var = Tensor::ones((3, 4), DType::F32, &dev)?;
        let kl: Vec<f32> = gaussian_kl_loss(&mean, &var)?.to_vec1()?;
        assert_eq!(kl, vec![0f32; 3]);
        Ok(())
    }

    #[test]
    fn test_kl_non_negative() -> Result<()> {
        let dev = Device::Cpu;
        let mean = Tensor::randn(0f32, 3f32, (50, 7), &dev)?;
        let var = Tensor::randn(0f32, 2f32, (50, 7), &dev)?.exp()?;
        let kl: Vec<f32> = gaussian_kl_loss(&mean, &var)?.to_vec1()?;
        assert!(kl.iter().all(|&k| k >= -1e-5));
        Ok(())
    }

    #[test]
    fn test_softplus_is_stable() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[-100f32, -1., 0., 1., 100.], &dev)?;
        let sp: Vec<f32> = softplus(&x)?.to_vec1()?;
        assert!(sp[0] >= 0. && sp[0] < 1e-20);
        assert!((sp[2] - 2f32.ln()).abs() < 1e-6);
        assert!((sp[4] - 100.).abs() < 1e-4);
        assert!((sp[3] - sp[1] - 1.).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_negative_binomial_geometric_case() -> Result<()> {
        // r = 1 reduces to a geometric distribution:
        // P(x) = (1 - p) p^x with p = sigmoid(l)
        let dev = Device::Cpu;
        let x = Tensor::new(&[[0f32, 1., 3.]], &dev)?;
        let r = Tensor::ones((1, 3), DType::F32, &dev)?;
        let l = Tensor::zeros((1, 3), DType::F32, &dev)?;
        let lp: Vec<Vec<f32>> = negative_binomial_log_prob(&x, &r, &l)?.to_vec2()?;
        let half = 0.5f32.ln();
        let expected = [half, 2. * half, 4. * half];
        for (&a, &b) in lp[0].iter().zip(expected.iter()) {
            approx::assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
        Ok(())
    }

    #[test]
    fn test_negative_binomial_reference_values() -> Result<()> {
        let dev = Device::Cpu;
        // (x, r, l, log P, tolerance)
        let table = [
            (3f32, 2.5f32, 0.3f32, -1.9175822f32, 1e-4f32),
            (10., 10., 2., -11.104916, 1e-4),
            (100., 0.5, 5., -6.0510926, 1e-4),
            (7., 0.05, 1., -7.0794536, 1e-4),
            (1500., 20., 4., -7.850466, 5e-3),
        ];
        for (x, r, l, expected, tol) in table {
            let lp = negative_binomial_log_prob(
                &Tensor::new(&[[x]], &dev)?,
                &Tensor::new(&[[r]], &dev)?,
                &Tensor::new(&[[l]], &dev)?,
            )?;
            let lp: Vec<Vec<f32>> = lp.to_vec2()?;
            approx::assert_abs_diff_eq!(lp[0][0], expected, epsilon = tol);
        }
        Ok(())
    }

    #[test]
    fn test_nb_likelihood_finite_at_zero_rate() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::zeros((2, 100), DType::F32, &dev)?;
        let rate = Tensor::zeros((2, 100), DType::F32, &dev)?;
        let theta = Tensor::randn(0f32, 1f32, (1, 100), &dev)?.exp()?;
        let llik: Vec<f32> = negative_binomial_likelihood(&x, &rate, &theta, 1e-4)?.to_vec1()?;
        assert_eq!(llik.len(), 2);
        assert!(llik.iter().all(|v| v.is_finite()));
        // zero counts at a near-zero mean are nearly certain
        assert!(llik.iter().all(|&v| v < 1e-3 && v > -1.));
        Ok(())
    }
}
