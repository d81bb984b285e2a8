use crate::count_io::tensor_to_array2;
use crate::nb_vae_networks::{library_size, NbVaeNetworks};

use candle_core::{Device, Tensor};
use candle_util::candle_data_loader::DataLoader;
use candle_util::candle_noise::NoiseSource;
use candle_util::svi::Distribution;
use ndarray::prelude::*;
use rand::Rng;
use rand_distr::{Distribution as _, Gamma, Poisson};

/// Visit all rows of `data` in order, `block_size` rows at a time, and
/// stack the per-block outputs
fn map_ordered_blocks<DataL, F>(
    data: &DataL,
    block_size: usize,
    device: &Device,
    mut f: F,
) -> anyhow::Result<Array2<f32>>
where
    DataL: DataLoader,
    F: FnMut(&Tensor) -> anyhow::Result<Tensor>,
{
    let ntot = data.num_data();
    let block_size = block_size.max(1);

    let mut blocks = vec![];
    for lb in (0..ntot).step_by(block_size) {
        let ub = (lb + block_size).min(ntot);
        let minibatch = data.minibatch_ordered(lb, ub, device)?;
        blocks.push(tensor_to_array2(&f(minibatch.input()?)?)?);
    }

    let views: Vec<ArrayView2<f32>> = blocks.iter().map(|b| b.view()).collect();
    Ok(ndarray::concatenate(Axis(0), &views)?)
}

/// Latent coordinates of every row (n x k)
///
/// * `networks` - fitted parameters
/// * `data` - count data
/// * `block_size` - rows per forward pass
/// * `device` - where to run
/// * `noise` - `None` for the posterior mean, otherwise one
///   reparameterized draw per row
pub fn latent_representation<DataL>(
    networks: &NbVaeNetworks,
    data: &DataL,
    block_size: usize,
    device: &Device,
    noise: Option<&NoiseSource>,
) -> anyhow::Result<Array2<f32>>
where
    DataL: DataLoader,
{
    map_ordered_blocks(data, block_size, device, |x_nd| {
        let (qz_mean, qz_var) = networks.encode(x_nd)?;
        match noise {
            Some(noise) => Ok(Distribution::normal(qz_mean, qz_var.sqrt()?).rsample(noise)?),
            None => Ok(qz_mean),
        }
    })
}

/// Decoded proportions at the posterior mean (n x d); each row sums
/// to one
pub fn normalized_expression<DataL>(
    networks: &NbVaeNetworks,
    data: &DataL,
    block_size: usize,
    device: &Device,
) -> anyhow::Result<Array2<f32>>
where
    DataL: DataLoader,
{
    map_ordered_blocks(data, block_size, device, |x_nd| {
        let (qz_mean, _) = networks.encode(x_nd)?;
        let library = library_size(x_nd)?;
        Ok(networks.decode(&qz_mean, &library)?.px_scale)
    })
}

/// Draw replicated counts from the posterior predictive (n x d)
///
/// ```text
/// z ~ q(z | x), y | z ~ NB(library * decoder(z), theta)
/// ```
///
/// The negative binomial draw is a Gamma-Poisson mixture:
/// `lambda ~ Gamma(theta, rate / theta)`, `y ~ Poisson(lambda)`.
pub fn posterior_predictive_sample<DataL, R>(
    networks: &NbVaeNetworks,
    data: &DataL,
    block_size: usize,
    device: &Device,
    noise: &NoiseSource,
    rng: &mut R,
) -> anyhow::Result<Array2<f32>>
where
    DataL: DataLoader,
    R: Rng,
{
    let mut theta: Option<Array1<f32>> = None;

    let rate_nd = map_ordered_blocks(data, block_size, device, |x_nd| {
        let (qz_mean, qz_var) = networks.encode(x_nd)?;
        let z = Distribution::normal(qz_mean, qz_var.sqrt()?).rsample(noise)?;
        let rates = networks.decode(&z, &library_size(x_nd)?)?;
        if theta.is_none() {
            theta = Some(tensor_to_array2(&rates.theta)?.row(0).to_owned());
        }
        Ok(rates.px_rate)
    })?;

    let theta = theta.ok_or_else(|| anyhow::anyhow!("no data"))?;

    let mut ret = Array2::<f32>::zeros(rate_nd.dim());
    for (mut y_row, rate_row) in ret.rows_mut().into_iter().zip(rate_nd.rows()) {
        for ((y, &mu), &th) in y_row.iter_mut().zip(rate_row.iter()).zip(theta.iter()) {
            *y = sample_negative_binomial(mu, th, rng)?;
        }
    }
    Ok(ret)
}

/// One negative binomial draw with mean `mu` and dispersion `theta`
pub fn sample_negative_binomial<R: Rng>(mu: f32, theta: f32, rng: &mut R) -> anyhow::Result<f32> {
    if !(mu > 0.) {
        return Ok(0.);
    }
    let gamma = Gamma::new(theta, mu / theta)
        .map_err(|e| anyhow::anyhow!("gamma(shape={}, scale={}): {}", theta, mu / theta, e))?;
    let lambda: f32 = gamma.sample(rng);
    if !(lambda > 0.) {
        return Ok(0.);
    }
    let poisson =
        Poisson::new(lambda).map_err(|e| anyhow::anyhow!("poisson({}): {}", lambda, e))?;
    Ok(poisson.sample(rng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nb_vae_config::NbVaeConfig;
    use candle_core::DType;
    use candle_nn::{VarBuilder, VarMap};
    use candle_util::candle_data_loader::InMemoryData;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn toy() -> anyhow::Result<(VarMap, NbVaeNetworks, InMemoryData)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = NbVaeConfig::new(6).with_latent(2).with_hidden(8);
        let networks = NbVaeNetworks::new(&config, vb)?;
        let x = Array2::from_shape_fn((7, 6), |(i, j)| ((i + 2 * j) % 5) as f32);
        Ok((varmap, networks, InMemoryData::new(&x)?))
    }

    #[test]
    fn test_latent_mean_is_deterministic_and_blocked() -> anyhow::Result<()> {
        let (_, networks, data) = toy()?;
        let z1 = latent_representation(&networks, &data, 3, &Device::Cpu, None)?;
        let z2 = latent_representation(&networks, &data, 100, &Device::Cpu, None)?;
        assert_eq!(z1.dim(), (7, 2));
        approx::assert_abs_diff_eq!(z1, z2, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn test_latent_draws_follow_the_seed() -> anyhow::Result<()> {
        let (_, networks, data) = toy()?;
        let draw = |seed| {
            let noise = NoiseSource::from_seed(seed);
            latent_representation(&networks, &data, 4, &Device::Cpu, Some(&noise))
        };
        assert_eq!(draw(1)?, draw(1)?);
        assert_ne!(draw(1)?, draw(2)?);
        Ok(())
    }

    #[test]
    fn test_normalized_expression_rows_sum_to_one() -> anyhow::Result<()> {
        let (_, networks, data) = toy()?;
        let px = normalized_expression(&networks, &data, 2, &Device::Cpu)?;
        assert_eq!(px.dim(), (7, 6));
        for row in px.rows() {
            assert!((row.sum() - 1.).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_posterior_predictive_counts() -> anyhow::Result<()> {
        let (_, networks, data) = toy()?;
        let noise = NoiseSource::from_seed(11);
        let mut rng = StdRng::seed_from_u64(11);
        let y = posterior_predictive_sample(&networks, &data, 4, &Device::Cpu, &noise, &mut rng)?;
        assert_eq!(y.dim(), (7, 6));
        assert!(y.iter().all(|&v| v >= 0. && v.fract() == 0.));
        Ok(())
    }

    #[test]
    fn test_negative_binomial_moments() -> anyhow::Result<()> {
        let mut rng = StdRng::seed_from_u64(3);
        let (mu, theta) = (4f32, 2f32);
        let n = 20_000;
        let draws = (0..n)
            .map(|_| sample_negative_binomial(mu, theta, &mut rng))
            .collect::<anyhow::Result<Vec<f32>>>()?;
        let mean = draws.iter().sum::<f32>() / n as f32;
        let var = draws.iter().map(|y| (y - mean).powi(2)).sum::<f32>() / n as f32;
        // var = mu + mu^2 / theta = 12
        assert!((mean - mu).abs() < 0.15);
        assert!((var - 12.).abs() < 1.2);
        assert_eq!(sample_negative_binomial(0., theta, &mut rng)?, 0.);
        Ok(())
    }
}
