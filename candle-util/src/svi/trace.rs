use candle_core::{Result, Tensor};
use std::collections::HashMap;

use super::distributions::Distribution;

/// A latent random variable declared by a model (prior) or a guide
/// (approximate posterior)
pub struct SampleSite {
    pub name: Box<str>,
    pub dist: Distribution,
}

/// A random variable bound to observed data
pub struct ObservedSite {
    pub name: Box<str>,
    pub dist: Distribution,
    pub value: Tensor,
}

/// Values of latent sites, drawn from the guide and replayed into
/// the model
#[derive(Default)]
pub struct LatentValues {
    values: HashMap<Box<str>, Tensor>,
}

impl LatentValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: Tensor) {
        self.values.insert(Box::from(name), value);
    }

    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.values
            .get(name)
            .ok_or_else(|| candle_core::Error::Msg(format!("no value for latent site `{}`", name)))
    }
}

/// Description of a generative process: prior draws, deterministic
/// transforms, and likelihoods bound to observations
#[derive(Default)]
pub struct ModelTrace {
    latent: Vec<SampleSite>,
    deterministic: Vec<(Box<str>, Tensor)>,
    observed: Vec<ObservedSite>,
}

impl ModelTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a latent draw from its prior
    pub fn sample(mut self, name: &str, dist: Distribution) -> Self {
        self.latent.push(SampleSite {
            name: Box::from(name),
            dist,
        });
        self
    }

    /// Record a deterministic intermediate
    pub fn deterministic(mut self, name: &str, value: Tensor) -> Self {
        self.deterministic.push((Box::from(name), value));
        self
    }

    /// Condition `dist` on the observed `value`
    pub fn observe(mut self, name: &str, dist: Distribution, value: Tensor) -> Self {
        self.observed.push(ObservedSite {
            name: Box::from(name),
            dist,
            value,
        });
        self
    }

    pub fn latent_sites(&self) -> &[SampleSite] {
        &self.latent
    }

    pub fn observed_sites(&self) -> &[ObservedSite] {
        &self.observed
    }

    pub fn deterministic_value(&self, name: &str) -> Option<&Tensor> {
        self.deterministic
            .iter()
            .find(|(n, _)| n.as_ref() == name)
            .map(|(_, v)| v)
    }
}

/// Description of an approximate posterior over the model's latent sites
#[derive(Default)]
pub struct GuideTrace {
    latent: Vec<SampleSite>,
}

impl GuideTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the variational distribution of a latent site
    pub fn sample(mut self, name: &str, dist: Distribution) -> Self {
        self.latent.push(SampleSite {
            name: Box::from(name),
            dist,
        });
        self
    }

    pub fn latent_sites(&self) -> &[SampleSite] {
        &self.latent
    }

    pub fn site(&self, name: &str) -> Option<&SampleSite> {
        self.latent.iter().find(|s| s.name.as_ref() == name)
    }
}
