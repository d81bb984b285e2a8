use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_N_LATENT: usize = 10;
pub const DEFAULT_N_HIDDEN: usize = 128;
pub const DEFAULT_EPSILON: f64 = 1e-4;

/// Dimensions and constants of the negative binomial VAE
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NbVaeConfig {
    /// number of features (columns of the count matrix)
    pub n_input: usize,
    /// dimension of the latent space
    #[serde(default = "default_n_latent")]
    pub n_latent: usize,
    /// width of the hidden layer in every feed-forward network
    #[serde(default = "default_n_hidden")]
    pub n_hidden: usize,
    /// stabilizer in the negative binomial logits
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
}

fn default_n_latent() -> usize {
    DEFAULT_N_LATENT
}

fn default_n_hidden() -> usize {
    DEFAULT_N_HIDDEN
}

fn default_epsilon() -> f64 {
    DEFAULT_EPSILON
}

impl NbVaeConfig {
    pub fn new(n_input: usize) -> Self {
        Self {
            n_input,
            n_latent: DEFAULT_N_LATENT,
            n_hidden: DEFAULT_N_HIDDEN,
            epsilon: DEFAULT_EPSILON,
        }
    }

    pub fn with_latent(mut self, n_latent: usize) -> Self {
        self.n_latent = n_latent;
        self
    }

    pub fn with_hidden(mut self, n_hidden: usize) -> Self {
        self.n_hidden = n_hidden;
        self
    }

    /// Reject dimensions no network can be built with
    pub fn validate(&self) -> candle_core::Result<()> {
        if self.n_input == 0 {
            return Err(candle_core::Error::Msg("n_input must be positive".into()));
        }
        if self.n_latent == 0 {
            return Err(candle_core::Error::Msg("n_latent must be positive".into()));
        }
        if self.n_hidden == 0 {
            return Err(candle_core::Error::Msg("n_hidden must be positive".into()));
        }
        if !(self.epsilon.is_finite() && self.epsilon > 0.) {
            return Err(candle_core::Error::Msg(format!(
                "epsilon must be a positive number, but found {}",
                self.epsilon
            )));
        }
        Ok(())
    }

    pub fn to_json_file(&self, path: &Path) -> anyhow::Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }
}
