use candle_core::{Result, Tensor};
use candle_nn::VarMap;

pub struct TrainConfig {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub num_epochs: usize,
    /// KL warm-up: `kl_weight = 1 - exp(-epoch / warmup)`; 0 disables
    pub kl_warmup_epochs: f64,
    pub device: candle_core::Device,
    pub verbose: bool,
    pub show_progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            batch_size: 128,
            num_epochs: 100,
            kl_warmup_epochs: 0.,
            device: candle_core::Device::Cpu,
            verbose: false,
            show_progress: true,
        }
    }
}

impl TrainConfig {
    /// KL weight at `epoch` (zero-based)
    pub fn kl_weight(&self, epoch: usize) -> f64 {
        if self.kl_warmup_epochs > 0.0 {
            1.0 - (-(epoch as f64) / self.kl_warmup_epochs).exp()
        } else {
            1.0
        }
    }
}

/// Enumerate every registered parameter by name, sorted by name
pub fn named_parameters(variable_map: &VarMap) -> Result<Vec<(String, Tensor)>> {
    let data = variable_map
        .data()
        .lock()
        .map_err(|e| candle_core::Error::Msg(format!("parameter registry poisoned: {}", e)))?;

    let mut ret: Vec<(String, Tensor)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();

    ret.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(ret)
}

/// Total number of scalar parameters
pub fn num_parameters(variable_map: &VarMap) -> usize {
    variable_map
        .all_vars()
        .iter()
        .map(|v| v.as_tensor().elem_count())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;

    #[test]
    fn test_kl_warmup() {
        let mut config = TrainConfig::default();
        assert_eq!(config.kl_weight(0), 1.0);
        config.kl_warmup_epochs = 10.;
        assert_eq!(config.kl_weight(0), 0.0);
        assert!(config.kl_weight(5) < config.kl_weight(50));
        assert!(config.kl_weight(1000) > 0.999);
    }

    #[test]
    fn test_named_parameters() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _ = candle_nn::linear(3, 2, vb.pp("fc"))?;
        let _ = vb.get_with_hints((1, 3), "log_theta", candle_nn::Init::Const(0.))?;

        let names: Vec<String> = named_parameters(&varmap)?.into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["fc.bias", "fc.weight", "log_theta"]);
        assert_eq!(num_parameters(&varmap), 3 * 2 + 2 + 3);
        Ok(())
    }
}
