use candle_core::{Result, Tensor};
use candle_nn::{Activation, Linear, Module, VarBuilder};

/// A stack of `M` layers, each optionally followed by an activation
pub struct StackLayers<M>
where
    M: Module,
{
    layers: Vec<(M, Option<Activation>)>,
}

impl<M> Module for StackLayers<M>
where
    M: Module,
{
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.layers.iter() {
            x = module.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Appends a layer followed by `activation`
    pub fn push_with_act(&mut self, layer: M, activation: Activation) {
        self.layers.push((layer, Some(activation)));
    }

    /// Appends a bare layer
    pub fn push(&mut self, layer: M) {
        self.layers.push((layer, None));
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Feed-forward network `dims[0] -> dims[1] -> ... -> dims[last]`
///
/// Affine layers are registered as `fc.0`, `fc.1`, ... under `vs`;
/// every layer but the last is followed by `hidden_act`.
pub fn feed_forward(
    dims: &[usize],
    hidden_act: Activation,
    vs: VarBuilder,
) -> Result<StackLayers<Linear>> {
    if dims.len() < 2 {
        return Err(candle_core::Error::Msg(format!(
            "need input and output widths, got {:?}",
            dims
        )));
    }

    let nlayers = dims.len() - 1;
    let mut ret = StackLayers::new();
    for (l, w) in dims.windows(2).enumerate() {
        let layer = candle_nn::linear(w[0], w[1], vs.pp(format!("fc.{}", l)))?;
        if l + 1 < nlayers {
            ret.push_with_act(layer, hidden_act);
        } else {
            ret.push(layer);
        }
    }
    Ok(ret)
}
