// Exponential moving average of model weights.
//
// Shadow copies live in their own `Var`s outside any VarMap so that updating
// them never builds a gradient graph. The warmup-adjusted decay is
// min(decay, (1 + n) / (10 + n)) with n the number of updates so far.

use anyhow::Result;
use candle_core::Var;
use tracing::{debug, info};

/// Live parameters stored by `swap_in`, consumed by `restore`.
pub struct EmaStash(Vec<Var>);

pub struct Ema {
    decay: f64,
    num_updates: usize,
    tracked: Vec<(String, Var)>,
    shadow: Vec<Var>,
}

fn snapshot(var: &Var) -> Result<Var> {
    let copy = Var::zeros(var.shape().clone(), var.dtype(), var.device())?;
    copy.set(var.as_tensor())?;
    Ok(copy)
}

impl Ema {
    pub fn new(decay: f64, vars: Vec<(String, Var)>) -> Result<Self> {
        let mut ema = Self {
            decay,
            num_updates: 0,
            tracked: Vec::new(),
            shadow: Vec::new(),
        };
        ema.reinit(vars)?;
        Ok(ema)
    }

    /// Track `vars` and copy their current values into the shadow.
    pub fn reinit(&mut self, vars: Vec<(String, Var)>) -> Result<()> {
        self.shadow = vars.iter().map(|(_, v)| snapshot(v)).collect::<Result<_>>()?;
        self.tracked = vars;
        self.num_updates = 0;
        info!("[EMA] Tracking {} tensors (decay={})", self.tracked.len(), self.decay);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    pub fn num_updates(&self) -> usize {
        self.num_updates
    }

    /// Shadow variables under the names of the parameters they follow.
    pub fn shadow_vars(&self) -> Vec<(String, Var)> {
        self.tracked
            .iter()
            .zip(&self.shadow)
            .map(|((name, _), s)| (name.clone(), s.clone()))
            .collect()
    }

    /// Resume the warmup schedule after loading a checkpoint.
    pub fn set_num_updates(&mut self, n: usize) {
        self.num_updates = n;
    }

    /// Decay applied by the next `update`.
    pub fn current_decay(&self) -> f64 {
        let n = self.num_updates as f64;
        self.decay.min((1.0 + n) / (10.0 + n))
    }

    pub fn update(&mut self) -> Result<()> {
        let decay = self.current_decay();
        for ((_, param), shadow) in self.tracked.iter().zip(&self.shadow) {
            let blended = (shadow.as_tensor().affine(decay, 0.0)?
                + param.as_tensor().affine(1.0 - decay, 0.0)?)?;
            shadow.set(&blended)?;
        }
        self.num_updates += 1;
        debug!("[EMA] update {} decay={decay:.6}", self.num_updates);
        Ok(())
    }

    /// Overwrite the shadow with the live parameters, keeping the update count.
    pub fn copy_from_params(&self) -> Result<()> {
        for ((_, param), shadow) in self.tracked.iter().zip(&self.shadow) {
            shadow.set(param.as_tensor())?;
        }
        debug!("[EMA] Shadow synced to live weights");
        Ok(())
    }

    /// Load the shadow weights into the live parameters and return the
    /// previous values.
    pub fn swap_in(&self) -> Result<EmaStash> {
        let stash = self
            .tracked
            .iter()
            .map(|(_, v)| snapshot(v))
            .collect::<Result<Vec<_>>>()?;
        for ((_, param), shadow) in self.tracked.iter().zip(&self.shadow) {
            param.set(shadow.as_tensor())?;
        }
        debug!("[EMA] Switched to EMA weights");
        Ok(EmaStash(stash))
    }

    pub fn restore(&self, stash: EmaStash) -> Result<()> {
        for ((_, param), saved) in self.tracked.iter().zip(&stash.0) {
            param.set(saved.as_tensor())?;
        }
        debug!("[EMA] Restored training weights");
        Ok(())
    }
}
