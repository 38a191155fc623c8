//! AdamW with gradient accumulation and global-norm clipping.
//!
//! `candle_nn::AdamW` consumes a single [`GradStore`]. Gradients from several
//! micro-batches are summed here and written back into the last store before
//! the update, so the optimizer sees one clipped, accumulated gradient per
//! parameter.

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use crate::config::TrainingConfig;
use crate::error::{Result, TuneError};

/// Optimizer hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerConfig {
    /// Peak learning rate.
    pub learning_rate: f64,
    /// First-moment decay.
    pub beta1: f64,
    /// Second-moment decay.
    pub beta2: f64,
    /// Denominator epsilon.
    pub epsilon: f64,
    /// Decoupled weight decay.
    pub weight_decay: f64,
    /// Clip threshold for the global gradient norm; `0` disables clipping.
    pub max_grad_norm: f64,
    /// Micro-batches per optimizer step.
    pub gradient_accumulation_steps: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::from(&TrainingConfig::default())
    }
}

impl From<&TrainingConfig> for OptimizerConfig {
    fn from(training: &TrainingConfig) -> Self {
        Self {
            learning_rate: training.learning_rate,
            beta1: training.adam_beta1,
            beta2: training.adam_beta2,
            epsilon: training.adam_epsilon,
            weight_decay: training.weight_decay,
            max_grad_norm: training.max_grad_norm,
            gradient_accumulation_steps: training.gradient_accumulation_steps.max(1),
        }
    }
}

/// AdamW over a fixed set of trainable variables.
#[derive(Debug)]
pub struct AdamWOptimizer {
    inner: AdamW,
    vars: Vec<Var>,
    accumulated: Vec<Option<Tensor>>,
    last_store: Option<GradStore>,
    micro_steps: usize,
    config: OptimizerConfig,
}

impl AdamWOptimizer {
    /// Build the optimizer for `vars`.
    ///
    /// # Errors
    ///
    /// Returns an error if `vars` is empty or moment buffers cannot be created.
    pub fn new(vars: Vec<Var>, config: OptimizerConfig) -> Result<Self> {
        if vars.is_empty() {
            return Err(TuneError::Training("no trainable parameters".into()));
        }
        let params = ParamsAdamW {
            lr: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.epsilon,
            weight_decay: config.weight_decay,
        };
        let inner = AdamW::new(vars.clone(), params)?;
        let accumulated = vec![None; vars.len()];
        Ok(Self {
            inner,
            vars,
            accumulated,
            last_store: None,
            micro_steps: 0,
            config,
        })
    }

    /// Backpropagate `loss / gradient_accumulation_steps` and add the
    /// resulting gradients to the running sum.
    ///
    /// # Errors
    ///
    /// Returns an error if backpropagation fails.
    pub fn accumulate(&mut self, loss: &Tensor) -> Result<()> {
        let scaled = (loss / self.config.gradient_accumulation_steps as f64)?;
        let grads = scaled.backward()?;

        for (var, slot) in self.vars.iter().zip(self.accumulated.iter_mut()) {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32)?;
            *slot = Some(match slot.take() {
                Some(sum) => (sum + grad)?,
                None => grad,
            });
        }
        self.last_store = Some(grads);
        self.micro_steps += 1;
        Ok(())
    }

    /// Micro-batches accumulated since the last step.
    #[must_use]
    pub fn pending_micro_steps(&self) -> usize {
        self.micro_steps
    }

    /// Whether enough micro-batches have been accumulated for a step.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.micro_steps >= self.config.gradient_accumulation_steps
    }

    /// L2 norm over every accumulated gradient.
    ///
    /// # Errors
    ///
    /// Returns an error if a reduction fails.
    pub fn grad_norm(&self) -> Result<f64> {
        let mut sum_sq = 0f64;
        for grad in self.accumulated.iter().flatten() {
            sum_sq += f64::from(grad.sqr()?.sum_all()?.to_scalar::<f32>()?);
        }
        Ok(sum_sq.sqrt())
    }

    /// Clip, apply the update and clear the accumulated gradients.
    ///
    /// Returns the gradient norm measured before clipping.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing was accumulated or the gradient norm is
    /// not finite.
    pub fn step(&mut self) -> Result<f64> {
        let Some(mut store) = self.last_store.take() else {
            return Err(TuneError::Training("optimizer step without gradients".into()));
        };

        let norm = self.grad_norm()?;
        if !norm.is_finite() {
            self.zero_grad();
            return Err(TuneError::Training(format!("gradient norm is {norm}")));
        }
        let clip = if self.config.max_grad_norm > 0.0 {
            (self.config.max_grad_norm / (norm + 1e-6)).min(1.0)
        } else {
            1.0
        };

        for (var, slot) in self.vars.iter().zip(self.accumulated.iter_mut()) {
            match slot.take() {
                Some(grad) => {
                    let grad = if clip < 1.0 { (grad * clip)? } else { grad };
                    store.insert(var.as_tensor(), grad.to_dtype(var.dtype())?);
                }
                None => {
                    store.remove(var.as_tensor());
                }
            }
        }

        self.inner.step(&store)?;
        self.micro_steps = 0;
        Ok(norm)
    }

    /// Drop accumulated gradients without updating.
    pub fn zero_grad(&mut self) {
        self.accumulated.iter_mut().for_each(|slot| *slot = None);
        self.last_store = None;
        self.micro_steps = 0;
    }

    /// Current learning rate.
    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    /// Set the learning rate used by the next step.
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr);
    }

    /// Optimizer hyperparameters.
    #[must_use]
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn var(values: &[f32]) -> Var {
        Var::new(values, &Device::Cpu).unwrap()
    }

    fn config(accum: usize, max_grad_norm: f64) -> OptimizerConfig {
        OptimizerConfig {
            learning_rate: 0.1,
            weight_decay: 0.0,
            max_grad_norm,
            gradient_accumulation_steps: accum,
            ..Default::default()
        }
    }

    #[test]
    fn test_step_moves_against_gradient() {
        let w = var(&[1.0, -1.0]);
        let mut opt = AdamWOptimizer::new(vec![w.clone()], config(1, 0.0)).unwrap();

        let loss = w.as_tensor().sqr().unwrap().sum_all().unwrap();
        opt.accumulate(&loss).unwrap();
        assert!(opt.ready());
        opt.step().unwrap();

        let values = w.as_tensor().to_vec1::<f32>().unwrap();
        assert!(values[0] < 1.0);
        assert!(values[1] > -1.0);
        assert_eq!(opt.pending_micro_steps(), 0);
    }

    #[test]
    fn test_accumulation_averages_micro_batches() {
        let w = var(&[0.0]);
        let mut opt = AdamWOptimizer::new(vec![w.clone()], config(2, 0.0)).unwrap();

        // d/dw (3w) = 3, d/dw (5w) = 5; averaged over two micro-batches = 4
        let three = (w.as_tensor() * 3.0).unwrap().sum_all().unwrap();
        let five = (w.as_tensor() * 5.0).unwrap().sum_all().unwrap();
        opt.accumulate(&three).unwrap();
        assert!(!opt.ready());
        opt.accumulate(&five).unwrap();
        assert!(opt.ready());

        assert!((opt.grad_norm().unwrap() - 4.0).abs() < 1e-5);
    }

    #[test]
    fn test_step_returns_pre_clip_norm() {
        let w = var(&[0.0, 0.0]);
        let mut opt = AdamWOptimizer::new(vec![w.clone()], config(1, 1.0)).unwrap();

        // gradient (3, 4), norm 5
        let coeffs = Tensor::new(&[3f32, 4.0], &Device::Cpu).unwrap();
        let loss = (w.as_tensor() * coeffs).unwrap().sum_all().unwrap();
        opt.accumulate(&loss).unwrap();

        let norm = opt.step().unwrap();
        assert!((norm - 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_step_without_gradients_is_error() {
        let mut opt = AdamWOptimizer::new(vec![var(&[1.0])], config(1, 1.0)).unwrap();
        assert!(matches!(opt.step(), Err(TuneError::Training(_))));
    }

    #[test]
    fn test_no_parameters_is_error() {
        assert!(AdamWOptimizer::new(Vec::new(), config(1, 1.0)).is_err());
    }

    #[test]
    fn test_learning_rate_update() {
        let mut opt = AdamWOptimizer::new(vec![var(&[1.0])], config(1, 1.0)).unwrap();
        assert!((opt.learning_rate() - 0.1).abs() < f64::EPSILON);
        opt.set_learning_rate(0.05);
        assert!((opt.learning_rate() - 0.05).abs() < f64::EPSILON);
    }
}
