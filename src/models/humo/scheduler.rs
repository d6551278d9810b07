//! Flow-matching UniPC multistep scheduler.
//!
//! The transformer predicts a flow velocity `v`; the scheduler converts it to a clean-sample
//! estimate `x0 = x_t - σ_t · v` and advances with the UniP predictor (order ≤ 2 by default),
//! refining the incoming sample with the UniC corrector from the second step on.
//!
//! Sigmas live on the host as `f64` (rounded through `f32` like the reference tables); only the
//! sample updates touch the device.

use candle_core::{DType, Device, Result, Tensor, bail};
use tracing::debug;

use super::pipeline::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolverType {
    Bh1,
    #[default]
    Bh2,
}

#[derive(Debug, Clone)]
pub struct FlowUniPCSchedulerConfig {
    pub num_train_timesteps: usize,
    pub solver_order: usize,
    /// Shift applied to the training sigmas at construction (1.0 keeps them unchanged).
    pub shift: f64,
    pub solver_type: SolverType,
    pub lower_order_final: bool,
    /// Step indices whose corrector update is skipped.
    pub disable_corrector: Vec<usize>,
}

impl Default for FlowUniPCSchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            solver_order: 2,
            shift: 1.0,
            solver_type: SolverType::Bh2,
            lower_order_final: true,
            disable_corrector: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct FlowUniPCMultistepScheduler {
    pub config: FlowUniPCSchedulerConfig,
    sigma_min: f64,
    sigma_max: f64,
    /// Inference sigmas, terminal zero appended.
    sigmas: Vec<f64>,
    timesteps: Vec<i64>,
    model_outputs: Vec<Option<Tensor>>,
    last_sample: Option<Tensor>,
    lower_order_nums: usize,
    this_order: usize,
    step_index: Option<usize>,
}

fn as_f32(v: f64) -> f64 {
    v as f32 as f64
}

fn shift_sigma(shift: f64, sigma: f64) -> f64 {
    shift * sigma / (1.0 + (shift - 1.0) * sigma)
}

fn linspace(start: f64, end: f64, steps: usize) -> Vec<f64> {
    match steps {
        0 => vec![],
        1 => vec![start],
        _ => {
            let denom = (steps - 1) as f64;
            (0..steps)
                .map(|i| start + (end - start) * (i as f64) / denom)
                .collect()
        }
    }
}

impl FlowUniPCMultistepScheduler {
    pub fn new(config: FlowUniPCSchedulerConfig) -> Result<Self> {
        let n = config.num_train_timesteps;
        if n < 2 {
            bail!("num_train_timesteps must be at least 2, got {n}");
        }
        if config.solver_order == 0 {
            bail!("solver_order must be at least 1");
        }

        // alphas = linspace(1, 1/N, N)[::-1]; sigmas = 1 - alphas
        let mut alphas = linspace(1.0, 1.0 / n as f64, n);
        alphas.reverse();
        let sigmas: Vec<f64> = alphas
            .into_iter()
            .map(|a| as_f32(shift_sigma(config.shift, 1.0 - a)))
            .collect();

        let sigma_max = sigmas[0];
        let sigma_min = sigmas[n - 1];
        let order = config.solver_order;

        Ok(Self {
            config,
            sigma_min,
            sigma_max,
            sigmas,
            timesteps: Vec::new(),
            model_outputs: vec![None; order],
            last_sample: None,
            lower_order_nums: 0,
            this_order: 0,
            step_index: None,
        })
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    pub fn timesteps(&self) -> &[i64] {
        &self.timesteps
    }

    pub fn step_index(&self) -> Option<usize> {
        self.step_index
    }

    fn index_for_timestep(&self, timestep: i64) -> Result<usize> {
        let matches: Vec<usize> = self
            .timesteps
            .iter()
            .enumerate()
            .filter(|(_, t)| **t == timestep)
            .map(|(i, _)| i)
            .collect();
        match matches.as_slice() {
            [] => bail!("timestep {timestep} is not part of the schedule"),
            [only] => Ok(*only),
            // duplicates: the second match keeps the first step from being skipped
            [_, second, ..] => Ok(*second),
        }
    }

    /// `(alpha, sigma, lambda)` for a schedule index.
    fn coefficients(&self, idx: usize) -> Result<(f64, f64, f64)> {
        let Some(&sigma) = self.sigmas.get(idx) else {
            bail!("sigma index {idx} out of range ({})", self.sigmas.len());
        };
        let alpha = 1.0 - sigma;
        Ok((alpha, sigma, alpha.ln() - sigma.ln()))
    }

    fn model_output_at(&self, back: usize) -> Result<&Tensor> {
        let len = self.model_outputs.len();
        match len.checked_sub(back + 1).and_then(|i| self.model_outputs[i].as_ref()) {
            Some(t) => Ok(t),
            None => bail!("missing model output {back} steps back"),
        }
    }

    /// Builds `(rks, D1s)` for the previous `order - 1` outputs relative to `m0`.
    fn history_differences(
        &self,
        m0: &Tensor,
        order: usize,
        lambda_s0: f64,
        h: f64,
        sigma_index: impl Fn(usize) -> Option<usize>,
    ) -> Result<(Vec<f64>, Vec<Tensor>)> {
        let mut rks = Vec::with_capacity(order);
        let mut d1s = Vec::with_capacity(order.saturating_sub(1));
        for i in 1..order {
            let Some(si) = sigma_index(i) else {
                bail!("not enough history for a solver of order {order}");
            };
            let mi = self.model_output_at(i)?;
            let (_, _, lambda_si) = self.coefficients(si)?;
            let rk = (lambda_si - lambda_s0) / h;
            rks.push(rk);
            d1s.push(((mi - m0)? / rk)?);
        }
        rks.push(1.0);
        Ok((rks, d1s))
    }

    /// `B(h)` and the right-hand side `b` of the UniPC linear system, plus its matrix `R`.
    fn solver_system(&self, rks: &[f64], hh: f64) -> (f64, Vec<Vec<f64>>, Vec<f64>) {
        let h_phi_1 = hh.exp_m1();
        let mut h_phi_k = h_phi_1 / hh - 1.0;
        let mut factorial = 1.0;
        let b_h = match self.config.solver_type {
            SolverType::Bh1 => hh,
            SolverType::Bh2 => hh.exp_m1(),
        };
        let mut r = Vec::with_capacity(rks.len());
        let mut b = Vec::with_capacity(rks.len());
        for i in 1..=rks.len() {
            r.push(rks.iter().map(|rk| rk.powi(i as i32 - 1)).collect());
            b.push(h_phi_k * factorial / b_h);
            factorial *= (i + 1) as f64;
            h_phi_k = h_phi_k / hh - 1.0 / factorial;
        }
        (b_h, r, b)
    }

    fn weighted_sum(weights: &[f64], terms: &[Tensor]) -> Result<Option<Tensor>> {
        let mut acc: Option<Tensor> = None;
        for (w, d) in weights.iter().zip(terms) {
            let term = (d * *w)?;
            acc = Some(match acc {
                Some(a) => (a + term)?,
                None => term,
            });
        }
        Ok(acc)
    }

    fn multistep_uni_p_update(&self, sample: &Tensor, order: usize) -> Result<Tensor> {
        let Some(idx) = self.step_index else {
            bail!("predictor called before the step index was initialised");
        };
        let m0 = self.model_output_at(0)?;
        let (alpha_t, sigma_t, lambda_t) = self.coefficients(idx + 1)?;
        let (_, sigma_s0, lambda_s0) = self.coefficients(idx)?;
        let h = lambda_t - lambda_s0;

        let (rks, d1s) =
            self.history_differences(m0, order, lambda_s0, h, |i| idx.checked_sub(i))?;
        let hh = -h;
        let h_phi_1 = hh.exp_m1();
        let (b_h, r, b) = self.solver_system(&rks, hh);

        let x_t_ = ((sample * (sigma_t / sigma_s0))? - (m0 * (alpha_t * h_phi_1))?)?;
        if d1s.is_empty() {
            return Ok(x_t_);
        }
        let rhos_p = if order == 2 {
            vec![0.5]
        } else {
            let k = r.len() - 1;
            let reduced: Vec<Vec<f64>> = r[..k].iter().map(|row| row[..k].to_vec()).collect();
            solve_linear(reduced, b[..k].to_vec())?
        };
        match Self::weighted_sum(&rhos_p, &d1s)? {
            Some(pred_res) => x_t_ - (pred_res * (alpha_t * b_h))?,
            None => Ok(x_t_),
        }
    }

    fn multistep_uni_c_update(
        &self,
        model_t: &Tensor,
        last_sample: &Tensor,
        order: usize,
    ) -> Result<Tensor> {
        let Some(idx) = self.step_index else {
            bail!("corrector called before the step index was initialised");
        };
        let Some(prev) = idx.checked_sub(1) else {
            bail!("corrector needs a previous step");
        };
        let m0 = self.model_output_at(0)?;
        let (alpha_t, sigma_t, lambda_t) = self.coefficients(idx)?;
        let (_, sigma_s0, lambda_s0) = self.coefficients(prev)?;
        let h = lambda_t - lambda_s0;

        let (rks, d1s) =
            self.history_differences(m0, order, lambda_s0, h, |i| idx.checked_sub(i + 1))?;
        let hh = -h;
        let h_phi_1 = hh.exp_m1();
        let (b_h, r, b) = self.solver_system(&rks, hh);

        let rhos_c = if order == 1 {
            vec![0.5]
        } else {
            solve_linear(r, b)?
        };
        let Some((&rho_last, rho_hist)) = rhos_c.split_last() else {
            bail!("empty corrector coefficients");
        };

        let x_t_ = ((last_sample * (sigma_t / sigma_s0))? - (m0 * (alpha_t * h_phi_1))?)?;
        let d1_t = (model_t - m0)?;
        let correction = match Self::weighted_sum(rho_hist, &d1s)? {
            Some(corr_res) => (corr_res + (d1_t * rho_last)?)?,
            None => (d1_t * rho_last)?,
        };
        x_t_ - (correction * (alpha_t * b_h))?
    }
}

impl Scheduler for FlowUniPCMultistepScheduler {
    fn order(&self) -> usize {
        self.config.solver_order
    }

    fn set_timesteps(
        &mut self,
        num_inference_steps: usize,
        shift: f64,
        _device: &Device,
    ) -> Result<Vec<i64>> {
        if num_inference_steps == 0 {
            bail!("num_inference_steps must be at least 1");
        }
        let n = self.config.num_train_timesteps as f64;
        let mut sigmas = linspace(self.sigma_max, self.sigma_min, num_inference_steps + 1);
        sigmas.truncate(num_inference_steps);
        let sigmas: Vec<f64> = sigmas.into_iter().map(|s| shift_sigma(shift, s)).collect();

        self.timesteps = sigmas.iter().map(|s| (s * n) as i64).collect();
        self.sigmas = sigmas.into_iter().map(as_f32).collect();
        self.sigmas.push(0.0);

        self.model_outputs = vec![None; self.config.solver_order];
        self.last_sample = None;
        self.lower_order_nums = 0;
        self.this_order = 0;
        self.step_index = None;

        debug!(
            steps = num_inference_steps,
            shift,
            first = self.timesteps.first().copied(),
            last = self.timesteps.last().copied(),
            "timestep schedule"
        );
        Ok(self.timesteps.clone())
    }

    fn step(&mut self, model_output: &Tensor, timestep: i64, sample: &Tensor) -> Result<Tensor> {
        if self.timesteps.is_empty() {
            bail!("set_timesteps must be called before step");
        }
        let idx = match self.step_index {
            Some(idx) => idx,
            None => {
                let idx = self.index_for_timestep(timestep)?;
                self.step_index = Some(idx);
                idx
            }
        };
        if idx >= self.timesteps.len() {
            bail!("scheduler already finished ({} steps)", self.timesteps.len());
        }

        let sample = sample.to_dtype(DType::F32)?;
        let model_output = model_output.to_dtype(DType::F32)?;
        let sigma = self.sigmas[idx];
        let x0 = (&sample - (model_output * sigma)?)?;

        let use_corrector = idx > 0
            && !self.config.disable_corrector.contains(&(idx - 1))
            && self.last_sample.is_some();
        let sample = match (&self.last_sample, use_corrector) {
            (Some(last), true) => self.multistep_uni_c_update(&x0, last, self.this_order)?,
            _ => sample,
        };

        self.model_outputs.remove(0);
        self.model_outputs.push(Some(x0));

        let order = self.config.solver_order;
        let mut this_order = if self.config.lower_order_final {
            order.min(self.timesteps.len() - idx)
        } else {
            order
        };
        this_order = this_order.min(self.lower_order_nums + 1);
        self.this_order = this_order;

        let prev_sample = self.multistep_uni_p_update(&sample, this_order)?;
        self.last_sample = Some(sample);

        if self.lower_order_nums < order {
            self.lower_order_nums += 1;
        }
        self.step_index = Some(idx + 1);
        Ok(prev_sample)
    }
}

/// Gaussian elimination with partial pivoting for the small UniPC systems.
fn solve_linear(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Result<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < f64::EPSILON {
            bail!("singular UniPC system");
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Ok(x)
}
