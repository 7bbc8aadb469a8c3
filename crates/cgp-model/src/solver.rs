//! Adaptive Dormand–Prince 4(5) integrator over a [`StateBuffer`].

use crate::error::{ModelError, Result};
use crate::named::StateBuffer;
use serde::Serialize;
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
pub struct RhsFailure(pub String);

impl fmt::Display for RhsFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Right-hand side `f(t, y, ydot, p)`: writes `dy/dt` into `ydot`.
pub type Rhs = Rc<dyn Fn(f64, &[f64], &mut [f64], &[f64]) -> std::result::Result<(), RhsFailure>>;

/// Root function `g(t, y, p)`; integration stops where it changes sign.
pub type RootFn = Rc<dyn Fn(f64, &[f64], &[f64]) -> f64>;

pub fn rhs_fn<F>(f: F) -> Rhs
where
    F: Fn(f64, &[f64], &mut [f64], &[f64]) -> std::result::Result<(), RhsFailure> + 'static,
{
    Rc::new(f)
}

pub fn root_fn<F>(f: F) -> RootFn
where
    F: Fn(f64, &[f64], &[f64]) -> f64 + 'static,
{
    Rc::new(f)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SolverOptions {
    pub reltol: f64,
    pub abstol: f64,
    /// Initial step; 0 picks one from the interval length.
    pub first_step: f64,
    pub min_step: f64,
    pub max_step: f64,
    pub max_steps: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            reltol: 1e-8,
            abstol: 1e-8,
            first_step: 0.0,
            min_step: 1e-14,
            max_step: f64::INFINITY,
            max_steps: 100_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SolverStatus {
    Success,
    RootFound { index: usize },
    RhsFailure { t: f64, message: String },
    TooMuchWork { t: f64 },
    StepTooSmall { t: f64 },
}

impl SolverStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, SolverStatus::Success | SolverStatus::RootFound { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Trajectory {
    pub t: Vec<f64>,
    /// `y[i]` is the state at `t[i]`.
    pub y: Vec<Vec<f64>>,
    pub status: SolverStatus,
    pub steps: usize,
}

impl Trajectory {
    pub fn last(&self) -> Option<(f64, &[f64])> {
        Some((*self.t.last()?, self.y.last()?.as_slice()))
    }

    pub fn column(&self, i: usize) -> Vec<f64> {
        self.y.iter().map(|row| row[i]).collect()
    }
}

const A21: f64 = 1.0 / 5.0;
const A31: f64 = 3.0 / 40.0;
const A32: f64 = 9.0 / 40.0;
const A41: f64 = 44.0 / 45.0;
const A42: f64 = -56.0 / 15.0;
const A43: f64 = 32.0 / 9.0;
const A51: f64 = 19372.0 / 6561.0;
const A52: f64 = -25360.0 / 2187.0;
const A53: f64 = 64448.0 / 6561.0;
const A54: f64 = -212.0 / 729.0;
const A61: f64 = 9017.0 / 3168.0;
const A62: f64 = -355.0 / 33.0;
const A63: f64 = 46732.0 / 5247.0;
const A64: f64 = 49.0 / 176.0;
const A65: f64 = -5103.0 / 18656.0;

const B1: f64 = 5179.0 / 57600.0;
const B3: f64 = 7571.0 / 16695.0;
const B4: f64 = 393.0 / 640.0;
const B5: f64 = -92097.0 / 339200.0;
const B6: f64 = 187.0 / 2100.0;
const B7: f64 = 1.0 / 40.0;

const BH1: f64 = 35.0 / 384.0;
const BH3: f64 = 500.0 / 1113.0;
const BH4: f64 = 125.0 / 192.0;
const BH5: f64 = -2187.0 / 6784.0;
const BH6: f64 = 11.0 / 84.0;

const E1: f64 = BH1 - B1;
const E3: f64 = BH3 - B3;
const E4: f64 = BH4 - B4;
const E5: f64 = BH5 - B5;
const E6: f64 = BH6 - B6;
const E7: f64 = -B7;

const ROOT_BISECTIONS: usize = 60;

#[derive(Debug, Clone)]
pub struct Solver {
    options: SolverOptions,
    k: [Vec<f64>; 7],
    y_tmp: Vec<f64>,
    y_new: Vec<f64>,
}

impl Solver {
    pub fn new(options: SolverOptions) -> Self {
        Self {
            options,
            k: Default::default(),
            y_tmp: Vec::new(),
            y_new: Vec::new(),
        }
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut SolverOptions {
        &mut self.options
    }

    fn ensure_workspace(&mut self, n: usize) {
        if self.y_new.len() != n {
            for k in self.k.iter_mut() {
                *k = vec![0.0; n];
            }
            self.y_tmp = vec![0.0; n];
            self.y_new = vec![0.0; n];
        }
    }

    /// Integrate from the live state at `t[0]`.
    ///
    /// With two time points every accepted step is reported; with more, output
    /// lands exactly on the requested times. The buffer holds the last
    /// accepted state on return, whatever the status.
    pub fn integrate(
        &mut self,
        rhs: &Rhs,
        y: &StateBuffer,
        p: &StateBuffer,
        t: &[f64],
        roots: &[RootFn],
    ) -> Result<Trajectory> {
        validate_times(t)?;
        let n = y.len();
        self.ensure_workspace(n);
        let params = p.to_vec();
        let dense = t.len() == 2;
        let t_end = t[t.len() - 1];
        let eps = 1e-12 * t_end.abs().max(1.0);
        let opts = self.options.clone();

        let mut tc = t[0];
        let mut cur = y.to_vec();
        let mut out = Trajectory {
            t: vec![tc],
            y: vec![cur.clone()],
            status: SolverStatus::Success,
            steps: 0,
        };
        let mut next_out = 1;
        let mut h = if opts.first_step > 0.0 {
            opts.first_step
        } else {
            ((t_end - tc) * 1e-3).max(opts.min_step)
        };
        let mut g_prev: Vec<f64> = roots.iter().map(|g| g(tc, &cur, &params)).collect();

        let status = loop {
            if tc >= t_end - eps {
                break SolverStatus::Success;
            }
            if out.steps >= opts.max_steps {
                break SolverStatus::TooMuchWork { t: tc };
            }
            let target = if dense { t_end } else { t[next_out] };
            let remaining = target - tc;
            let hh = h.min(opts.max_step).min(remaining);
            let err = match self.try_step(rhs, &params, tc, &cur, hh) {
                Ok(err) => err,
                Err(failure) => break failure,
            };
            out.steps += 1;

            if err <= 1.0 {
                let t_new = if hh >= remaining { target } else { tc + hh };
                let g_new: Vec<f64> = roots
                    .iter()
                    .map(|g| g(t_new, &self.y_new, &params))
                    .collect();
                if let Some(index) = first_crossing(&g_prev, &g_new) {
                    match self.locate_root(rhs, roots, index, &params, tc, &cur, hh, g_prev[index]) {
                        Ok(h_root) => {
                            tc += h_root;
                            cur.copy_from_slice(&self.y_new);
                            y.assign(&cur)?;
                            out.t.push(tc);
                            out.y.push(cur.clone());
                            break SolverStatus::RootFound { index };
                        }
                        Err(failure) => break failure,
                    }
                }
                tc = t_new;
                cur.copy_from_slice(&self.y_new);
                y.assign(&cur)?;
                g_prev = g_new;
                if dense {
                    out.t.push(tc);
                    out.y.push(cur.clone());
                } else if tc == target {
                    out.t.push(tc);
                    out.y.push(cur.clone());
                    next_out += 1;
                }
            } else if hh <= opts.min_step {
                break SolverStatus::StepTooSmall { t: tc };
            }

            let factor = if err == 0.0 {
                5.0
            } else if err.is_finite() {
                (0.9 * err.powf(-0.2)).clamp(0.2, 5.0)
            } else {
                0.2
            };
            h = (hh * factor).max(opts.min_step);
        };
        out.status = status;
        Ok(out)
    }

    fn try_step(
        &mut self,
        rhs: &Rhs,
        p: &[f64],
        t: f64,
        y: &[f64],
        h: f64,
    ) -> std::result::Result<f64, SolverStatus> {
        let n = y.len();
        let fail = |tf: f64, e: RhsFailure| SolverStatus::RhsFailure {
            t: tf,
            message: e.0,
        };
        let [k1, k2, k3, k4, k5, k6, k7] = &mut self.k;
        let y_tmp = &mut self.y_tmp;
        let y_new = &mut self.y_new;

        rhs(t, y, k1, p).map_err(|e| fail(t, e))?;
        for i in 0..n {
            y_tmp[i] = y[i] + h * A21 * k1[i];
        }
        rhs(t + h / 5.0, y_tmp, k2, p).map_err(|e| fail(t, e))?;
        for i in 0..n {
            y_tmp[i] = y[i] + h * (A31 * k1[i] + A32 * k2[i]);
        }
        rhs(t + 3.0 * h / 10.0, y_tmp, k3, p).map_err(|e| fail(t, e))?;
        for i in 0..n {
            y_tmp[i] = y[i] + h * (A41 * k1[i] + A42 * k2[i] + A43 * k3[i]);
        }
        rhs(t + 4.0 * h / 5.0, y_tmp, k4, p).map_err(|e| fail(t, e))?;
        for i in 0..n {
            y_tmp[i] = y[i] + h * (A51 * k1[i] + A52 * k2[i] + A53 * k3[i] + A54 * k4[i]);
        }
        rhs(t + 8.0 * h / 9.0, y_tmp, k5, p).map_err(|e| fail(t, e))?;
        for i in 0..n {
            y_tmp[i] =
                y[i] + h * (A61 * k1[i] + A62 * k2[i] + A63 * k3[i] + A64 * k4[i] + A65 * k5[i]);
        }
        rhs(t + h, y_tmp, k6, p).map_err(|e| fail(t, e))?;
        for i in 0..n {
            y_new[i] =
                y[i] + h * (BH1 * k1[i] + BH3 * k3[i] + BH4 * k4[i] + BH5 * k5[i] + BH6 * k6[i]);
        }
        rhs(t + h, y_new, k7, p).map_err(|e| fail(t, e))?;

        if n == 0 {
            return Ok(0.0);
        }
        let mut err = 0.0;
        for i in 0..n {
            let ei = h * (E1 * k1[i] + E3 * k3[i] + E4 * k4[i] + E5 * k5[i] + E6 * k6[i] + E7 * k7[i]);
            let sc = self.options.abstol + self.options.reltol * y[i].abs().max(y_new[i].abs());
            err += (ei / sc) * (ei / sc);
        }
        Ok((err / n as f64).sqrt())
    }

    /// Bisect the step length until root `index` is bracketed tightly.
    /// Leaves the state at the root in `self.y_new` and returns the step.
    #[allow(clippy::too_many_arguments)]
    fn locate_root(
        &mut self,
        rhs: &Rhs,
        roots: &[RootFn],
        index: usize,
        p: &[f64],
        t: f64,
        y: &[f64],
        h: f64,
        g_start: f64,
    ) -> std::result::Result<f64, SolverStatus> {
        let g = &roots[index];
        let (mut lo, mut hi) = (0.0, h);
        for _ in 0..ROOT_BISECTIONS {
            let mid = 0.5 * (lo + hi);
            if mid <= lo || mid >= hi {
                break;
            }
            self.try_step(rhs, p, t, y, mid)?;
            if g(t + mid, &self.y_new, p).signum() == g_start.signum() {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        self.try_step(rhs, p, t, y, hi)?;
        Ok(hi)
    }
}

impl Default for Solver {
    fn default() -> Self {
        Solver::new(SolverOptions::default())
    }
}

fn validate_times(t: &[f64]) -> Result<()> {
    if t.len() < 2 {
        return Err(ModelError::InvalidTime(format!(
            "need at least two time points, got {}",
            t.len()
        )));
    }
    if t.iter().any(|v| !v.is_finite()) {
        return Err(ModelError::InvalidTime("time points must be finite".to_string()));
    }
    if t.windows(2).any(|w| w[1] <= w[0]) {
        return Err(ModelError::InvalidTime(
            "time points must be strictly increasing".to_string(),
        ));
    }
    Ok(())
}

fn first_crossing(before: &[f64], after: &[f64]) -> Option<usize> {
    before
        .iter()
        .zip(after)
        .position(|(&a, &b)| (a < 0.0 && b >= 0.0) || (a > 0.0 && b <= 0.0))
}
