use crate::error::{ModelError, Result};
use crate::named::{Layout, NamedView, StateBuffer};
use crate::scope::Override;
use crate::solver::{Rhs, RootFn, Solver, SolverOptions, Trajectory};
use std::fmt;
use std::rc::Rc;
use tracing::debug;

pub struct Model {
    name: String,
    rhs: Rhs,
    y: StateBuffer,
    p: StateBuffer,
    state: NamedView,
    parameters: NamedView,
    solver: Solver,
    t: Vec<f64>,
    roots: Vec<RootFn>,
}

impl Model {
    pub fn new(
        name: impl Into<String>,
        rhs: Rhs,
        state_layout: Layout,
        y0: Vec<f64>,
        parameter_layout: Layout,
        p: Vec<f64>,
    ) -> Result<Self> {
        Model::from_parts(
            name.into(),
            rhs,
            Rc::new(state_layout),
            StateBuffer::new(y0),
            Rc::new(parameter_layout),
            StateBuffer::new(p),
            SolverOptions::default(),
            vec![0.0, 1.0],
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        name: String,
        rhs: Rhs,
        state_layout: Rc<Layout>,
        y: StateBuffer,
        parameter_layout: Rc<Layout>,
        p: StateBuffer,
        options: SolverOptions,
        t: Vec<f64>,
    ) -> Result<Self> {
        let state = NamedView::new("state", state_layout, y.clone())?;
        let parameters = NamedView::new("parameters", parameter_layout, p.clone())?;
        Ok(Model {
            name,
            rhs,
            y,
            p,
            state,
            parameters,
            solver: Solver::new(options),
            t,
            roots: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rhs(&self) -> &Rhs {
        &self.rhs
    }

    pub fn state(&self) -> &NamedView {
        &self.state
    }

    pub fn parameters(&self) -> &NamedView {
        &self.parameters
    }

    pub fn y(&self) -> &StateBuffer {
        &self.y
    }

    pub fn time_span(&self) -> &[f64] {
        &self.t
    }

    pub fn set_time_span(&mut self, t: Vec<f64>) -> Result<()> {
        if t.len() < 2 || t.windows(2).any(|w| !(w[1] > w[0])) {
            return Err(ModelError::InvalidTime(format!(
                "time span must be increasing with at least two points: {:?}",
                t
            )));
        }
        self.t = t;
        Ok(())
    }

    pub fn solver_options(&self) -> &SolverOptions {
        self.solver.options()
    }

    pub fn solver_options_mut(&mut self) -> &mut SolverOptions {
        self.solver.options_mut()
    }

    pub fn set_roots(&mut self, roots: Vec<RootFn>) {
        self.roots = roots;
    }

    pub fn clear_roots(&mut self) {
        self.roots.clear();
    }

    pub fn roots(&self) -> &[RootFn] {
        &self.roots
    }

    /// Replace the state view, e.g. with a relabelled layout. The new view
    /// must alias the buffer the solver integrates.
    pub fn rebind_state(&mut self, view: NamedView) -> Result<()> {
        if !view.buffer().same_buffer(&self.y) {
            return Err(ModelError::Rebound("state"));
        }
        self.state = view;
        Ok(())
    }

    pub fn rebind_parameters(&mut self, view: NamedView) -> Result<()> {
        if !view.buffer().same_buffer(&self.p) {
            return Err(ModelError::Rebound("parameters"));
        }
        self.parameters = view;
        Ok(())
    }

    pub fn integrate(&mut self, t: &[f64]) -> Result<Trajectory> {
        let traj = self
            .solver
            .integrate(&self.rhs, &self.y, &self.p, t, &self.roots)?;
        debug!(
            model = %self.name,
            steps = traj.steps,
            status = ?traj.status,
            "integrated"
        );
        Ok(traj)
    }

    pub fn rates_at(&self, t: f64, y: &[f64]) -> Result<Vec<f64>> {
        if y.len() != self.y.len() {
            return Err(ModelError::ShapeMismatch {
                target: "state".to_string(),
                expected: self.y.len(),
                found: y.len(),
            });
        }
        let mut ydot = vec![0.0; y.len()];
        let p = self.p.borrow();
        (self.rhs)(t, y, &mut ydot, &p).map_err(|e| ModelError::Rhs { t, message: e.0 })?;
        Ok(ydot)
    }

    /// Recompute derivatives along a trajectory, optionally with temporary
    /// parameters. Model parameters are unchanged afterwards.
    pub fn rates(&mut self, t: &[f64], ys: &[Vec<f64>], par: Option<&[f64]>) -> Result<Vec<Vec<f64>>> {
        if t.len() != ys.len() {
            return Err(ModelError::ShapeMismatch {
                target: "trajectory".to_string(),
                expected: t.len(),
                found: ys.len(),
            });
        }
        let ov = match par {
            Some(p) => Override::new().parameters(p.to_vec()),
            None => Override::new(),
        };
        self.with_override(ov, |m| {
            t.iter()
                .zip(ys)
                .map(|(&ti, yi)| m.rates_at(ti, yi))
                .collect()
        })
    }

    pub fn max_rate(&self, t: f64) -> Result<f64> {
        let y = self.y.to_vec();
        let ydot = self.rates_at(t, &y)?;
        Ok(ydot.iter().fold(0.0, |acc: f64, v| acc.max(v.abs())))
    }

    /// Integrate in doubling chunks until every `|dy/dt| < tol`.
    pub fn equilibrium(&mut self, tmax: f64, tol: f64) -> Result<(f64, Vec<f64>)> {
        let mut t0 = self.t[0];
        let mut span = (self.t[self.t.len() - 1] - t0).max(f64::EPSILON);
        loop {
            let rate = self.max_rate(t0)?;
            if rate < tol {
                return Ok((t0, self.y.to_vec()));
            }
            if t0 >= tmax {
                return Err(ModelError::NoEquilibrium {
                    t: t0,
                    max_rate: rate,
                });
            }
            let t1 = (t0 + span).min(tmax);
            let traj = self.integrate(&[t0, t1])?;
            if !traj.status.is_ok() {
                return Err(ModelError::IntegrationFailed {
                    t: t0,
                    reason: format!("{:?}", traj.status),
                });
            }
            t0 = traj.last().map(|(t, _)| t).unwrap_or(t1);
            span *= 2.0;
        }
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name)
            .field("t", &self.t)
            .field("state", &self.state)
            .field("parameters", &self.parameters)
            .finish()
    }
}
