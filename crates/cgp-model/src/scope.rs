use crate::error::{ModelError, Result};
use crate::model::Model;
use std::ops::{Deref, DerefMut};
use tracing::trace;

/// A whole vector or a scalar broadcast over it.
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl Values {
    fn resolve(&self, target: &str, len: usize) -> Result<Vec<f64>> {
        match self {
            Values::Scalar(v) => Ok(vec![*v; len]),
            Values::Vector(v) if v.len() == len => Ok(v.clone()),
            // a one-element vector given for a wide target broadcasts like a scalar
            Values::Vector(v) if v.len() == 1 => Ok(vec![v[0]; len]),
            Values::Vector(v) => Err(ModelError::ShapeMismatch {
                target: target.to_string(),
                expected: len,
                found: v.len(),
            }),
        }
    }
}

impl From<f64> for Values {
    fn from(v: f64) -> Self {
        Values::Scalar(v)
    }
}

impl From<Vec<f64>> for Values {
    fn from(v: Vec<f64>) -> Self {
        Values::Vector(v)
    }
}

impl From<&[f64]> for Values {
    fn from(v: &[f64]) -> Self {
        Values::Vector(v.to_vec())
    }
}

impl<const N: usize> From<[f64; N]> for Values {
    fn from(v: [f64; N]) -> Self {
        Values::Vector(v.to_vec())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Override {
    parameters: Option<Values>,
    state: Option<Values>,
    named: Vec<(String, Values)>,
}

impl Override {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parameters(mut self, values: impl Into<Values>) -> Self {
        self.parameters = Some(values.into());
        self
    }

    pub fn state(mut self, values: impl Into<Values>) -> Self {
        self.state = Some(values.into());
        self
    }

    /// Set one field; the name must belong to exactly one of state or parameters.
    pub fn set(mut self, name: impl Into<String>, values: impl Into<Values>) -> Self {
        self.named.push((name.into(), values.into()));
        self
    }

    /// Validate everything against the model before anything is touched.
    fn plan(&self, model: &Model) -> Result<Plan> {
        let state = model.state();
        let parameters = model.parameters();
        let mut plan = Plan::default();
        if let Some(v) = &self.parameters {
            plan.parameters = Some(v.resolve("parameters", parameters.len())?);
        }
        if let Some(v) = &self.state {
            plan.state = Some(v.resolve("state", state.len())?);
        }
        for (name, value) in &self.named {
            let in_state = state.contains(name);
            let in_parameters = parameters.contains(name);
            let target = match (in_state, in_parameters) {
                (true, false) => Target::State,
                (false, true) => Target::Parameters,
                (true, true) => return Err(ModelError::AmbiguousKey(name.clone())),
                (false, false) => return Err(ModelError::UnknownKey(name.clone())),
            };
            let view = match target {
                Target::State => state,
                Target::Parameters => parameters,
            };
            let width = view.range(name)?.len();
            let values = value.resolve(&format!("{}.{}", view.label(), name), width)?;
            plan.named.push((target, name.clone(), values));
        }
        Ok(plan)
    }
}

#[derive(Debug, Clone, Copy)]
enum Target {
    State,
    Parameters,
}

#[derive(Debug, Default)]
struct Plan {
    parameters: Option<Vec<f64>>,
    state: Option<Vec<f64>>,
    named: Vec<(Target, String, Vec<f64>)>,
}

pub struct OverrideScope<'a> {
    model: &'a mut Model,
    saved_state: Vec<f64>,
    saved_parameters: Vec<f64>,
}

impl OverrideScope<'_> {
    fn apply(&mut self, plan: Plan) -> Result<()> {
        if let Some(p) = plan.parameters {
            self.model.parameters().buffer().assign(&p)?;
        }
        if let Some(y) = plan.state {
            self.model.y().assign(&y)?;
        }
        for (target, name, values) in plan.named {
            match target {
                Target::State => self.model.state().write(&name, &values)?,
                Target::Parameters => self.model.parameters().write(&name, &values)?,
            }
        }
        Ok(())
    }
}

impl Deref for OverrideScope<'_> {
    type Target = Model;

    fn deref(&self) -> &Model {
        self.model
    }
}

impl DerefMut for OverrideScope<'_> {
    fn deref_mut(&mut self) -> &mut Model {
        self.model
    }
}

impl Drop for OverrideScope<'_> {
    fn drop(&mut self) {
        // root functions cannot be snapshotted, so they are cleared, not restored
        self.model.clear_roots();
        let _ = self.model.y().assign(&self.saved_state);
        let _ = self.model.parameters().buffer().assign(&self.saved_parameters);
        trace!(model = %self.model.name(), "restored state and parameters");
    }
}

impl Model {
    /// Apply `ov` and return a guard that restores this model when dropped.
    pub fn autorestore(&mut self, ov: Override) -> Result<OverrideScope<'_>> {
        let plan = ov.plan(self)?;
        let mut scope = OverrideScope {
            saved_state: self.y().to_vec(),
            saved_parameters: self.parameters().to_vec(),
            model: self,
        };
        scope.apply(plan)?;
        Ok(scope)
    }

    pub fn with_override<R, E>(
        &mut self,
        ov: Override,
        body: impl FnOnce(&mut Model) -> std::result::Result<R, E>,
    ) -> std::result::Result<R, E>
    where
        E: From<ModelError>,
    {
        let mut scope = self.autorestore(ov)?;
        body(&mut *scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library;
    use crate::named::Layout;
    use crate::solver::{rhs_fn, root_fn};
    use std::panic::{catch_unwind, AssertUnwindSafe};

    fn bits(v: &[f64]) -> Vec<u64> {
        v.iter().map(|x| x.to_bits()).collect()
    }

    #[test]
    fn integrate_and_assignment_are_undone() {
        let mut vdp = library::vanderpol().expect("vanderpol");
        let before = (vdp.y().to_vec(), vdp.parameters().to_vec());
        {
            let mut scope = vdp.autorestore(Override::new()).expect("scope");
            scope.parameters().set("epsilon", 2.0).expect("set epsilon");
            let traj = scope.integrate(&[0.0, 1.0]).expect("integrate");
            assert!(traj.status.is_ok());
            assert_ne!(scope.y().to_vec(), before.0);
        }
        assert_eq!(bits(&vdp.y().to_vec()), bits(&before.0));
        assert_eq!(bits(&vdp.parameters().to_vec()), bits(&before.1));
    }

    #[test]
    fn whole_vectors_and_named_values_apply_inside_scope() {
        let mut vdp = library::vanderpol().expect("vanderpol");
        let ov = Override::new()
            .parameters(vec![123.0])
            .state(vec![456.0, 0.0])
            .set("y", 789.0);
        vdp.with_override(ov, |m| -> Result<()> {
            assert_eq!(m.parameters().get("epsilon")?, 123.0);
            assert_eq!(m.state().get("x")?, 456.0);
            assert_eq!(m.state().get("y")?, 789.0);
            Ok(())
        })
        .expect("body");
        assert_eq!(vdp.parameters().get("epsilon").expect("epsilon"), 1.0);
        assert_eq!(vdp.state().get("x").expect("x"), -2.0);
        assert_eq!(vdp.state().get("y").expect("y"), 0.0);
    }

    #[test]
    fn scalar_parameters_fill_singleton_vector() {
        let mut vdp = library::vanderpol().expect("vanderpol");
        let scope = vdp
            .autorestore(Override::new().parameters(5.0))
            .expect("scalar coerces");
        assert_eq!(scope.parameters().get("epsilon").expect("epsilon"), 5.0);
    }

    #[test]
    fn restores_when_body_fails() {
        let mut vdp = library::vanderpol().expect("vanderpol");
        let before = vdp.parameters().to_vec();
        let err = vdp
            .with_override(Override::new(), |m| -> Result<()> {
                m.parameters().set("epsilon", 50.0)?;
                Err(ModelError::InvalidTime("body failed".to_string()))
            })
            .expect_err("body error propagates");
        assert!(matches!(err, ModelError::InvalidTime(ref m) if m == "body failed"));
        assert_eq!(bits(&vdp.parameters().to_vec()), bits(&before));
    }

    #[test]
    fn restores_when_body_panics() {
        let mut vdp = library::vanderpol().expect("vanderpol");
        let before = (vdp.y().to_vec(), vdp.parameters().to_vec());
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _ = vdp.with_override(Override::new().set("x", 9.0), |m| -> Result<()> {
                m.parameters().set("epsilon", 50.0)?;
                panic!("inside scope");
            });
        }));
        assert!(result.is_err());
        assert_eq!(bits(&vdp.y().to_vec()), bits(&before.0));
        assert_eq!(bits(&vdp.parameters().to_vec()), bits(&before.1));
    }

    #[test]
    fn roots_are_cleared_on_exit() {
        let mut vdp = library::vanderpol().expect("vanderpol");
        {
            let mut scope = vdp.autorestore(Override::new()).expect("scope");
            scope.set_roots(vec![root_fn(|_t, y, _p| y[0])]);
            assert_eq!(scope.roots().len(), 1);
        }
        assert!(vdp.roots().is_empty());
    }

    #[test]
    fn key_in_both_vectors_is_rejected_before_mutation() {
        let rhs = rhs_fn(|_t, _y, ydot, _p| {
            ydot.fill(0.0);
            Ok(())
        });
        let mut model = Model::new(
            "clash",
            rhs,
            Layout::scalars(&["a", "k"]).expect("state"),
            vec![1.0, 2.0],
            Layout::scalars(&["k", "b"]).expect("parameters"),
            vec![3.0, 4.0],
        )
        .expect("model");
        let ov = Override::new()
            .state(vec![10.0, 20.0])
            .set("a", 5.0)
            .set("k", 7.0);
        let err = model.autorestore(ov).err().expect("ambiguous key");
        assert!(matches!(err, ModelError::AmbiguousKey(ref k) if k == "k"));
        assert!(err.is_configuration_fault());
        assert_eq!(model.y().to_vec(), vec![1.0, 2.0]);
        assert_eq!(model.parameters().to_vec(), vec![3.0, 4.0]);
    }

    #[test]
    fn unknown_key_is_rejected_before_mutation() {
        let mut vdp = library::vanderpol().expect("vanderpol");
        let err = vdp
            .autorestore(Override::new().parameters(9.0).set("nope", 1.0))
            .err()
            .expect("unknown key");
        assert!(matches!(err, ModelError::UnknownKey(ref k) if k == "nope"));
        assert_eq!(vdp.parameters().get("epsilon").expect("epsilon"), 1.0);
    }

    #[test]
    fn wrong_vector_length_is_rejected() {
        let mut vdp = library::vanderpol().expect("vanderpol");
        let err = vdp
            .autorestore(Override::new().state(vec![1.0, 2.0, 3.0]))
            .err()
            .expect("shape mismatch");
        assert!(matches!(err, ModelError::ShapeMismatch { expected: 2, found: 3, .. }));
        assert_eq!(vdp.y().to_vec(), vec![-2.0, 0.0]);
    }
}
