//! Derived models that pin or steer selected state variables.

use crate::error::{ModelError, Result};
use crate::model::Model;
use crate::named::{NamedView, StateBuffer};
use crate::solver::{rhs_fn, Rhs};
use std::ops::{Deref, DerefMut, Range};
use tracing::debug;

/// Parameter holding a built-in stimulus protocol; zeroed while clamped.
pub const STIMULUS_PARAMETER: &str = "stim_amplitude";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClampOptions {
    pub share_parameters: bool,
}

impl Default for ClampOptions {
    fn default() -> Self {
        Self {
            share_parameters: true,
        }
    }
}

/// Feedback current `(V - setpoint) / resistance` injected into the voltage
/// derivative, with a matching change in the ion carrier.
#[derive(Debug, Clone, PartialEq)]
pub struct DynClamp {
    pub setpoint: f64,
    pub resistance: f64,
    pub voltage: String,
    pub ion: String,
    /// Conversion from current to ion concentration rate; computed from
    /// `Acap * Cm / (Vmyo * F)` when absent.
    pub scale: Option<f64>,
}

impl DynClamp {
    pub fn new(setpoint: f64) -> Self {
        Self {
            setpoint,
            resistance: 0.02,
            voltage: "V".to_string(),
            ion: "Ki".to_string(),
            scale: None,
        }
    }

    pub fn resistance(mut self, resistance: f64) -> Self {
        self.resistance = resistance;
        self
    }

    pub fn voltage(mut self, field: impl Into<String>) -> Self {
        self.voltage = field.into();
        self
    }

    pub fn ion(mut self, field: impl Into<String>) -> Self {
        self.ion = field.into();
        self
    }

    pub fn scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }
}

/// A derived model borrowed from its origin.
pub struct ClampScope<'a> {
    origin: &'a mut Model,
    derived: Model,
    stimulus: Option<(usize, f64)>,
}

impl ClampScope<'_> {
    pub fn origin(&self) -> &Model {
        self.origin
    }

    pub fn derived(&self) -> &Model {
        &self.derived
    }

    fn copy_back(&self) {
        let from = self.derived.state();
        let to = self.origin.state();
        for (name, width) in from.layout().fields() {
            match to.layout().range_of(name) {
                Some(range) if range.len() == *width => {
                    if let Ok(values) = from.read(name) {
                        let _ = to.write(name, &values);
                    }
                }
                _ => {}
            }
        }
    }
}

impl Deref for ClampScope<'_> {
    type Target = Model;

    fn deref(&self) -> &Model {
        &self.derived
    }
}

impl DerefMut for ClampScope<'_> {
    fn deref_mut(&mut self) -> &mut Model {
        &mut self.derived
    }
}

impl Drop for ClampScope<'_> {
    fn drop(&mut self) {
        self.copy_back();
        if let Some((i, value)) = self.stimulus {
            self.derived.parameters().buffer().set(i, value);
        }
        debug!(
            origin = %self.origin.name(),
            derived = %self.derived.name(),
            "copied clamped state back"
        );
    }
}

fn scalar_index(view: &NamedView, name: &str) -> Result<usize> {
    let range = view.range(name)?;
    if range.len() != 1 {
        return Err(ModelError::ShapeMismatch {
            target: format!("{}.{}", view.label(), name),
            expected: 1,
            found: range.len(),
        });
    }
    Ok(range.start)
}

fn constant(parameters: &NamedView, name: &str) -> Result<f64> {
    if !parameters.contains(name) {
        return Err(ModelError::MissingConstant(name.to_string()));
    }
    parameters.get(name)
}

impl Model {
    pub fn clamp(&mut self, fixed: &[(&str, f64)]) -> Result<ClampScope<'_>> {
        self.clamp_with(fixed, ClampOptions::default())
    }

    pub fn clamp_with(&mut self, fixed: &[(&str, f64)], options: ClampOptions) -> Result<ClampScope<'_>> {
        let mut pins: Vec<(usize, f64)> = Vec::new();
        for &(name, value) in fixed {
            let range: Range<usize> = self.state().range(name)?;
            pins.extend(range.map(|i| (i, value)));
        }
        let inner = self.rhs().clone();
        let rhs_pins = pins.clone();
        let rhs = rhs_fn(move |t, y, ydot, p| {
            let mut work = y.to_vec();
            for &(i, v) in &rhs_pins {
                work[i] = v;
            }
            inner(t, &work, ydot, p)?;
            for &(i, _) in &rhs_pins {
                ydot[i] = 0.0;
            }
            Ok(())
        });
        let mut y0 = self.y().to_vec();
        for &(i, v) in &pins {
            y0[i] = v;
        }
        let names: Vec<&str> = fixed.iter().map(|(n, _)| *n).collect();
        debug!(model = %self.name(), clamped = ?names, "clamp");
        let name = format!("{}_clamped", self.name());
        self.derive(name, rhs, y0, options)
    }

    pub fn dynclamp(&mut self, settings: DynClamp) -> Result<ClampScope<'_>> {
        self.dynclamp_with(settings, ClampOptions::default())
    }

    pub fn dynclamp_with(&mut self, settings: DynClamp, options: ClampOptions) -> Result<ClampScope<'_>> {
        let iv = scalar_index(self.state(), &settings.voltage)?;
        let iion = scalar_index(self.state(), &settings.ion)?;
        let scale = match settings.scale {
            Some(scale) => scale,
            None => {
                let p = self.parameters();
                constant(p, "Acap")? * constant(p, "Cm")? / (constant(p, "Vmyo")? * constant(p, "F")?)
            }
        };
        let inner = self.rhs().clone();
        let DynClamp {
            setpoint,
            resistance,
            ..
        } = settings;
        let rhs = rhs_fn(move |t, y, ydot, p| {
            inner(t, y, ydot, p)?;
            let i_app = (y[iv] - setpoint) / resistance;
            ydot[iv] -= i_app;
            ydot[iion] -= i_app * scale;
            Ok(())
        });
        debug!(
            model = %self.name(),
            setpoint,
            resistance,
            scale,
            "dynclamp"
        );
        let y0 = self.y().to_vec();
        let name = format!("{}_dynclamped", self.name());
        self.derive(name, rhs, y0, options)
    }

    fn derive(
        &mut self,
        name: String,
        rhs: Rhs,
        y0: Vec<f64>,
        options: ClampOptions,
    ) -> Result<ClampScope<'_>> {
        let p = if options.share_parameters {
            self.parameters().buffer().clone()
        } else {
            StateBuffer::new(self.parameters().to_vec())
        };
        let derived = Model::from_parts(
            name,
            rhs,
            self.state().layout_rc(),
            StateBuffer::new(y0),
            self.parameters().layout_rc(),
            p,
            self.solver_options().clone(),
            self.time_span().to_vec(),
        )?;
        let stimulus = match derived.parameters().layout().range_of(STIMULUS_PARAMETER) {
            Some(range) if range.len() == 1 => {
                let i = range.start;
                let saved = derived.parameters().buffer().get(i);
                derived.parameters().buffer().set(i, 0.0);
                Some((i, saved))
            }
            _ => None,
        };
        Ok(ClampScope {
            origin: self,
            derived,
            stimulus,
        })
    }
}
