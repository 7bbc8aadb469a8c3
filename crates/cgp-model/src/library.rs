//! Built-in models, addressable by name.

use crate::error::{ModelError, Result};
use crate::model::Model;
use crate::named::Layout;
use crate::solver::{rhs_fn, RhsFailure};

pub const MODEL_NAMES: &[&str] = &["vanderpol", "cascade", "membrane"];

pub const DEFAULT_CASCADE_GENES: usize = 3;

/// Van der Pol oscillator `x' = y`, `y' = epsilon (1 - x^2) y - x`,
/// starting at `(x, y) = (-2, 0)` with `epsilon = 1`.
pub fn vanderpol() -> Result<Model> {
    let rhs = rhs_fn(|_t, y, ydot, p| {
        let (x, v, eps) = (y[0], y[1], p[0]);
        ydot[0] = v;
        ydot[1] = eps * (1.0 - x * x) * v - x;
        Ok(())
    });
    Model::new(
        "vanderpol",
        rhs,
        Layout::scalars(&["x", "y"])?,
        vec![-2.0, 0.0],
        Layout::scalars(&["epsilon"])?,
        vec![1.0],
    )
}

/// Haploid gene cascade: gene 1 is produced constitutively, gene `i > 1` is
/// activated by gene `i - 1` through a Hill function.
pub fn cascade(genes: usize) -> Result<Model> {
    let genes = genes.max(1);
    let state: Vec<String> = (1..=genes).map(|i| format!("Y{i}")).collect();
    let mut parameters: Vec<String> = Vec::with_capacity(3 * genes + 1);
    let mut values = Vec::with_capacity(3 * genes + 1);
    for i in 1..=genes {
        parameters.push(format!("alpha{i}"));
        parameters.push(format!("theta{i}"));
        parameters.push(format!("gamma{i}"));
        values.extend([1.0, 0.5, 1.0]);
    }
    parameters.push("hill".to_string());
    values.push(4.0);

    let rhs = rhs_fn(move |_t, y, ydot, p| {
        if y.iter().any(|v| !v.is_finite()) {
            return Err(RhsFailure("non-finite expression level".to_string()));
        }
        let hill = p[3 * genes];
        for i in 0..genes {
            let (alpha, theta, gamma) = (p[3 * i], p[3 * i + 1], p[3 * i + 2]);
            let production = if i == 0 {
                alpha
            } else {
                let x = y[i - 1].max(0.0).powf(hill);
                alpha * x / (x + theta.powf(hill))
            };
            ydot[i] = production - gamma * y[i];
        }
        Ok(())
    });
    Model::new(
        "cascade",
        rhs,
        Layout::scalars(&state)?,
        vec![0.0; genes],
        Layout::scalars(&parameters)?,
        values,
    )
}

/// Single-compartment membrane with a potassium leak and a periodic stimulus.
pub fn leaky_membrane() -> Result<Model> {
    let parameters = [
        ("g_leak", 0.1),
        ("E_leak", -80.0),
        ("Cm", 1.0),
        ("Acap", 1.534e-4),
        ("Vmyo", 25.84e-6),
        ("F", 96.5),
        ("stim_amplitude", -80.0),
        ("stim_start", 20.0),
        ("stim_period", 71.43),
        ("stim_duration", 0.5),
    ];
    let rhs = rhs_fn(|t, y, ydot, p| {
        let [g_leak, e_leak, cm, acap, vmyo, f, amplitude, start, period, duration] = p else {
            return Err(RhsFailure(format!("expected 10 parameters, got {}", p.len())));
        };
        let i_leak = g_leak * (y[0] - e_leak);
        let i_stim = if t >= *start && (t - start).rem_euclid(*period) < *duration {
            *amplitude
        } else {
            0.0
        };
        ydot[0] = -(i_leak + i_stim);
        ydot[1] = -(i_leak + i_stim) * acap * cm / (vmyo * f);
        Ok(())
    });
    let names: Vec<&str> = parameters.iter().map(|(n, _)| *n).collect();
    Model::new(
        "membrane",
        rhs,
        Layout::scalars(&["V", "Ki"])?,
        vec![-80.0, 143.72],
        Layout::scalars(&names)?,
        parameters.iter().map(|(_, v)| *v).collect(),
    )
}

pub fn by_name(name: &str) -> Result<Model> {
    match name {
        "vanderpol" => vanderpol(),
        "cascade" => cascade(DEFAULT_CASCADE_GENES),
        "membrane" => leaky_membrane(),
        other => Err(ModelError::UnknownModel(format!(
            "{other} (known: {})",
            MODEL_NAMES.join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_listed_model_resolves() {
        for name in MODEL_NAMES {
            let model = by_name(name).expect("built-in model");
            assert_eq!(model.name(), *name);
        }
    }

    #[test]
    fn unknown_model_is_a_configuration_fault() {
        let err = by_name("sigmoid").expect_err("not built in");
        assert!(matches!(err, ModelError::UnknownModel(_)));
        assert!(err.is_configuration_fault());
    }

    #[test]
    fn cascade_layout_groups_parameters_by_gene() {
        let model = cascade(2).expect("cascade");
        let names: Vec<&str> = model.parameters().layout().names().collect();
        assert_eq!(
            names,
            ["alpha1", "theta1", "gamma1", "alpha2", "theta2", "gamma2", "hill"]
        );
        let state: Vec<&str> = model.state().layout().names().collect();
        assert_eq!(state, ["Y1", "Y2"]);
    }

    #[test]
    fn membrane_rests_at_leak_reversal() {
        let model = leaky_membrane().expect("membrane");
        let rates = model.rates_at(0.0, &model.y().to_vec()).expect("rates");
        assert_eq!(rates, vec![0.0, 0.0]);
    }

    #[test]
    fn membrane_stimulus_depolarizes() {
        let model = leaky_membrane().expect("membrane");
        let rates = model.rates_at(20.1, &model.y().to_vec()).expect("rates");
        assert_eq!(rates[0], 80.0);
        assert!(rates[1] > 0.0);
    }
}
