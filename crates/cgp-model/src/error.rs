use thiserror::Error;

pub type Result<T> = std::result::Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown_field: {name} is not a field of {vector}")]
    UnknownField { name: String, vector: String },
    #[error("unknown_key: {0} not in parameter or state vectors")]
    UnknownKey(String),
    #[error("ambiguous_key: {0} occurs in both parameter and state vectors")]
    AmbiguousKey(String),
    #[error("shape_mismatch: {target} expects {expected} value(s), got {found}")]
    ShapeMismatch {
        target: String,
        expected: usize,
        found: usize,
    },
    #[error("duplicate_field: {0} appears more than once in layout")]
    DuplicateField(String),
    #[error("missing_constant: {0} is required but not a parameter of the model")]
    MissingConstant(String),
    #[error("rebound: {0} view must alias the model's own buffer; assign contents instead")]
    Rebound(&'static str),
    #[error("invalid_time: {0}")]
    InvalidTime(String),
    #[error("rhs_failure: right-hand side failed at t={t}: {message}")]
    Rhs { t: f64, message: String },
    #[error("integration_failed: at t={t}: {reason}")]
    IntegrationFailed { t: f64, reason: String },
    #[error("no_equilibrium: max |dy/dt| = {max_rate:e} > tol after t={t}")]
    NoEquilibrium { t: f64, max_rate: f64 },
    #[error("unknown_model: {0}")]
    UnknownModel(String),
    #[error("invalid_study: {0}")]
    InvalidStudy(String),
}

impl ModelError {
    /// True for faults raised by validating caller-supplied names or shapes.
    pub fn is_configuration_fault(&self) -> bool {
        matches!(
            self,
            ModelError::UnknownField { .. }
                | ModelError::UnknownKey(_)
                | ModelError::AmbiguousKey(_)
                | ModelError::ShapeMismatch { .. }
                | ModelError::DuplicateField(_)
                | ModelError::MissingConstant(_)
                | ModelError::UnknownModel(_)
                | ModelError::InvalidStudy(_)
        )
    }

    /// Stable snake_case code, matching the message prefix.
    pub fn code(&self) -> &'static str {
        match self {
            ModelError::UnknownField { .. } => "unknown_field",
            ModelError::UnknownKey(_) => "unknown_key",
            ModelError::AmbiguousKey(_) => "ambiguous_key",
            ModelError::ShapeMismatch { .. } => "shape_mismatch",
            ModelError::DuplicateField(_) => "duplicate_field",
            ModelError::MissingConstant(_) => "missing_constant",
            ModelError::Rebound(_) => "rebound",
            ModelError::InvalidTime(_) => "invalid_time",
            ModelError::Rhs { .. } => "rhs_failure",
            ModelError::IntegrationFailed { .. } => "integration_failed",
            ModelError::NoEquilibrium { .. } => "no_equilibrium",
            ModelError::UnknownModel(_) => "unknown_model",
            ModelError::InvalidStudy(_) => "invalid_study",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_matches_message_prefix() {
        let errors = [
            ModelError::UnknownKey("k".to_string()),
            ModelError::Rebound("state"),
            ModelError::Rhs {
                t: 1.0,
                message: "nan".to_string(),
            },
            ModelError::NoEquilibrium { t: 2.0, max_rate: 0.5 },
            ModelError::InvalidStudy("no loci".to_string()),
        ];
        for err in errors {
            assert!(err.to_string().starts_with(&format!("{}: ", err.code())), "{err}");
        }
    }
}
