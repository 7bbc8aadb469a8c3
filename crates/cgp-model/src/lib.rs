//! Named, restorable views over ODE models for causally cohesive
//! genotype-phenotype studies.

pub mod clamp;
pub mod error;
pub mod library;
pub mod model;
pub mod named;
pub mod scope;
pub mod solver;
pub mod study;

pub use clamp::{ClampOptions, ClampScope, DynClamp};
pub use error::{ModelError, Result};
pub use model::Model;
pub use named::{Layout, NamedView, StateBuffer};
pub use scope::{Override, OverrideScope, Values};
pub use solver::{rhs_fn, root_fn, Rhs, RhsFailure, RootFn, SolverOptions, SolverStatus, Trajectory};
pub use study::{Placevalue, StudyTables, Table};
