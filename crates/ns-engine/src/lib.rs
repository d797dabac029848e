//! # ns-engine
//!
//! Turns blueprints into trainable CPU models and runs search trials.
//!
//! - [`ModelBuilder`] validates a blueprint against its layout and builds a
//!   [`Model`] on a device.
//! - [`Model::fit_generator`] trains over batch iterators, asking a fresh
//!   stopping condition after every epoch.
//! - [`TrialRunner`] chains generation, building, fitting and evaluation for
//!   one experiment inside a scoped working directory.

pub mod builder;
pub mod model;
pub mod trial;

mod network;
mod optimizer;

pub use builder::ModelBuilder;
pub use model::{FitResult, Model, Score};
pub use trial::{Trial, TrialId, TrialRunner, TrialStatus};
