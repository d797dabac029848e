//! # ns-types
//!
//! Core types for the architecture search core: layouts, training policies,
//! stopping conditions, experiment parameters, data sources, environments
//! and the experiment aggregate that ties them together.

pub mod config;
pub mod data;
pub mod environment;
pub mod errors;
pub mod experiment;
pub mod layout;
pub mod parameters;
pub mod stopping;
pub mod training;

pub use config::*;
pub use data::*;
pub use environment::*;
pub use errors::*;
pub use experiment::*;
pub use layout::*;
pub use parameters::{
    default_parameters, ExperimentParameters, Parameter, ParameterValue, LAYER, LAYOUT, OPTIMIZER,
};
pub use stopping::*;
pub use training::*;
