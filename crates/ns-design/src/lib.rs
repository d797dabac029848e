//! # ns-design
//!
//! Blueprint descriptions and random blueprint generation.
//!
//! A blueprint is sampled from an experiment's parameters (row, block and
//! layer counts, layer settings, optimizer learning rate) and always ends in
//! a dense layer matching the experiment layout.

mod blueprint;
mod generator;

pub use blueprint::{
    Block, Blueprint, BlueprintId, BlueprintTraining, LayerSpec, Row, MAX_PARAMETERS,
};
pub use generator::{
    create_random_blueprint, create_random_blueprint_with_rng, BlueprintGenerator,
    RandomBlueprintGenerator,
};
