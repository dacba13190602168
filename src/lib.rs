#[macro_use]
extern crate tracing;

#[macro_use]
extern crate serde;

pub mod cli;
pub mod common;
pub mod config;
pub mod data;
pub mod federation;
pub mod model;
pub mod runner;
pub mod world;
