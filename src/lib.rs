//! The Hadron flow runtime.
//!
//! Runs flow programs, graphs of stages connected by partitioned queues, as a set of stage
//! instances under a single aggregate controller per run, with support for suspending, resuming,
//! stopping & live rescaling of individual stages.

pub mod app;
pub mod config;
pub mod controller;
pub mod error;
pub mod fanout;
#[cfg(test)]
mod fixtures;
pub mod instance;
pub mod listener;
pub mod loader;
pub mod models;
pub mod queue;
pub mod registry;
#[cfg(test)]
mod registry_test;
pub mod runner;
pub mod server;
pub mod store;

// Public exports for binaries.
pub use crate::{
    app::App,
    config::Config,
    controller::FlowController,
    runner::FlowProgramRunner,
};
