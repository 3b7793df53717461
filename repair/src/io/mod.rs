//! I/O boundaries: model transport, sandbox, processes, config, prompts, persistence.

pub mod config;
pub mod local_env;
pub mod model;
pub mod process;
pub mod prompt;
pub mod sandbox;
pub mod trajectory_store;
