//! Star-topology repair agent runner.
//!
//! A coordinator owns one sandbox and dispatches specialized agent sessions
//! ("spokes") against it in order. Each session runs an explicit step engine:
//! query a model, parse one action, execute it in the sandbox, record the step.
//! Spokes share nothing but a structured handoff document.
//!
//! - **[`core`]**: Pure, deterministic logic (ids, history partitions, command policy,
//!   action parsing, budgets, handoff extraction). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (model transport, sandbox, process execution,
//!   config, templates, persistence). Isolated behind traits to enable doubles in tests.
//!
//! Orchestration modules ([`session`], [`engine`], [`coordinator`]) combine the two
//! to implement the CLI commands.

pub mod coordinator;
pub mod core;
pub mod engine;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
