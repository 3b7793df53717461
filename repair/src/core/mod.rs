//! Deterministic, pure logic shared by the repair engine and coordinator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod handoff;
pub mod history;
pub mod parser;
pub mod policy;
pub mod request;
pub mod result;
pub mod tools;
pub mod types;
