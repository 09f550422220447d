//! Deterministic, pure logic shared by the iteration engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod checkpoint;
pub mod circuit_breaker;
pub mod continuation;
pub mod hooks;
pub mod invariants;
pub mod promises;
pub mod resume;
pub mod types;
