//! Bounded, resumable, validated iteration loops for agent work.
//!
//! A driver opens a session for a task, then repeatedly validates the agent's
//! output against configured rules, advances to the next iteration, and finally
//! closes the session with a completion promise. Every transition is persisted
//! as an immutable checkpoint, so a session can be paused and resumed across
//! process restarts.
//!
//! - **[`core`]**: Pure, deterministic logic (checkpoint model, promise
//!   detection, circuit breaker, stop hooks, resume selection).
//! - **[`io`]**: Side effects (command execution, checkpoint and task stores,
//!   config, gate catalog, validation logs).
//!
//! [`session`], [`pause`] and [`gates`] coordinate the two to implement the
//! engine operations and CLI commands.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod gates;
pub mod io;
pub mod logging;
pub mod pause;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
