//! # carte-runtime
//!
//! Container lifecycle for the carte engine: persisted container records,
//! the `run`/`start`/`stop`/`remove` state machine, exit supervision, and
//! container logs. [`engine::Runtime`] is the operations surface the shell
//! calls into.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod container;
pub mod engine;
pub mod logs;
pub mod process;
pub mod state;

pub use engine::{ImageSummary, RunningContainer, Runtime};
