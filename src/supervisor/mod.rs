//! Supervisor-process side: process table, fork/reap/respawn machinery,
//! and the shutdown/restart state machine.

pub mod run;
pub mod signals;
pub mod spawn;
pub mod status;
pub mod table;

pub use run::{Outcome, Supervisor};
