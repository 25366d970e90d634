//! Consumable-resource accounting and best-fit node selection core for a
//! batch job scheduler's node-selection plugin.
//!
//! This crate implements the CORE described by the specification this
//! repository was built against: given a pending job's resource
//! requirements and a candidate bitmap of nodes, decide which nodes to
//! allocate while minimizing fragmentation. It does not implement a wire
//! protocol, persistence, or the host scheduler's own job/partition/node
//! tables — those are read-only collaborators passed in by the caller
//! (see [`types`], [`gres`], [`procs`]).
//!
//! The entry point for most callers is [`core::SelectCore`]; module-level
//! docs on [`cr_state`], [`filter`], [`selector`], and [`planner`] cover
//! the accounting, filtering, best-fit, and temporal-planning layers in
//! turn.

pub mod allocator;
pub mod bitmap;
pub mod core;
pub mod cr_state;
pub mod error;
pub mod filter;
pub mod gres;
pub mod mate;
pub mod nodeinfo;
pub mod planner;
pub mod procs;
pub mod reservation;
pub mod selector;
pub mod switches;
pub mod types;
pub mod watchdog;

pub use crate::core::SelectCore;
pub use crate::error::{CoreError, CoreResult};
