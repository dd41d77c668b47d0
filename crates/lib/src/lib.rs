//! bob-lib: core of the bob build orchestrator
//!
//! This crate provides everything between a tree of `bob.yaml` manifests and
//! finished outputs:
//! - `Bobfile` / `Aggregate`: manifests merged into one global task graph
//! - `Task`: input hashing and description of a unit of work
//! - `Target`: declared outputs, verified against a recorded `BuildInfo`
//! - `artifact`: content-addressed archives of targets
//! - `Playbook` / `execute`: per-invocation state and the parallel scheduler

pub mod aggregate;
pub mod artifact;
pub mod bobfile;
pub mod buildinfo;
pub mod consts;
pub mod execute;
pub mod init;
pub mod platform;
pub mod playbook;
pub mod store;
pub mod target;
pub mod task;
pub mod util;
