//! Declarative provisioning of libvirt VM clusters.
//!
//! A project configuration describes one or more clusters, each with its
//! own networks, VMs (disks and network adapters) and generated files. This
//! crate turns that description into an ordered, re-runnable sequence of
//! control-plane operations: networks first, then VM clones, disks,
//! adapters and power-on, then DHCP address acquisition and SSH access.
//! Template VMs for clusters to clone from can be built from cloud images
//! with a cloud-init seed (see [`templates`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use boxman::config::load_project;
//! use boxman::control::virsh::{VirshControlPlane, VirshSettings};
//! use boxman::executor::LocalExecutor;
//! use boxman::graph::ResourceGraph;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_project("conf.yml".as_ref())?;
//!     let graph = ResourceGraph::build(&config)?;
//!
//!     let executor = Arc::new(LocalExecutor::new());
//!     let control = VirshControlPlane::new(executor.clone(), VirshSettings::default());
//!     // ... hand both to an `Orchestrator` and call `provision(&graph, ..)`
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod access;
pub mod config;
pub mod control;
pub mod credentials;
pub mod error;
pub mod executor;
pub mod graph;
pub mod names;
pub mod network;
pub mod orchestrator;
pub mod power;
pub mod provisioner;
pub mod registry;
pub mod report;
pub mod retry;
pub mod snapshot;
pub mod tasks;
pub mod templates;
pub mod waiter;

#[cfg(test)]
pub(crate) mod testing;

pub use control::{ControlError, ControlPlane, DomainState};
pub use error::{BoxmanError, Result};
pub use executor::{CommandOutput, CommandSpec, Executor, RuntimeKind};
pub use graph::{Machines, ResourceGraph};
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use report::{Outcome, RunReport, RunStatus};
