//! # Eraser
//!
//! Removes container images that no running workload uses from the nodes of
//! a cluster.
//!
//! ## Usage
//!
//! ```bash
//! eraser submit --all --wait
//! eraser run
//! eraser status <request-id>
//! ```
//!
//! ## Modules
//!
//! - `app` - Assembly of configured components into a controller
//! - `config` - Configuration file, defaults and environment overrides
//! - `controller` - CleanupRequest state machine and the Job Controller
//! - `cri` - Container runtime boundary (`crictl` and an in-memory runtime)
//! - `exclusion` - Images that must never be removed from a node
//! - `pipeline` - Collect, Scan and Remove stages run against one node
//! - `storage` - Durable request and execution records
//! - `subprocess` - Subprocess abstraction layer for testing
pub mod app;
pub mod config;
pub mod controller;
pub mod cri;
pub mod error;
pub mod exclusion;
pub mod pipeline;
pub mod storage;
pub mod subprocess;

pub use error::{Error, Result};
