//! Cross-compilation and deployment pipeline for an embedded Lua engine.
//!
//! Builds a vendored Lua runtime into a static archive with an ARM cross
//! toolchain, links it with the engine's C sources into one executable, and
//! copies the executable plus the Lua apps to the device file by file.
//!
//! # Architecture
//!
//! ```text
//! pipeline ──▶ graph ──▶ cache      (skip satisfied objects / archive)
//!    │           ├─────▶ toolchain  (compile, archive, link via CommandRunner)
//!    │           └─────▶ shim       (pinned device libraries, link order)
//!    └──────▶ deploy                (one scp per file)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use crossbuild::{config, HostRunner, Pipeline};
//!
//! let config = config::load_config("Crossbuild.toml".as_ref())?;
//! let report = Pipeline::new(&config, &HostRunner).run()?;
//! assert!(report.is_success());
//! ```

pub mod cache;
pub mod config;
pub mod deploy;
pub mod graph;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod runs;
pub mod shim;
pub mod toolchain;

#[cfg(test)]
mod testutil;

pub use cache::{ArtifactCache, BuildLock, CachePolicy};
pub use config::Config;
pub use deploy::{DeployReport, DeploymentItem, ScpTransport, Transport};
pub use graph::{BuildGraph, BuildPlan, BuildReport};
pub use pipeline::{Pipeline, RunReport};
pub use shim::{AbiShim, LinkTarget};
pub use toolchain::{CommandLine, CommandRunner, HostRunner, ToolOutput, Toolchain};
