//! # volley
//!
//! A distributed test executor built around a central suite queue. A master
//! process partitions a fixed set of test suites across worker processes on
//! one or more hosts, balances load by history-informed ordering, and folds
//! per-suite results into a single exit status.
//!
//! ## Architecture
//!
//! The crate is organized around the master-worker coordination core:
//!
//! - [`master`] — the dispatch loop. A single task owns the suite queue, the
//!   worker table, and the listener, and serves `POP` requests until the
//!   queue drains.
//! - [`queue`] — the ordered suite queue: longest-first by recorded
//!   duration, fresh discoveries at the front, whitelist order when one is
//!   active.
//! - [`protocol`] — the line-oriented wire protocol and the versioned record
//!   schema shared by workers, relays, and discovery.
//! - [`supervisor`] — worker process spawning, output capture, reaping, and
//!   the kill path.
//! - [`worker`] / [`discovery`] — the subprocess entry points, reached by
//!   re-executing the binary with hidden subcommands.
//! - [`relay`] — a secondary master on another host that federates its
//!   workers into the primary's run.
//! - [`driver`] — lifecycle orchestration from listener start to exit
//!   status.
//! - [`framework`] — the adapter seam: the only code that understands what a
//!   suite actually is ([`framework::TestFramework`]).
//! - [`stats`] — persisted suite durations that seed the next run's
//!   ordering.
//!
//! ## Embedding
//!
//! The `volley` binary wires a configured framework adapter and default
//! hooks into the driver. Embedders with their own binary supply a
//! [`framework::TestFramework`] and a [`hooks::RunHooks`] implementation and
//! must route the hidden `worker` and `discover` subcommands to
//! [`worker::worker_main`] and [`discovery::discovery_main`]; the driver
//! re-executes the current binary with those subcommands in place of a
//! traditional fork.
//!
//! ```no_run
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! use volley::config::load_config;
//! use volley::driver::{Driver, RunContext};
//! use volley::framework::ScriptFramework;
//! use volley::hooks::DefaultHooks;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let path = PathBuf::from("volley.toml");
//!     let config = load_config(&path)?;
//!     let framework = match &config.framework {
//!         volley::config::FrameworkConfig::Scripts(cfg) => {
//!             Arc::new(ScriptFramework::new(cfg.clone()))
//!         }
//!         _ => unreachable!(),
//!     };
//!     let ctx = RunContext::new(config, path)?;
//!     let driver = Driver::new(ctx, framework, Arc::new(DefaultHooks));
//!     std::process::exit(driver.run().await?);
//! }
//! ```

pub mod config;
pub mod discovery;
pub mod driver;
pub mod framework;
pub mod hooks;
pub mod master;
pub mod protocol;
pub mod queue;
pub mod relay;
pub mod stats;
pub mod supervisor;
pub mod worker;

pub use config::{load_config, Config};
pub use driver::{Driver, RunContext};
pub use framework::{Suite, TestFramework};
pub use hooks::{DefaultHooks, RunHooks};
pub use protocol::{Endpoint, RunToken, SuiteId, SuiteOutcome, SuiteResult, WorkerRecord};
pub use queue::SuiteQueue;
pub use stats::SuiteStats;
