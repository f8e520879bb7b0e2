//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled          |
//! |------------|---------------------------|
//! | `run`      | `Run`                     |
//! | `recover`  | `Recover`, `Sessions`     |
//! | `plugins`  | `Plugins`                 |
//! | `config`   | `Config`                  |
//!
//! `setup` wires configuration into an [`Orchestrator`](conductor::orchestrator::Orchestrator).

pub mod config;
pub mod plugins;
pub mod recover;
pub mod run;
pub mod setup;

pub use config::cmd_config;
pub use plugins::cmd_plugins;
pub use recover::{cmd_recover, cmd_sessions};
pub use run::{cmd_run, run_options};
