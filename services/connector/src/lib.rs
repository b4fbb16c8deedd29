//! Self-host connector library.
//!
//! The connector runs on a machine that hosts VMs for a remote control plane.
//! After a one-time pairing it polls for lifecycle commands, runs them through
//! Ubuntu Multipass and acknowledges the outcome.
//!
//! ## Modules
//!
//! - `client`: HTTP client for the self-host endpoints
//! - `pairing`: credential exchange, writes `config.json`
//! - `control_loop`: adaptive poll / execute / acknowledge loop
//! - `dispatcher`: per-action handlers
//! - `hypervisor`: `multipass` invocation behind a runner trait
//! - `state`: durable host id → instance mapping
//! - `cloud_init`: first-boot provisioning files
//! - `daemon`: background process start/stop

pub mod client;
pub mod cloud_init;
pub mod config;
pub mod control_loop;
pub mod daemon;
pub mod dispatcher;
pub mod hypervisor;
pub mod pairing;
pub mod state;

pub use client::{ClientError, ControlPlaneClient};
pub use config::{AgentInfo, ConfigError, Configuration, Paths};
pub use control_loop::{ControlLoop, CycleOutcome, PollSchedule};
pub use dispatcher::{CommandError, Dispatcher};
pub use hypervisor::{MockRunner, Multipass, ProcessRunner};
pub use state::StateStore;
