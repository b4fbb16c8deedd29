//! Error display for the CLI.

use colored::Colorize;
use self_host_connector::config::ConfigError;
use self_host_connector::daemon::DaemonError;
use self_host_connector::hypervisor::HypervisorError;
use self_host_connector::pairing::PairError;
use thiserror::Error;

/// Binary-level errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Ubuntu Multipass not found or not working; install multipass first")]
    MultipassUnavailable(#[source] HypervisorError),
}

fn hint(err: &(dyn std::error::Error + 'static)) -> Option<&'static str> {
    if let Some(e) = err.downcast_ref::<CliError>() {
        return match e {
            CliError::MultipassUnavailable(_) => {
                Some("Hint: Install it from https://canonical.com/multipass")
            }
        };
    }
    if let Some(e) = err.downcast_ref::<PairError>() {
        return match e {
            PairError::InvalidCredentials(_) => {
                Some("Hint: Pairing tokens can only be used once. Create a new one and retry.")
            }
            PairError::Network(_) => {
                Some("Hint: Check your network connection and the --base-url value.")
            }
            _ => None,
        };
    }
    if let Some(e) = err.downcast_ref::<ConfigError>() {
        return match e {
            ConfigError::NotFound { .. } | ConfigError::MissingCredentials { .. } => Some(
                "Hint: Run `cocalc-self-host-connector pair --base-url <url> --token <pairing_token>`.",
            ),
            _ => None,
        };
    }
    if let Some(e) = err.downcast_ref::<DaemonError>() {
        return match e {
            DaemonError::AlreadyRunning(_) => {
                Some("Hint: Run `cocalc-self-host-connector stop` first.")
            }
            DaemonError::DidNotExit(_) => {
                Some("Hint: Wait for the current command to finish, then run stop again.")
            }
            _ => None,
        };
    }
    None
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    let mut source = err.source();
    while let Some(cause) = source {
        eprintln!("  {} {}", "caused by:".dimmed(), cause);
        source = cause.source();
    }

    if let Some(hint) = err.chain().find_map(|cause| hint(cause)) {
        eprintln!("\n{}", hint.yellow());
    }
}
