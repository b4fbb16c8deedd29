//! # connector-protocol
//!
//! Wire types shared between the self-host connector and its control plane.
//!
//! ## Endpoints
//!
//! - `POST /self-host/pair`: exchange a pairing token for connector credentials
//! - `GET /self-host/next`: fetch at most one pending command (204 when idle)
//! - `POST /self-host/ack`: report the outcome of a command
//!
//! ## Commands
//!
//! The control plane sends a loosely-typed [`CommandEnvelope`]. It is decoded
//! up front into a closed [`Command`] variant whose fields are already
//! validated, so handlers never see raw JSON. Unknown actions decode to
//! [`Command::Unsupported`] rather than failing.

mod command;
mod envelope;
mod error;
mod size;

pub use command::*;
pub use envelope::*;
pub use error::{PayloadError, SizeError};
pub use size::Size;
