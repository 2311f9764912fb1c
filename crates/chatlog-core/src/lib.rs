//! Shared vocabulary for the chatlog crates: database roles and cooperative cancellation.

mod cancel;
mod role;

pub use cancel::CancellationToken;
pub use role::Role;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("unknown role: {0}")]
    UnknownRole(String),
}
