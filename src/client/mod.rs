mod core;
mod entrypoint;
pub mod registry;
mod session;
mod startup;
mod transaction;

pub use core::{Client, SessionOutcome};
pub use entrypoint::{client_entrypoint, client_entrypoint_unix};
