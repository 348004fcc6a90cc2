//! Common types for the credential gateway workspace

mod error;
pub mod queuehealth;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
