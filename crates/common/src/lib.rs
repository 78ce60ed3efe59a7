//! Common types for the Gemini key pool proxy

mod secret;
mod error;

pub use secret::{Secret, mask};
pub use error::{Error, Result};
