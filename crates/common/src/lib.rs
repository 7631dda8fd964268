//! Types shared by the back-office client crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
