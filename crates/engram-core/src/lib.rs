pub mod config;
pub mod error;
pub mod key;
pub mod transcript;

pub use error::{EngramError, Result};
