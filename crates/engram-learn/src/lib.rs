pub mod cases;
pub mod error;
pub mod instincts;
pub mod patterns;
pub mod types;

pub use cases::extract_cases;
pub use error::LearnError;
pub use instincts::{injectable_instincts, store_instincts, synthesize_instincts};
pub use patterns::extract_patterns;
pub use types::{Case, ErrorCategory, Instinct, Pattern, Solution};
