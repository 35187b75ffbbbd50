pub mod error;
pub mod events;
pub mod guard;
pub mod lock;
pub mod observe;
pub mod worker;

pub use error::GateError;
pub use lock::{LockGuard, SingletonLock};
