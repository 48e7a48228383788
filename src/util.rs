pub mod error;
pub mod lock;
pub mod progress;
pub(crate) mod retry;
