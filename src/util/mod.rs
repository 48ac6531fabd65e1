//! Helpers shared by the backends and orchestrators.

pub mod checksum;
pub mod process;
pub mod retention;

pub use process::CancelToken;
pub use retention::{RetentionOverrides, RetentionPolicy};
