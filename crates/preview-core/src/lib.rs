pub mod config;
pub mod container;
pub mod error;
pub mod paths;
pub mod qr;
pub mod rate_limit;
pub mod store;
pub mod task;
pub mod types;

pub use error::{PreviewError, Result};
