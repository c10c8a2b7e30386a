//! `preview-provider`: adapters for the remote container platform that hosts
//! Metro bundlers.
//!
//! ```text
//! ContainerClient (trait)
//!     ├── HttpContainerClient    REST platform, bearer auth, per-call timeouts
//!     └── MemoryContainerClient  in-process, scriptable failures
//! ```
//!
//! Create calls return a [`CreateOutcome`] instead of a `Result` because a
//! create whose response was lost may still have produced a container; the
//! lifecycle layer records those as reconciliation candidates.

pub mod client;
pub mod error;
pub mod http;
pub mod memory;
pub mod types;

pub use client::ContainerClient;
pub use error::ProviderError;
pub use http::{HttpContainerClient, HttpTimeouts};
pub use memory::MemoryContainerClient;
pub use types::{
    ContainerSpec, CreateOutcome, LogLine, LogPage, LogQuery, ProviderContainer, StartReport,
    StatusReport, TASK_LABEL, USER_LABEL,
};
