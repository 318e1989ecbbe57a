//! Native file watching for indexed roots.
//!
//! # Architecture
//!
//! ```text
//! WatchOrchestrator
//!   - pending roots (initial crawl running, joinable)
//!   - active roots (one handle per root, never nested)
//!   - event loop: notify -> ChangeEvent -> Crawler::refresh_path
//!         |
//!    WatchBackend
//!    +-----------+--------------+
//!    |                          |
//! RecursiveBackend     PerDirectoryBackend
//! ```

mod backend;
mod error;
mod event;
mod orchestrator;

pub use backend::{PerDirectoryBackend, RawEvent, RecursiveBackend, WatchBackend, create_backend};
pub use error::WatchError;
pub use event::ChangeEvent;
pub use orchestrator::{WatchHandle, WatchOrchestrator};
