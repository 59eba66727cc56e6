//! A crate uploading large package files to a remote asset service, block by block.
//!
//! A generic, robust and efficient crate providing features dedicated to:
//! - splitting a local file into fixed-size blocks and fingerprinting them,
//! - uploading blocks concurrently with bounded parallelism, per-attempt timeouts and retries,
//! - uploading only the blocks that changed since the previously committed version of an asset (_delta_ mode),
//! - resuming interrupted uploads, and reporting progress along the way.
//!
//! An upload session is driven by an [`Uploader`] through a small state machine:
//!
//! ```text
//!     SelectMode --(full, or no baseline)--> FullUpload --+
//!         |                                               +--> Commit --> Done
//!         +--(delta with baseline)--------> DeltaUpload --+
//!
//!     (any state) --> Failed | Cancelled
//! ```
//!
//! As a **strong hypothesis**, we can assume that asset initialization is **idempotent** on the remote side: initializing
//! an asset again returns the blocks it has not received yet. Resuming an interrupted upload is therefore nothing more than
//! running a new session for the same asset and file, so a session is never retried as a whole.
//!
//! The remote side is abstracted behind the [`UploadService`] trait, for which an HTTP implementation is provided in the
//! [`http`] module. Sessions are cancelled cooperatively through a [`CancellationToken`]: cancellation is observed before
//! each block and during retries, in-flight requests are dropped, and blocks already received remain on the remote side.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use uploader::http::HttpUploadService;
//! use uploader::{CancellationToken, Outcome, UploadConfig, Uploader};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let service = Arc::new(HttpUploadService::new("https://ingestion.example.com/api/")?);
//! let config = UploadConfig::default().with_delta_upload(true);
//!
//! let uploader = Uploader::new(service, config, "my-game-1.0.2", "packages/my-game.pkg");
//! let progress = uploader.progress();
//!
//! match uploader.run(CancellationToken::new()).await? {
//!     Outcome::Completed(snapshot) => println!("Uploaded {snapshot}"),
//!     Outcome::Cancelled(_) => println!("Cancelled at {}", progress.snapshot()),
//! }
//! # Ok(())
//! # }
//! ```

pub mod block;
pub mod config;
mod error;
pub mod http;
pub mod progress;
pub mod service;
mod session;
pub mod transfer;

#[cfg(test)]
mod testing;

pub use config::UploadConfig;
pub use error::Error;
pub use service::{TransportError, UploadProgress, UploadService};
pub use session::{Outcome, SessionError, UploadMode, Uploader};
pub use tokio_util::sync::CancellationToken;
