//! CouchDB Changes Feed Client
//!
//! A Rust client for the `_changes` endpoint of CouchDB-compatible databases.
//! Continuous feeds are read in the background, split into lines, decoded
//! into [`ChangeEvent`]s and handed to your code in the order the server
//! sent them.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use couch_changes::{ChangeOptions, Client, Sequence};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder().base_url("http://localhost:5984").build()?;
//!     let db = client.database("inventory");
//!
//!     // Read everything that changed so far
//!     let changes = db.changes(&ChangeOptions::new()).await?;
//!     println!("caught up to {}", changes.last_seq);
//!
//!     // Follow new changes as they happen
//!     let options = ChangeOptions::new()
//!         .since(changes.last_seq)
//!         .heartbeat(Duration::from_secs(30))
//!         .include_docs(true);
//!     let session = db
//!         .continuous_changes(&options, |change| {
//!             println!("{} is now at {}", change.id, change.seq);
//!         })
//!         .await?;
//!
//!     tokio::time::sleep(Duration::from_secs(60)).await;
//!     session.shutdown().await;
//!
//!     Ok(())
//! }
//! ```

mod change;
mod client;
mod database;
mod error;
mod framer;
mod retry;
mod session;
mod stream;
mod types;

pub use change::{parse_line, ChangeEvent, Changes, Document};
pub use client::{Client, ClientBuilder};
pub use database::{ChangeOptions, Database};
pub use error::{CouchError, DecodeError, FeedError, InvalidHeaderError};
pub use framer::{LineFramer, Lines, DEFAULT_MAX_LINE_LENGTH};
pub use retry::{JitterMode, RetryConfig};
pub use session::{FeedEnd, FeedHandle, FeedSession, FeedState, FeedStats};
pub use stream::{ChangeStream, DEFAULT_CHANNEL_CAPACITY};
pub use types::{Revision, Sequence};
