//! Library for building Entwine Point Tile ([EPT](https://entwine.io/))
//! datasets from collections of LiDAR point cloud files.
//!
//! Inputs are scanned for their schema, bounds, and SRS, then streamed
//! point by point into an out-of-core octree: each point lands in exactly
//! one voxel of one chunk, saturated chunks overflow into children, and a
//! bounded working set of chunks is kept in memory while the rest live in
//! the output store.
//!
//! Usage example:
//! ```no_run
//! use ept_rs::{builder::Threads, config};
//!
//! fn main() -> ept_rs::Result<()> {
//!     let cfg = config::Config {
//!         input: vec!["autzen.laz".to_string()],
//!         output: "./autzen-ept".to_string(),
//!         ..Default::default()
//!     };
//!     let mut builder = config::resolve(&cfg)?;
//!     let inserted = builder.run(Threads::split(cfg.threads()), 0, 10)?;
//!     println!("inserted {inserted} points");
//!     Ok(())
//! }
//! ```

pub mod bounds;
pub mod builder;
pub mod cache;
pub mod chunk;
pub mod codec;
pub mod config;
pub mod endpoint;
mod error;
pub mod hierarchy;
pub mod io;
pub mod key;
pub mod manifest;
pub mod merge;
pub mod metadata;
pub mod pipeline;
pub mod pool;
pub mod scan;
pub mod schema;
pub mod srs;
pub mod voxel;

pub use error::{Error, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Voxel grid resolution per chunk unless configured otherwise.
pub const SPAN_DEFAULT: u64 = 128;
