//! Wire formats exchanged with the remote helper program
//!
//! The helper bridges a relational store and two binary export files. Both
//! formats are packed with no padding and use little-endian, fixed-width
//! fields so they decode identically on every platform.
//!
//! # Structure export
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ parent_id: u32 │ child_id: u32               │
//! │ name_len:  u32 │ unit_len: u32               │  16-byte header
//! ├──────────────────────────────────────────────┤
//! │ name: name_len bytes │ unit: unit_len bytes  │
//! └──────────────────────────────────────────────┘
//!            ... repeated until end of buffer
//! ```
//!
//! # Values export
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ batch_count: u64 │ start_date: i64           │
//! ├──────────────────────────────────────────────┤
//! │ element_count: u64 │ element_count × f64     │  × batch_count
//! └──────────────────────────────────────────────┘
//! ```
//!
//! A missing sample is encoded as NaN. The start date is shared by every
//! series in a batch; series that start on different dates cannot be
//! represented.
//!
//! # Example
//!
//! ```
//! use skyrun_core_wire::{decode_structure, encode_structure, StructureEntry};
//!
//! let entries = vec![StructureEntry::new(0, 1, "Hydrology", "")];
//! let bytes = encode_structure(&entries);
//! assert_eq!(decode_structure(&bytes).unwrap(), entries);
//! ```

pub mod args;
pub mod error;
pub mod series;
pub mod structure;

pub use args::encode_request_args;
pub use error::{Error, Result};
pub use series::{decode_series_batch, encode_series_batch, Series, SeriesBatch};
pub use structure::{decode_structure, encode_structure, StructureEntry};

/// Size of one structure record header in bytes
pub const STRUCTURE_HEADER_LEN: usize = 16;

/// Size of the values export header in bytes
pub const SERIES_HEADER_LEN: usize = 16;
