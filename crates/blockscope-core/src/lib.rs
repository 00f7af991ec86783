//! Core types for blockscope.
//!
//! This crate owns the in-memory tree model with its hard-link
//! accounting, the sink interface shared by the scanner and the dump
//! importer, scan configuration, and the byte-level glob matcher.

mod builder;
mod config;
mod devices;
mod entry;
mod error;
pub mod pattern;
mod sink;
mod tree;
pub mod util;

pub use builder::TreeBuilder;
pub use config::{ScanConfig, ScanConfigBuilder};
pub use devices::{DeviceId, DeviceTable, LinkCountBuffer};
pub use entry::{DirNode, Entry, EntryId, EntryKind, Ext, FileNode, LinkNode};
pub use error::ScanError;
pub use sink::{Sink, Special, Stat};
pub use tree::{Children, Tree};
