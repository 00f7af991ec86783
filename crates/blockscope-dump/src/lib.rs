//! JSON dump exchange for blockscope trees.
//!
//! The dump format is a fixed-shape array `[1,2,{metadata},rootElement]`
//! shared with other disk-usage tools. The exporter streams it while a
//! scan runs; the importer replays a dump through the same sink interface
//! the scanner drives. Strings may carry raw non-UTF-8 bytes, which is
//! why both ends are hand-written rather than built on a JSON library.

mod export;
mod import;
mod reader;

pub use export::{JsonExporter, FORMAT_MAJOR, FORMAT_MINOR};
pub use import::{import_file, import_root, ImportError};
