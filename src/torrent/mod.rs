//! Torrent metainfo handling
//!
//! Parsing of .torrent files and the immutable descriptor built from them.

pub mod info;
pub mod parser;

pub use info::{FileEntry, Metainfo, BLOCK_SIZE};
pub use parser::parse_bytes;
pub use parser::parse_file;
