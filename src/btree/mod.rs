//! Ordered B-tree storage over pages (spec §4.2), plus the directory that
//! maps tree names to their root pages (spec §3 "Tree").

mod cursor;
mod directory;
mod options;
mod tree;

pub use cursor::{Cursor, DepthMode, Direction};
pub use directory::{Directory, TreeMeta};
pub use options::BTreeOptions;
pub use tree::Tree;
