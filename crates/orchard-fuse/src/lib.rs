//! FUSE surface for Orchard.
//!
//! Translates kernel VFS operations into state-store queries and action
//! enqueues. Two contracts shape everything here:
//!
//! - `open` never blocks on a download; `read` is the single blocking path,
//!   and only when content is missing.
//! - Reads from denylisted thumbnailer processes are suppressed outright —
//!   no download, no cache mutation.
//!
//! FUSE callbacks run on kernel-provided threads; store access happens via
//! `Handle::block_on` against the daemon's runtime.

mod denylist;
mod filesystem;
mod inode;
pub mod xattr;

pub use denylist::ThumbnailerDenylist;
pub use filesystem::{FuseSettings, OrchardFs};
pub use inode::InodeTable;
