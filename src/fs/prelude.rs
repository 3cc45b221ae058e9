//! Shared imports for the `fs` sub-modules.
//!
//! Each operation file (`attr.rs`, `read.rs`, …) starts with
//! `use super::prelude::*;` instead of repeating the same dozen imports.

pub use std::ffi::OsStr;

pub use fuser::{
    FileAttr, FileType, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyWrite, TimeOrNow,
};
pub use libc::{EINVAL, EIO, ENOENT, c_int};
pub use log::{debug, info, warn};

pub use crate::cache::meta::AttrEntry;
pub use crate::sftp::{RemoteAttr, errno};

pub use super::{ROOT_INO, SftpFs, Shared, TTL, child_rel, parent_of, transfer};
