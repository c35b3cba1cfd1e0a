//! Core data model: MIME structure, message flags, and plist metadata.

pub mod flags;
pub mod mime;
pub mod plist;
