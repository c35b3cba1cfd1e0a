//! Container parsing: payload extraction, plist epilogue, boundary repair, MIME tokenizing.

pub mod container;
pub mod header;
pub mod mime;
pub mod plist;
pub mod repair;
