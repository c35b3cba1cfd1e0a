//! EML output: attachment re-inlining, transfer encoders, serializer.

pub mod attachment;
pub mod encode;
pub mod eml;
