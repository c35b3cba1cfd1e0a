//! `emlxconv` converts Apple Mail `.emlx` / `.partial.emlx` containers to
//! standalone `.eml` files.
//!
//! The pipeline is streaming: the container payload is read line by line,
//! its MIME framing repaired, tokenized, externalized attachments spliced
//! back in, and the result serialized with CRLF line endings.

pub mod config;
pub mod error;
pub mod export;
pub mod model;
pub mod parser;

pub use error::{ConvertError, Result};
pub use export::eml::{
    convert_file, convert_file_to_path, convert_reader, eml_file_name, ConversionReport,
    ConvertOptions,
};
