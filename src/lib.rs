#![forbid(unsafe_code)]

//! Library crate behind the gvarchive binary: parsing, downloading and
//! persisting legacy video-metadata records.

pub mod assist;
pub mod config;
pub mod fetch;
pub mod metadata;
pub mod probe;
pub mod process;
pub mod security;
pub mod tokenizer;
