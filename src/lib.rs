#![forbid(unsafe_code)]

//! Shared building blocks for the tubefetch backend: configuration loading,
//! the stream extraction seam, the download/mux pipeline, and the ffmpeg
//! wrapper. The HTTP routes live in `src/bin/backend.rs`.

pub mod config;
pub mod error;
pub mod extractor;
pub mod mux;
pub mod pipeline;
pub mod security;
