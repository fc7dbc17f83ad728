#![forbid(unsafe_code)]

//! Failure taxonomy for the download pipeline. Route handlers translate
//! these into the JSON payloads the frontend expects; nothing is retried.

use std::io;
use std::process::ExitStatus;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The metadata collaborator could not resolve the source URL.
    #[error("metadata lookup failed: {0}")]
    MetadataFetch(String),

    /// No descriptor matched the requested quality.
    #[error("no {kind} format matching {wanted:?}")]
    FormatNotFound { kind: &'static str, wanted: String },

    /// A byte transfer from the remote source ended in an I/O error.
    #[error("{label} transfer failed")]
    Transfer {
        label: &'static str,
        #[source]
        source: io::Error,
    },

    /// The muxer binary could not be started at all.
    #[error("could not start the muxer: {0}")]
    MuxSpawn(#[source] io::Error),

    /// The muxer ran but reported a non-zero exit status.
    #[error("muxer exited with {status}")]
    MuxExit { status: ExitStatus },

    /// The finished file could not be handed to the client.
    #[error("delivery failed: {0}")]
    Delivery(String),
}

impl PipelineError {
    pub fn is_mux_failure(&self) -> bool {
        matches!(self, Self::MuxSpawn(_) | Self::MuxExit { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_not_found_names_kind_and_label() {
        let err = PipelineError::FormatNotFound {
            kind: "video",
            wanted: "4K".into(),
        };
        assert_eq!(err.to_string(), "no video format matching \"4K\"");
    }

    #[test]
    fn transfer_keeps_the_underlying_cause() {
        let err = PipelineError::Transfer {
            label: "audio",
            source: io::Error::other("connection reset"),
        };
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "connection reset");
    }

    #[test]
    fn mux_variants_are_grouped() {
        let spawn = PipelineError::MuxSpawn(io::Error::other("not found"));
        assert!(spawn.is_mux_failure());
        assert!(!PipelineError::MetadataFetch("x".into()).is_mux_failure());
    }
}
