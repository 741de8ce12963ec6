//! Error types for the staging crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for staging operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during staging operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(berth::staging::io),
        help("Check file permissions and ensure the path exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "copy", "rename", "create_dir_all")
        operation: String,
    },

    /// Invalid staging configuration
    #[error("Staging configuration error: {message}")]
    #[diagnostic(code(berth::staging::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// A transformation failed or produced no output
    #[error("Failed to transform asset '{asset}': {message} (partial output preserved at {})", error_dir.display())]
    #[diagnostic(
        code(berth::staging::transform),
        help("Inspect the preserved '-error' directory to debug the failing build step")
    )]
    Transformation {
        /// Logical asset name
        asset: String,
        /// Where the partially populated bundle directory was preserved
        error_dir: Box<Path>,
        /// What went wrong
        message: String,
    },

    /// Source entry kind that cannot be staged
    #[error("Unsupported source entry kind: {}", path.display())]
    #[diagnostic(
        code(berth::staging::unsupported_source),
        help("Only regular files and directories can be staged")
    )]
    UnsupportedSource {
        /// The offending path
        path: Box<Path>,
    },

    /// Serialization error while deriving cache keys or hashes
    #[error("Serialization error: {message}")]
    #[diagnostic(code(berth::staging::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// Fingerprinting failure from the content-hash collaborator
    #[error(transparent)]
    #[diagnostic(code(berth::staging::fingerprint))]
    Fingerprint(#[from] berth_fingerprint::Error),
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a transformation error naming the preserved error artifact
    #[must_use]
    pub fn transformation(
        asset: impl Into<String>,
        error_dir: impl AsRef<Path>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Transformation {
            asset: asset.into(),
            error_dir: error_dir.as_ref().into(),
            message: msg.into(),
        }
    }

    /// Create an unsupported-source error
    #[must_use]
    pub fn unsupported_source(path: impl AsRef<Path>) -> Self {
        Self::UnsupportedSource {
            path: path.as_ref().into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }
}

/// Result type for staging operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_display_includes_path_and_operation() {
        let err = Error::io(
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
            "/tmp/missing",
            "rename",
        );
        let rendered = err.to_string();
        assert!(rendered.contains("rename"));
        assert!(rendered.contains("/tmp/missing"));
    }

    #[test]
    fn transformation_error_names_asset_and_artifact() {
        let err = Error::transformation("web-bundle", "/out/asset.abc-error", "exit status 1");
        let rendered = err.to_string();
        assert!(rendered.contains("web-bundle"));
        assert!(rendered.contains("/out/asset.abc-error"));
        assert!(rendered.contains("exit status 1"));
    }

    #[test]
    fn fingerprint_errors_convert() {
        let source = berth_fingerprint::Error::InvalidPattern {
            pattern: "a{b".to_string(),
            reason: "unclosed alternate group".to_string(),
        };
        let err: Error = source.into();
        assert!(matches!(err, Error::Fingerprint(_)));
    }
}
