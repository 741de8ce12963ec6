//! Content-addressed asset staging for berth
//!
//! This crate stages a local file-system artifact (a file or directory),
//! optionally after an external build transformation, into a
//! content-addressed `asset.<hash>` location inside an output directory:
//! - Deterministic cache keys over the observable request configuration
//! - Process-wide memoization with per-key single-flight
//! - Idempotent copy/move placement (an existing target is authoritative)
//! - A failure-safe transformation lifecycle that preserves partial output
//!   at an inspectable `-error` sibling
//!
//! # Overview
//!
//! The same logical artifact, referenced many times across a run, is
//! hashed, transformed, and copied at most once. A failed transformation
//! never populates the memo and never poisons a later run's cache: staged
//! paths on disk are self-describing (content-hash-named), so a restarted
//! process rediscovers prior work by path existence alone.
//!
//! # Hash strategies
//!
//! The hash of a staged asset is computed per [`HashStrategy`]: from the
//! raw source, from a caller-supplied seed, or from the transformation's
//! output. Strategy resolution happens before cache-key computation, since
//! the resolved strategy is itself part of the key.

mod error;

pub mod bundle;
pub mod canonical;
pub mod memo;
pub mod stage;
pub mod strategy;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use bundle::{
    INPUT_MOUNT, LocalTransform, MountBinding, OUTPUT_MOUNT, TransformConfig, TransformExecutor,
    TransformInvocation,
};
pub use memo::StagingMemo;
pub use stage::{
    FixedOutputDirectory, OutputDirectoryLocator, StagedAsset, Stager, StagingRequest,
};
pub use strategy::HashStrategy;
