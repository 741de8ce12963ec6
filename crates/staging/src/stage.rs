//! Staging orchestration: cache keys, hash computation, and idempotent
//! content-addressed placement
//!
//! A staging request either copies its source (no transformation) or
//! bundles it (transformation configured), then places the result at a
//! hash-named path inside the output directory. Placement is idempotent:
//! an existing target path is authoritative and is never rewritten, which
//! is what makes repeated runs over identical content cheap and makes the
//! hash-named scheme safe across independent processes sharing one output
//! tree.

use crate::bundle::{self, LocalTransform, TransformConfig, TransformExecutor};
use crate::canonical;
use crate::memo::StagingMemo;
use crate::strategy::HashStrategy;
use crate::{Error, Result};
use berth_fingerprint::{FilterSet, FingerprintOptions};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Prefix of every staged file or directory name inside the output tree.
const STAGED_PREFIX: &str = "asset";

/// Prefix of cache-key-named bundle working directories, used when the
/// final hash is not knowable before the transformation runs.
const BUNDLE_TEMP_PREFIX: &str = "bundling-temp-";

/// The outcome of a staging operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedAsset {
    /// Absolute path of the staged artifact.
    pub staged_path: PathBuf,
    /// Content hash identifying the artifact.
    pub asset_hash: String,
}

/// Locates the output directory a staging request targets.
///
/// Staging never walks a construct tree itself; whoever composes the
/// [`Stager`] injects this capability.
pub trait OutputDirectoryLocator: Send + Sync {
    /// Absolute output directory, or [`Error::Configuration`] when none is
    /// configured.
    fn locate(&self) -> Result<PathBuf>;
}

impl<F> OutputDirectoryLocator for F
where
    F: Fn() -> Result<PathBuf> + Send + Sync,
{
    fn locate(&self) -> Result<PathBuf> {
        self()
    }
}

/// Locator for a fixed, known output directory.
#[derive(Debug, Clone)]
pub struct FixedOutputDirectory(pub PathBuf);

impl OutputDirectoryLocator for FixedOutputDirectory {
    fn locate(&self) -> Result<PathBuf> {
        Ok(self.0.clone())
    }
}

/// The immutable input of a staging operation.
#[derive(Debug, Clone)]
pub struct StagingRequest {
    /// Logical asset name, used in diagnostics.
    pub asset_name: String,
    /// File or directory to stage.
    pub source_path: PathBuf,
    /// Explicit hash strategy hint.
    pub strategy: Option<HashStrategy>,
    /// Caller-supplied fingerprint seed (implies the `custom` strategy).
    pub custom_seed: Option<String>,
    /// Extra salt folded into source fingerprints.
    pub extra_hash: Option<String>,
    /// Include/exclude filters shared by fingerprinting and copying.
    pub filters: FilterSet,
    /// Optional build transformation; selects the bundle path.
    pub transform: Option<TransformConfig>,
    /// Pretend to stage: report the source path and its hash unchanged.
    pub skip: bool,
}

impl StagingRequest {
    /// A plain staging request with default hints.
    #[must_use]
    pub fn new(asset_name: impl Into<String>, source_path: impl Into<PathBuf>) -> Self {
        Self {
            asset_name: asset_name.into(),
            source_path: source_path.into(),
            strategy: None,
            custom_seed: None,
            extra_hash: None,
            filters: FilterSet::all(),
            transform: None,
            skip: false,
        }
    }
}

/// Observable configuration from which the cache key is derived.
///
/// The key captures the inputs to the hashing decision, never hash
/// results; that is what lets the memo short-circuit filesystem and
/// transformation work.
#[derive(Serialize)]
struct CacheKeyEnvelope<'a> {
    output_dir: String,
    source_path: String,
    transform: Option<&'a TransformConfig>,
    strategy: HashStrategy,
    custom_seed: Option<&'a str>,
    extra_hash: Option<&'a str>,
    filters: &'a FilterSet,
    skip: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Copy,
    Move,
}

/// Stages assets into content-addressed locations inside an output
/// directory, memoizing results per cache key.
pub struct Stager {
    memo: Arc<StagingMemo>,
    locator: Box<dyn OutputDirectoryLocator>,
    executor: Option<Arc<dyn TransformExecutor>>,
    local: Option<Arc<dyn LocalTransform>>,
}

impl Stager {
    /// Create a stager over an injected memo and output-directory locator.
    pub fn new(memo: Arc<StagingMemo>, locator: impl OutputDirectoryLocator + 'static) -> Self {
        Self {
            memo,
            locator: Box::new(locator),
            executor: None,
            local: None,
        }
    }

    /// Attach the isolated transformation executor.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn TransformExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Attach an in-process transformation variant, tried before the
    /// isolated executor.
    #[must_use]
    pub fn with_local_transform(mut self, local: Arc<dyn LocalTransform>) -> Self {
        self.local = Some(local);
        self
    }

    /// Stage an asset, reusing any memoized result for an identical
    /// request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for invalid strategy/seed
    /// combinations, a missing source, or a missing output directory;
    /// [`Error::Transformation`] when a configured build step fails or
    /// produces nothing; and I/O errors from placement.
    pub fn stage(&self, request: &StagingRequest) -> Result<StagedAsset> {
        let strategy = HashStrategy::resolve(request.strategy, request.custom_seed.is_some())?;
        if !strategy.known_before_transform() && request.transform.is_none() {
            return Err(Error::configuration(format!(
                "hash strategy '{strategy}' requires a transformation for asset '{}'",
                request.asset_name
            )));
        }

        let source = absolute_source(&request.source_path)?;
        if !source.exists() {
            return Err(Error::configuration(format!(
                "cannot find source {} for asset '{}'",
                source.display(),
                request.asset_name
            )));
        }

        let out_dir = self.locator.locate()?;
        let key = cache_key_for(request, &out_dir, &source, strategy)?;

        let span = tracing::debug_span!("stage_asset", asset = %request.asset_name, key = %key);
        let _guard = span.enter();

        self.memo.obtain(&key, || {
            if let Some(transform) = &request.transform {
                self.stage_by_transforming(request, &source, &out_dir, strategy, transform, &key)
            } else {
                self.stage_by_copying(request, &source, &out_dir, strategy)
            }
        })
    }

    /// The staged path relative to `base`, when the asset actually landed
    /// inside the output tree; paths outside it (e.g. skipped staging) are
    /// returned absolute and unchanged.
    ///
    /// # Errors
    ///
    /// Fails only when the output directory cannot be located.
    pub fn relative_staged_path(&self, staged: &StagedAsset, base: &Path) -> Result<PathBuf> {
        let out_dir = self.locator.locate()?;
        if !staged.staged_path.starts_with(&out_dir) {
            return Ok(staged.staged_path.clone());
        }
        Ok(relative_to(&staged.staged_path, base))
    }

    fn stage_by_copying(
        &self,
        request: &StagingRequest,
        source: &Path,
        out_dir: &Path,
        strategy: HashStrategy,
    ) -> Result<StagedAsset> {
        if request.skip {
            // Staging disabled by policy: report the raw source fingerprint
            // regardless of other hints, so downstream consumers still get
            // a deterministic hash
            let asset_hash = self.source_fingerprint(request, source)?;
            return Ok(StagedAsset {
                staged_path: source.to_path_buf(),
                asset_hash,
            });
        }

        let asset_hash = self.calculate_hash(request, source, strategy, None, None)?;
        let extension = source
            .is_file()
            .then(|| source.extension().and_then(|e| e.to_str()))
            .flatten();
        let staged_path = out_dir.join(render_asset_filename(&asset_hash, extension));
        self.place(source, &staged_path, Placement::Copy, &request.filters)?;
        Ok(StagedAsset {
            staged_path,
            asset_hash,
        })
    }

    fn stage_by_transforming(
        &self,
        request: &StagingRequest,
        source: &Path,
        out_dir: &Path,
        strategy: HashStrategy,
        transform: &TransformConfig,
        key: &str,
    ) -> Result<StagedAsset> {
        if request.skip {
            // Fail open: no transformation runs and no directory is
            // created; the hash is computed as if the source strategy
            // applied to the unmodified source
            let asset_hash = self.source_fingerprint(request, source)?;
            return Ok(StagedAsset {
                staged_path: source.to_path_buf(),
                asset_hash,
            });
        }

        // Source/custom hashes don't depend on transformation output, so
        // the bundle directory can be named deterministically from the
        // final hash; otherwise it is named from the cache key so repeated
        // runs for the same request still converge on one directory
        let pre_hash = if strategy.known_before_transform() {
            Some(self.calculate_hash(request, source, strategy, Some(transform), None)?)
        } else {
            None
        };
        let bundle_dir = match &pre_hash {
            Some(hash) => out_dir.join(render_asset_filename(hash, None)),
            None => out_dir.join(format!("{BUNDLE_TEMP_PREFIX}{key}")),
        };

        bundle::run_transform(
            &request.asset_name,
            source,
            &bundle_dir,
            transform,
            self.local.as_deref(),
            self.executor()?,
        )?;

        let asset_hash = match pre_hash {
            Some(hash) => hash,
            None => self.calculate_hash(request, source, strategy, Some(transform), Some(&bundle_dir))?,
        };
        let staged_path = out_dir.join(render_asset_filename(&asset_hash, None));
        self.place(&bundle_dir, &staged_path, Placement::Move, &request.filters)?;
        Ok(StagedAsset {
            staged_path,
            asset_hash,
        })
    }

    /// Compute the asset hash for the resolved strategy.
    ///
    /// `custom`, and `source` with a transformation attached, digest the
    /// seed and then fold in the canonical transformation config;
    /// `bundle`/`output` hash the produced output directly. The asymmetry
    /// keeps historical source-strategy hashes stable for untransformed
    /// assets while still capturing transformation identity when one is
    /// attached.
    fn calculate_hash(
        &self,
        request: &StagingRequest,
        source: &Path,
        strategy: HashStrategy,
        transform: Option<&TransformConfig>,
        output_dir: Option<&Path>,
    ) -> Result<String> {
        match strategy {
            HashStrategy::Custom => self.seeded_hash(request, source, transform),
            HashStrategy::Source if transform.is_some() => {
                self.seeded_hash(request, source, transform)
            }
            HashStrategy::Source => self.source_fingerprint(request, source),
            HashStrategy::Bundle | HashStrategy::Output => {
                let dir = output_dir.ok_or_else(|| {
                    Error::configuration(format!(
                        "hash strategy '{strategy}' requires a transformation output directory"
                    ))
                })?;
                Ok(berth_fingerprint::fingerprint(
                    dir,
                    &self.fingerprint_options(request),
                )?)
            }
        }
    }

    fn seeded_hash(
        &self,
        request: &StagingRequest,
        source: &Path,
        transform: Option<&TransformConfig>,
    ) -> Result<String> {
        let seed = match &request.custom_seed {
            Some(seed) => seed.clone(),
            None => self.source_fingerprint(request, source)?,
        };
        let mut hasher = Sha256::new();
        hasher.update(seed.as_bytes());
        if let Some(config) = transform {
            let value = serde_json::to_value(config).map_err(|e| {
                Error::serialization(format!("Failed to encode transformation config: {e}"))
            })?;
            let bytes = serde_json::to_vec(&canonical::canonicalize(&value)).map_err(|e| {
                Error::serialization(format!("Failed to encode transformation config: {e}"))
            })?;
            hasher.update(&bytes);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    fn source_fingerprint(&self, request: &StagingRequest, source: &Path) -> Result<String> {
        Ok(berth_fingerprint::fingerprint(
            source,
            &self.fingerprint_options(request),
        )?)
    }

    fn fingerprint_options(&self, request: &StagingRequest) -> FingerprintOptions {
        FingerprintOptions {
            extra_hash: request.extra_hash.clone(),
            filters: request.filters.clone(),
        }
    }

    fn executor(&self) -> Result<&dyn TransformExecutor> {
        self.executor
            .as_deref()
            .ok_or_else(|| Error::configuration("no transformation executor configured"))
    }

    /// Idempotent placement: an existing target is authoritative.
    fn place(
        &self,
        source: &Path,
        target: &Path,
        style: Placement,
        filters: &FilterSet,
    ) -> Result<()> {
        if target.exists() {
            tracing::debug!(target = %target.display(), "Target already staged");
            // A pre-hashed bundle directory IS the target; only a distinct
            // just-produced source is redundant
            if style == Placement::Move && source != target {
                remove_entry(source)?;
            }
            return Ok(());
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
        }

        match style {
            Placement::Move => {
                fs::rename(source, target).map_err(|e| Error::io(e, target, "rename"))?;
            }
            Placement::Copy => {
                let meta = fs::metadata(source).map_err(|e| Error::io(e, source, "metadata"))?;
                if meta.is_file() {
                    fs::copy(source, target).map_err(|e| Error::io(e, target, "copy"))?;
                } else if meta.is_dir() {
                    berth_fingerprint::copy_directory(source, target, filters)?;
                } else {
                    return Err(Error::unsupported_source(source));
                }
            }
        }

        tracing::debug!(
            source = %source.display(),
            target = %target.display(),
            "Staged asset"
        );
        Ok(())
    }
}

fn cache_key_for(
    request: &StagingRequest,
    out_dir: &Path,
    source: &Path,
    strategy: HashStrategy,
) -> Result<String> {
    let envelope = CacheKeyEnvelope {
        output_dir: out_dir.to_string_lossy().into_owned(),
        source_path: source.to_string_lossy().into_owned(),
        transform: request.transform.as_ref(),
        strategy,
        custom_seed: request.custom_seed.as_deref(),
        extra_hash: request.extra_hash.as_deref(),
        filters: &request.filters,
        skip: request.skip,
    };
    let value = serde_json::to_value(&envelope)
        .map_err(|e| Error::serialization(format!("Failed to encode cache-key envelope: {e}")))?;
    canonical::cache_key(&value)
}

/// Resolve symlinks when possible; fall back to an absolute join.
fn absolute_source(path: &Path) -> Result<PathBuf> {
    match fs::canonicalize(path) {
        Ok(canonical) => Ok(canonical),
        Err(_) if path.is_absolute() => Ok(path.to_path_buf()),
        Err(_) => {
            let cwd = std::env::current_dir().map_err(|e| Error::io_no_path(e, "current_dir"))?;
            Ok(cwd.join(path))
        }
    }
}

fn render_asset_filename(hash: &str, extension: Option<&str>) -> String {
    match extension {
        Some(ext) if !ext.is_empty() => format!("{STAGED_PREFIX}.{hash}.{ext}"),
        _ => format!("{STAGED_PREFIX}.{hash}"),
    }
}

fn remove_entry(path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path).map_err(|e| Error::io(e, path, "metadata"))?;
    if meta.is_dir() {
        fs::remove_dir_all(path).map_err(|e| Error::io(e, path, "remove_dir_all"))?;
    } else {
        fs::remove_file(path).map_err(|e| Error::io(e, path, "remove_file"))?;
    }
    Ok(())
}

/// Relative path from `base` to `path`, walking up with `..` as needed.
fn relative_to(path: &Path, base: &Path) -> PathBuf {
    let path_comps: Vec<Component<'_>> = path.components().collect();
    let base_comps: Vec<Component<'_>> = base.components().collect();
    let common = path_comps
        .iter()
        .zip(base_comps.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..base_comps.len() {
        out.push("..");
    }
    for comp in &path_comps[common..] {
        out.push(comp.as_os_str());
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}
