//! Transformation lifecycle around an external execution backend
//!
//! The staging engine never runs build transformations itself; it owns the
//! lifecycle around an opaque executor: bundle directory creation,
//! resume-by-existence, identity and mount resolution, failure-artifact
//! preservation, and the empty-output check.
//!
//! Two executor shapes exist. A [`LocalTransform`] runs in-process and may
//! decline a request; a [`TransformExecutor`] is an isolated backend
//! (container runtime, sandbox) that always handles it. The orchestrator
//! tries the local variant first and falls back to the isolated one.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Mount point inside the execution environment where the source is bound.
pub const INPUT_MOUNT: &str = "/staging-input";

/// Mount point inside the execution environment where output is collected.
pub const OUTPUT_MOUNT: &str = "/staging-output";

/// Suffix appended to a bundle directory preserved after a failure.
const ERROR_SUFFIX: &str = "-error";

/// Declarative description of a build transformation.
///
/// Fully serializable: the config folds into cache keys and content
/// hashes, so every field participates in staging identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Execution environment image identifier.
    pub image: String,
    /// Command to run inside the environment.
    #[serde(default)]
    pub command: Vec<String>,
    /// Entrypoint override.
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    /// Environment variables visible to the transformation.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Working directory inside the environment; executors default to the
    /// input mount when unset.
    #[serde(default)]
    pub working_directory: Option<String>,
    /// Execution identity override (`uid:gid`).
    #[serde(default)]
    pub user: Option<String>,
    /// Extra host bindings in addition to the fixed input/output mounts.
    #[serde(default)]
    pub mounts: Vec<MountBinding>,
}

impl TransformConfig {
    /// Minimal configuration running `command` inside `image`.
    #[must_use]
    pub fn new<I, S>(image: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            image: image.into(),
            command: command.into_iter().map(Into::into).collect(),
            entrypoint: None,
            environment: BTreeMap::new(),
            working_directory: None,
            user: None,
            mounts: Vec::new(),
        }
    }
}

/// A host path bound into the execution environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountBinding {
    /// Host path to bind.
    pub host_path: PathBuf,
    /// Path inside the execution environment.
    pub container_path: String,
}

/// A fully resolved transformation invocation handed to executors.
#[derive(Debug)]
pub struct TransformInvocation<'a> {
    /// Logical asset name, for diagnostics.
    pub asset: &'a str,
    /// Source being transformed, bound at [`INPUT_MOUNT`].
    pub source_path: &'a Path,
    /// Bundle working directory, bound at [`OUTPUT_MOUNT`].
    pub bundle_dir: &'a Path,
    /// The declarative configuration.
    pub config: &'a TransformConfig,
    /// Resolved execution identity (`uid:gid`).
    pub user: String,
    /// All bindings: the two fixed mounts first, then extras.
    pub mounts: Vec<MountBinding>,
}

/// In-process transformation variant, tried before the isolated executor.
pub trait LocalTransform: Send + Sync {
    /// Attempt the transformation in-process. Returns whether it handled
    /// the request; `false` falls through to the isolated executor.
    fn try_run(&self, invocation: &TransformInvocation<'_>) -> Result<bool>;
}

impl<F> LocalTransform for F
where
    F: Fn(&TransformInvocation<'_>) -> Result<bool> + Send + Sync,
{
    fn try_run(&self, invocation: &TransformInvocation<'_>) -> Result<bool> {
        self(invocation)
    }
}

/// Isolated transformation executor. Always handles the request.
pub trait TransformExecutor: Send + Sync {
    /// Run the transformation, reading from [`INPUT_MOUNT`] and writing
    /// into [`OUTPUT_MOUNT`].
    fn run(&self, invocation: &TransformInvocation<'_>) -> Result<()>;
}

impl<F> TransformExecutor for F
where
    F: Fn(&TransformInvocation<'_>) -> Result<()> + Send + Sync,
{
    fn run(&self, invocation: &TransformInvocation<'_>) -> Result<()> {
        self(invocation)
    }
}

/// Run the configured transformation into `bundle_dir`.
///
/// Skips entirely when `bundle_dir` already exists (a prior run bundled
/// this request; placement resumes from it). On failure, or when the
/// transformation writes nothing, the directory is preserved at a
/// `-error` sibling and a [`Error::Transformation`] names both the asset
/// and that path.
pub(crate) fn run_transform(
    asset: &str,
    source_path: &Path,
    bundle_dir: &Path,
    config: &TransformConfig,
    local: Option<&dyn LocalTransform>,
    executor: &dyn TransformExecutor,
) -> Result<()> {
    if bundle_dir.exists() {
        tracing::debug!(
            asset,
            bundle_dir = %bundle_dir.display(),
            "Bundle directory already present, skipping transformation"
        );
        return Ok(());
    }

    fs::create_dir_all(bundle_dir).map_err(|e| Error::io(e, bundle_dir, "create_dir_all"))?;
    // The transformation may run as an arbitrary identity and must be able
    // to write into the bundle directory
    open_permissions(bundle_dir)?;

    let user = config
        .user
        .clone()
        .unwrap_or_else(default_execution_user);
    let mut mounts = vec![
        MountBinding {
            host_path: source_path.to_path_buf(),
            container_path: INPUT_MOUNT.to_string(),
        },
        MountBinding {
            host_path: bundle_dir.to_path_buf(),
            container_path: OUTPUT_MOUNT.to_string(),
        },
    ];
    mounts.extend(config.mounts.iter().cloned());

    let invocation = TransformInvocation {
        asset,
        source_path,
        bundle_dir,
        config,
        user,
        mounts,
    };

    tracing::info!(asset, image = %config.image, "Running transformation");
    if let Err(source) = execute(&invocation, local, executor) {
        let error_dir = preserve_error_artifact(bundle_dir)?;
        return Err(Error::transformation(asset, &error_dir, source.to_string()));
    }

    if berth_fingerprint::is_empty(bundle_dir)? {
        let error_dir = preserve_error_artifact(bundle_dir)?;
        return Err(Error::transformation(
            asset,
            &error_dir,
            "transformation produced no output",
        ));
    }

    Ok(())
}

fn execute(
    invocation: &TransformInvocation<'_>,
    local: Option<&dyn LocalTransform>,
    executor: &dyn TransformExecutor,
) -> Result<()> {
    if let Some(local) = local
        && local.try_run(invocation)?
    {
        tracing::debug!(asset = invocation.asset, "Transformation handled in-process");
        return Ok(());
    }
    executor.run(invocation)
}

/// Rename a failed bundle directory to its `-error` sibling, replacing any
/// stale artifact from a previous failure.
fn preserve_error_artifact(bundle_dir: &Path) -> Result<PathBuf> {
    let file_name = bundle_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bundle".to_string());
    let error_dir = bundle_dir.with_file_name(format!("{file_name}{ERROR_SUFFIX}"));

    if error_dir.exists() {
        fs::remove_dir_all(&error_dir).map_err(|e| Error::io(e, &error_dir, "remove_dir_all"))?;
    }
    fs::rename(bundle_dir, &error_dir).map_err(|e| Error::io(e, bundle_dir, "rename"))?;

    tracing::warn!(
        error_dir = %error_dir.display(),
        "Preserved failed transformation output"
    );
    Ok(error_dir)
}

#[cfg(unix)]
fn open_permissions(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o777))
        .map_err(|e| Error::io(e, dir, "set_permissions"))
}

#[cfg(not(unix))]
fn open_permissions(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn default_execution_user() -> String {
    // SAFETY: getuid/getgid always succeed
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    format!("{uid}:{gid}")
}

/// Fixed fallback identity on platforms without numeric user ids.
#[cfg(not(unix))]
fn default_execution_user() -> String {
    "1000:1000".to_string()
}
