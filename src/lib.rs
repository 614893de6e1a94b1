//! # odinpatch
//!
//! Neutralize the `SignerVer02` signing-verification block of a recovery
//! image and repackage the result for the Odin flashing tool.
//!
//! A run performs four steps, in order:
//!
//! 1. copy the source image to a backup,
//! 2. find the first `SignerVer02` marker and rewrite the 512-byte block
//!    starting there as the marker followed by zeros,
//! 3. write the patched bytes to a separate output image,
//! 4. pack that image as `recovery.img` into a ustar archive, rename it to
//!    `*.tar.md5` and write the archive's MD5 to a `*.tar.md5.txt` sidecar.
//!
//! Every precondition (source present, marker present, block within the
//! image) is checked before the patched image is written.
//!
//! ## Example
//!
//! ```no_run
//! let params = odinpatch::PatchParams::in_dir("firmware");
//! let report = odinpatch::run(&params).unwrap();
//! println!("MD5: {}", report.package.md5);
//! ```

pub mod package;
pub mod patch;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub use package::{
    create_package, extract_entry, list_entries, md5_file, md5_hex, print_package_info,
    verify_package, ArchiveEntry, PackageInfo, Verification, ODIN_ENTRY_NAME,
};
pub use patch::{patch_region, ImageBuffer, PatchOutcome, SIGNERVER2_MAGIC, SIGNERVER2_SIZE};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Source image read by a default run.
pub const DEFAULT_INPUT: &str = "recovery.img";

/// Untouched copy of the source image.
pub const DEFAULT_BACKUP: &str = "recovery.img.bak";

/// Patched image written before packaging.
pub const DEFAULT_OUTPUT: &str = "recovery_fixed.img";

/// Final Odin archive.
pub const DEFAULT_ARCHIVE: &str = "recovery_a.tar.md5";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OdinPatchError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("input not found: {0}")]
    InputNotFound(String),

    #[error("{marker} magic not found in image")]
    MarkerNotFound { marker: String },

    #[error(
        "image too small to contain full {marker} region at offset 0x{offset:x} \
         ({region_size} bytes needed, {len} byte image)"
    )]
    RegionOutOfBounds {
        marker: String,
        offset: usize,
        region_size: usize,
        len: usize,
    },

    #[error("invalid region: {region_size} byte region cannot hold a {marker_len} byte marker")]
    InvalidRegion { marker_len: usize, region_size: usize },

    #[error("{first} and {second} both resolve to {path}")]
    PathConflict {
        first: &'static str,
        second: &'static str,
        path: String,
    },

    #[error("invalid archive entry name: {0:?}")]
    InvalidEntryName(String),

    #[error("checksum mismatch: sidecar has {expected}, archive hashes to {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("bad archive: {0}")]
    BadArchive(String),
}

pub type Result<T> = std::result::Result<T, OdinPatchError>;

// ---------------------------------------------------------------------------
// Run parameters (builder)
// ---------------------------------------------------------------------------

/// Paths used by a patch run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchParams {
    pub input: PathBuf,
    pub backup: PathBuf,
    /// Patched image.
    pub output: PathBuf,
    /// Final archive name; `.md5` is appended when missing.
    pub archive: PathBuf,
    /// Name of the single archive entry.
    pub entry_name: String,
}

impl Default for PatchParams {
    fn default() -> Self {
        Self {
            input: PathBuf::from(DEFAULT_INPUT),
            backup: PathBuf::from(DEFAULT_BACKUP),
            output: PathBuf::from(DEFAULT_OUTPUT),
            archive: PathBuf::from(DEFAULT_ARCHIVE),
            entry_name: ODIN_ENTRY_NAME.to_string(),
        }
    }
}

impl PatchParams {
    pub fn builder() -> PatchParamsBuilder {
        PatchParamsBuilder::default()
    }

    /// Default file names, resolved inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            input: dir.join(DEFAULT_INPUT),
            backup: dir.join(DEFAULT_BACKUP),
            output: dir.join(DEFAULT_OUTPUT),
            archive: dir.join(DEFAULT_ARCHIVE),
            entry_name: ODIN_ENTRY_NAME.to_string(),
        }
    }

    /// Final `.tar.md5` path.
    pub fn archive_path(&self) -> PathBuf {
        package::final_archive_path(&self.archive)
    }

    /// Digest sidecar path.
    pub fn sidecar_path(&self) -> PathBuf {
        package::sidecar_path(&self.archive_path())
    }

    /// Check that no two artifacts refer to the same file and the entry name
    /// is usable. Paths are compared after resolving `..` and symlinks, and
    /// existing files are also compared by identity so hard links collide.
    pub fn validate(&self) -> Result<()> {
        package::check_entry_name(&self.entry_name)?;

        let roles: [(&'static str, PathBuf); 6] = [
            ("input", self.input.clone()),
            ("backup", self.backup.clone()),
            ("output", self.output.clone()),
            ("archive", self.archive_path()),
            ("staging archive", package::staging_archive_path(&self.archive)),
            ("sidecar", self.sidecar_path()),
        ];
        let resolved: Vec<PathBuf> = roles.iter().map(|(_, p)| resolve_path(p)).collect();

        for i in 0..roles.len() {
            for j in i + 1..roles.len() {
                if resolved[i] == resolved[j] || same_file(&roles[i].1, &roles[j].1) {
                    return Err(OdinPatchError::PathConflict {
                        first: roles[i].0,
                        second: roles[j].0,
                        path: resolved[i].display().to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Absolute form of `path` with `..` and symlinks resolved. A file that does
/// not exist yet is resolved through its parent directory; when even that
/// fails the path is returned unchanged.
fn resolve_path(path: &Path) -> PathBuf {
    if let Ok(p) = fs::canonicalize(path) {
        return p;
    }
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    match (path.file_name(), fs::canonicalize(parent)) {
        (Some(name), Ok(dir)) => dir.join(name),
        _ => path.to_path_buf(),
    }
}

#[cfg(unix)]
fn same_file(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (fs::metadata(a), fs::metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(_a: &Path, _b: &Path) -> bool {
    false
}

/// Builder for [`PatchParams`].
#[derive(Default)]
pub struct PatchParamsBuilder {
    params: PatchParams,
}

impl PatchParamsBuilder {
    pub fn input(mut self, path: impl Into<PathBuf>) -> Self {
        self.params.input = path.into();
        self
    }
    pub fn backup(mut self, path: impl Into<PathBuf>) -> Self {
        self.params.backup = path.into();
        self
    }
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.params.output = path.into();
        self
    }
    pub fn archive(mut self, path: impl Into<PathBuf>) -> Self {
        self.params.archive = path.into();
        self
    }
    pub fn entry_name(mut self, name: &str) -> Self {
        self.params.entry_name = name.to_string();
        self
    }
    pub fn build(self) -> PatchParams {
        self.params
    }
}

// ---------------------------------------------------------------------------
// Timestamp helper
// ---------------------------------------------------------------------------

/// Modification time of `path` in seconds since the epoch; recorded on the
/// archive entry. Times before the epoch read as 0.
pub fn file_mtime(path: impl AsRef<Path>) -> Result<u64> {
    let modified = fs::metadata(path.as_ref())?.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0))
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Environment variable holding a `tracing` filter directive.
pub const LOG_ENV_VAR: &str = "ODINPATCH_LOG";

/// Install a stderr `tracing` subscriber. A filter in [`LOG_ENV_VAR`] wins;
/// otherwise `verbose` picks the level (0 = warn, 1 = info, 2 = debug,
/// 3+ = trace).
pub fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    match EnvFilter::builder()
        .with_env_var(LOG_ENV_VAR)
        .try_from_env()
    {
        Ok(filter) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .init();
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// A completed step of [`run_with_progress`].
#[derive(Debug, Clone, Copy)]
pub enum Progress<'a> {
    BackupCreated { path: &'a Path },
    RegionPatched { outcome: &'a PatchOutcome },
    ImageWritten { path: &'a Path },
    Packaged { info: &'a PackageInfo },
}

/// Everything a successful run produced.
#[derive(Debug, Clone)]
pub struct PatchReport {
    pub backup: PathBuf,
    pub output: PathBuf,
    pub patch: PatchOutcome,
    pub package: PackageInfo,
}

/// Run the full backup → patch → write → package sequence without progress
/// reporting.
pub fn run(params: &PatchParams) -> Result<PatchReport> {
    run_with_progress(params, |_| {})
}

/// Same as [`run`], calling `on_progress` after each step completes.
///
/// Artifacts produced before a failing step stay on disk.
pub fn run_with_progress<F>(params: &PatchParams, mut on_progress: F) -> Result<PatchReport>
where
    F: FnMut(Progress<'_>),
{
    params.validate()?;

    if !params.input.is_file() {
        return Err(OdinPatchError::InputNotFound(
            params.input.display().to_string(),
        ));
    }

    fs::copy(&params.input, &params.backup)?;
    tracing::info!(backup = %params.backup.display(), "backup created");
    on_progress(Progress::BackupCreated {
        path: &params.backup,
    });

    let mut image = ImageBuffer::read(&params.input)?;
    tracing::debug!(len = image.len(), "image loaded");

    let outcome = image.patch_signer_region()?;
    if outcome.already_neutralized {
        tracing::warn!(
            offset = outcome.offset,
            "signer region was already neutralized"
        );
    }
    tracing::info!(
        offset = format_args!("0x{:08x}", outcome.offset),
        region_size = outcome.region_size,
        "signer region patched"
    );
    on_progress(Progress::RegionPatched { outcome: &outcome });

    image.write_to(&params.output)?;
    tracing::info!(output = %params.output.display(), "patched image written");
    on_progress(Progress::ImageWritten {
        path: &params.output,
    });

    let info = create_package(
        &params.output,
        &params.entry_name,
        &params.archive,
        file_mtime(&params.output)?,
    )?;
    on_progress(Progress::Packaged { info: &info });

    Ok(PatchReport {
        backup: params.backup.clone(),
        output: params.output.clone(),
        patch: outcome,
        package: info,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
