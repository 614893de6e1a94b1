//! Odin `.tar.md5` packaging.
//!
//! The flashing tool expects a plain ustar archive holding the image under
//! its canonical partition name. The archive is renamed to `*.tar.md5` and
//! its MD5 digest is written, as lowercase hex, to a `*.tar.md5.txt` sidecar.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use tar::{Archive, Builder, EntryType, Header};

use crate::{OdinPatchError, Result};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Entry name the flashing tool maps onto the recovery partition.
pub const ODIN_ENTRY_NAME: &str = "recovery.img";

/// Extension carried by a checksummed archive.
pub const MD5_EXTENSION: &str = "md5";

/// Extension appended to the archive name for the digest sidecar.
pub const SIDECAR_EXTENSION: &str = "txt";

/// Prefix of the scratch directory used to stage the archive entry.
pub const SCRATCH_DIR_PREFIX: &str = "temp_recovery_one_shot";

/// Permission bits recorded for the archive entry.
const ENTRY_MODE: u32 = 0o644;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The durable artifacts of a packaging run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    /// The renamed archive (`*.tar.md5`).
    pub archive: PathBuf,
    /// Plain-text file holding [`PackageInfo::md5`].
    pub sidecar: PathBuf,
    /// Lowercase hex MD5 of the archive bytes.
    pub md5: String,
    pub entry_name: String,
    pub archive_size: u64,
}

/// One member of a tar archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
    /// Modification time, seconds since epoch.
    pub mtime: u64,
    pub is_file: bool,
}

/// Result of re-checking a package on disk.
#[derive(Debug, Clone)]
pub struct Verification {
    /// Digest recomputed from the archive bytes.
    pub md5: String,
    /// Digest read from the sidecar, if one exists.
    pub sidecar_md5: Option<String>,
    pub entries: Vec<ArchiveEntry>,
}

// ---------------------------------------------------------------------------
// Digest helpers
// ---------------------------------------------------------------------------

/// Lowercase hex MD5 of an in-memory buffer.
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}

/// Lowercase hex MD5 of a file, streamed.
pub fn md5_file(path: impl AsRef<Path>) -> Result<String> {
    let mut reader = BufReader::new(File::open(path.as_ref())?);
    let mut hasher = Md5::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

fn with_suffix(path: &Path, ext: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// The plain tar path written before the digest is known: `x.tar.md5` →
/// `x.tar`. Names without the `.md5` extension are used as-is.
pub fn staging_archive_path(archive: &Path) -> PathBuf {
    match archive.extension() {
        Some(ext) if ext == MD5_EXTENSION => archive.with_extension(""),
        _ => archive.to_path_buf(),
    }
}

/// Final archive name for a requested output name: always ends in `.md5`.
pub fn final_archive_path(archive: &Path) -> PathBuf {
    with_suffix(&staging_archive_path(archive), MD5_EXTENSION)
}

/// `x.tar.md5` → `x.tar.md5.txt`.
pub fn sidecar_path(archive: &Path) -> PathBuf {
    with_suffix(archive, SIDECAR_EXTENSION)
}

/// Reject entry names the flashing tool could not map onto a partition.
pub fn check_entry_name(name: &str) -> Result<()> {
    let plain = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
        && name.len() <= 100;
    if plain {
        Ok(())
    } else {
        Err(OdinPatchError::InvalidEntryName(name.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Packaging
// ---------------------------------------------------------------------------

fn write_tar(staged: &Path, entry_name: &str, tar_path: &Path, mtime: u64) -> Result<u64> {
    let source = File::open(staged)?;
    let size = source.metadata()?.len();

    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mode(ENTRY_MODE);
    header.set_mtime(mtime);

    let mut builder = Builder::new(BufWriter::new(File::create(tar_path)?));
    builder.append_data(&mut header, entry_name, BufReader::new(source))?;
    let writer = builder.into_inner()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    Ok(fs::metadata(tar_path)?.len())
}

/// Package `image` as an Odin `.tar.md5` archive.
///
/// The image is staged under `entry_name` in a scratch directory next to the
/// archive; the scratch directory is removed whether or not packaging
/// succeeds. `archive` names the final file; a missing `.md5` extension is
/// added.
pub fn create_package(
    image: impl AsRef<Path>,
    entry_name: &str,
    archive: impl AsRef<Path>,
    mtime: u64,
) -> Result<PackageInfo> {
    let image = image.as_ref();
    let archive = archive.as_ref();
    check_entry_name(entry_name)?;

    let tar_path = staging_archive_path(archive);
    let final_path = final_archive_path(archive);
    let sidecar = sidecar_path(&final_path);

    let scratch = tempfile::Builder::new()
        .prefix(SCRATCH_DIR_PREFIX)
        .tempdir_in(parent_dir(&tar_path))?;
    tracing::debug!(scratch = %scratch.path().display(), "created scratch directory");

    let staged = scratch.path().join(entry_name);
    fs::copy(image, &staged)?;
    tracing::debug!(entry = entry_name, "staged archive entry");

    let archive_size = write_tar(&staged, entry_name, &tar_path, mtime)?;
    tracing::info!(tar = %tar_path.display(), archive_size, "archive written");

    let md5 = md5_file(&tar_path)?;
    tracing::info!(%md5, "checksum computed");

    fs::rename(&tar_path, &final_path)?;
    fs::write(&sidecar, &md5)?;

    let scratch_path = scratch.path().to_path_buf();
    if let Err(e) = scratch.close() {
        tracing::warn!(
            scratch = %scratch_path.display(),
            "could not remove scratch directory: {e}"
        );
    }

    Ok(PackageInfo {
        archive: final_path,
        sidecar,
        md5,
        entry_name: entry_name.to_string(),
        archive_size,
    })
}

// ---------------------------------------------------------------------------
// Listing / verification
// ---------------------------------------------------------------------------

fn open_archive(path: &Path) -> Result<Archive<BufReader<File>>> {
    if !path.is_file() {
        return Err(OdinPatchError::BadArchive(format!(
            "{}: no such archive",
            path.display()
        )));
    }
    Ok(Archive::new(BufReader::new(File::open(path)?)))
}

fn bad_archive(path: &Path, e: io::Error) -> OdinPatchError {
    OdinPatchError::BadArchive(format!("{}: {e}", path.display()))
}

fn describe(entry: &tar::Entry<'_, BufReader<File>>) -> io::Result<ArchiveEntry> {
    let header = entry.header();
    Ok(ArchiveEntry {
        name: entry.path()?.to_string_lossy().into_owned(),
        size: header.size()?,
        mtime: header.mtime()?,
        is_file: header.entry_type().is_file(),
    })
}

/// List the members of a tar archive in order.
pub fn list_entries(path: impl AsRef<Path>) -> Result<Vec<ArchiveEntry>> {
    let path = path.as_ref();
    let mut archive = open_archive(path)?;
    let mut entries = Vec::new();
    for entry in archive.entries().map_err(|e| bad_archive(path, e))? {
        let entry = entry.map_err(|e| bad_archive(path, e))?;
        entries.push(describe(&entry).map_err(|e| bad_archive(path, e))?);
    }
    Ok(entries)
}

/// Recompute the digest of `archive`, compare it against the sidecar when one
/// exists, and list the archive members.
pub fn verify_package(archive: impl AsRef<Path>) -> Result<Verification> {
    let archive = archive.as_ref();
    let entries = list_entries(archive)?;
    if entries.is_empty() {
        return Err(OdinPatchError::BadArchive(format!(
            "{}: archive has no entries",
            archive.display()
        )));
    }

    let md5 = md5_file(archive)?;

    let sidecar = sidecar_path(archive);
    let sidecar_md5 = if sidecar.is_file() {
        let expected = fs::read_to_string(&sidecar)?.trim().to_ascii_lowercase();
        if expected != md5 {
            return Err(OdinPatchError::ChecksumMismatch {
                expected,
                actual: md5,
            });
        }
        Some(expected)
    } else {
        tracing::warn!(sidecar = %sidecar.display(), "no checksum sidecar found");
        None
    };

    Ok(Verification {
        md5,
        sidecar_md5,
        entries,
    })
}

fn format_size(size: u64) -> String {
    if size >= 1024 * 1024 {
        format!(
            "{} Bytes = {:.2} MiB",
            size,
            size as f64 / (1024.0 * 1024.0)
        )
    } else if size >= 1024 {
        format!("{} Bytes = {:.2} KiB", size, size as f64 / 1024.0)
    } else {
        format!("{size} Bytes")
    }
}

/// Print a verified package to `stdout`.
pub fn print_package_info(archive: &Path, v: &Verification) {
    println!("Archive:      {}", archive.display());
    println!("MD5:          {}", v.md5);
    match &v.sidecar_md5 {
        Some(_) => println!("Sidecar:      OK"),
        None => println!("Sidecar:      (missing)"),
    }
    println!("Contents:");
    for (i, entry) in v.entries.iter().enumerate() {
        println!("   Entry {:>2}: {} ({})", i, entry.name, format_size(entry.size));
        if entry.mtime != 0 {
            match chrono::DateTime::from_timestamp(entry.mtime as i64, 0) {
                Some(dt) => println!("    Created:  {}", dt.format("%a %b %d %H:%M:%S %Y")),
                None => println!("    Created:  (invalid timestamp)"),
            }
        }
    }
}

/// Extract the member at `position` (starting at 0) into `outfile`.
pub fn extract_entry(
    archive: impl AsRef<Path>,
    position: usize,
    outfile: impl AsRef<Path>,
) -> Result<ArchiveEntry> {
    let archive = archive.as_ref();
    let mut reader = open_archive(archive)?;
    let mut count = 0;
    for entry in reader.entries().map_err(|e| bad_archive(archive, e))? {
        let mut entry = entry.map_err(|e| bad_archive(archive, e))?;
        if count == position {
            let info = describe(&entry).map_err(|e| bad_archive(archive, e))?;
            let mut out = BufWriter::new(File::create(outfile.as_ref())?);
            io::copy(&mut entry, &mut out)?;
            return Ok(info);
        }
        count += 1;
    }
    Err(OdinPatchError::BadArchive(format!(
        "{}: no entry at position {position} ({count} entries)",
        archive.display()
    )))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_image(dir: &Path, data: &[u8]) -> PathBuf {
        let path = dir.join("recovery_fixed.img");
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn md5_known_vectors() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn archive_naming() {
        let archive = Path::new("out/recovery_a.tar.md5");
        assert_eq!(staging_archive_path(archive), Path::new("out/recovery_a.tar"));
        assert_eq!(final_archive_path(archive), archive);
        assert_eq!(
            sidecar_path(archive),
            Path::new("out/recovery_a.tar.md5.txt")
        );
        assert_eq!(
            final_archive_path(Path::new("recovery_a.tar")),
            Path::new("recovery_a.tar.md5")
        );
    }

    #[test]
    fn entry_names_checked() {
        assert!(check_entry_name(ODIN_ENTRY_NAME).is_ok());
        assert!(check_entry_name("").is_err());
        assert!(check_entry_name("..").is_err());
        assert!(check_entry_name("a/recovery.img").is_err());
    }

    #[test]
    fn package_contains_single_entry_and_matching_sidecar() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..3000u32).map(|i| (i * 7) as u8).collect();
        let image = write_image(dir.path(), &data);
        let archive = dir.path().join("recovery_a.tar.md5");

        let info = create_package(&image, ODIN_ENTRY_NAME, &archive, 1_700_000_000).unwrap();
        assert_eq!(info.archive, archive);
        assert!(!dir.path().join("recovery_a.tar").exists());

        let sidecar = fs::read_to_string(&info.sidecar).unwrap();
        assert_eq!(sidecar.len(), 32);
        assert!(sidecar.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(sidecar, md5_hex(&fs::read(&archive).unwrap()));
        assert_eq!(info.archive_size, fs::metadata(&archive).unwrap().len());

        let entries = list_entries(&archive).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, ODIN_ENTRY_NAME);
        assert_eq!(entries[0].size, 3000);
        assert_eq!(entries[0].mtime, 1_700_000_000);
        assert!(entries[0].is_file);

        let out = dir.path().join("extracted.img");
        extract_entry(&archive, 0, &out).unwrap();
        assert_eq!(fs::read(&out).unwrap(), data);
    }

    #[test]
    fn scratch_directory_removed() {
        let dir = TempDir::new().unwrap();
        let image = write_image(dir.path(), b"payload");
        let archive = dir.path().join("recovery_a.tar.md5");
        create_package(&image, ODIN_ENTRY_NAME, &archive, 0).unwrap();

        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(SCRATCH_DIR_PREFIX))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn scratch_directory_removed_on_failure() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.img");
        let archive = dir.path().join("recovery_a.tar.md5");
        assert!(create_package(&missing, ODIN_ENTRY_NAME, &archive, 0).is_err());

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name())
            .collect();
        assert!(names.is_empty(), "unexpected files: {names:?}");
    }

    #[test]
    fn verify_detects_tampering() {
        let dir = TempDir::new().unwrap();
        let image = write_image(dir.path(), &[0x5A; 1024]);
        let archive = dir.path().join("recovery_a.tar.md5");
        let info = create_package(&image, ODIN_ENTRY_NAME, &archive, 0).unwrap();

        let ok = verify_package(&archive).unwrap();
        assert_eq!(ok.md5, info.md5);
        assert_eq!(ok.sidecar_md5.as_deref(), Some(info.md5.as_str()));

        fs::write(&info.sidecar, "00000000000000000000000000000000").unwrap();
        let err = verify_package(&archive).unwrap_err();
        assert!(matches!(err, OdinPatchError::ChecksumMismatch { .. }));
    }

    #[test]
    fn extract_out_of_range() {
        let dir = TempDir::new().unwrap();
        let image = write_image(dir.path(), b"abc");
        let archive = dir.path().join("recovery_a.tar.md5");
        create_package(&image, ODIN_ENTRY_NAME, &archive, 0).unwrap();

        let err = extract_entry(&archive, 1, dir.path().join("x")).unwrap_err();
        assert!(matches!(err, OdinPatchError::BadArchive(_)));
    }
}
