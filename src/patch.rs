//! Locating the `SignerVer02` marker and neutralizing the region behind it.
//!
//! This is a raw byte scan: the image's partition layout is never parsed.
//! Only the first occurrence of the marker is acted on, and the buffer is
//! left untouched whenever the patch cannot be applied in full.

use std::fmt;
use std::fs;
use std::path::Path;

use memchr::memmem;

use crate::{OdinPatchError, Result};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Marker opening the signer block embedded in the recovery image.
pub const SIGNERVER2_MAGIC: &[u8] = b"SignerVer02";

/// Size of the signer block in bytes, marker included.
pub const SIGNERVER2_SIZE: usize = 512;

// ---------------------------------------------------------------------------
// Slice-level operations
// ---------------------------------------------------------------------------

fn check_region(marker: &[u8], region_size: usize) -> Result<()> {
    if marker.is_empty() || region_size < marker.len() {
        return Err(OdinPatchError::InvalidRegion {
            marker_len: marker.len(),
            region_size,
        });
    }
    Ok(())
}

fn marker_name(marker: &[u8]) -> String {
    String::from_utf8_lossy(marker).into_owned()
}

/// Offset of the first occurrence of `marker` in `data`.
///
/// An empty marker never matches.
pub fn find_marker(data: &[u8], marker: &[u8]) -> Option<usize> {
    if marker.is_empty() {
        return None;
    }
    memmem::find(data, marker)
}

/// Number of non-overlapping occurrences of `marker` in `data`.
pub fn count_markers(data: &[u8], marker: &[u8]) -> usize {
    if marker.is_empty() {
        return 0;
    }
    memmem::find_iter(data, marker).count()
}

/// True when the region at `offset` already reads as the marker followed by
/// zero bytes.
pub fn is_neutralized(data: &[u8], offset: usize, marker: &[u8], region_size: usize) -> bool {
    let Some(end) = offset.checked_add(region_size) else {
        return false;
    };
    match data.get(offset..end) {
        Some(region) if region_size >= marker.len() => {
            region.starts_with(marker) && region[marker.len()..].iter().all(|&b| b == 0)
        }
        _ => false,
    }
}

/// Overwrite the `region_size` bytes starting at the first `marker` with the
/// marker followed by zero padding.
///
/// Returns the marker offset. On error `data` is not modified.
pub fn patch_region(data: &mut [u8], marker: &[u8], region_size: usize) -> Result<usize> {
    check_region(marker, region_size)?;

    let offset = find_marker(data, marker).ok_or_else(|| OdinPatchError::MarkerNotFound {
        marker: marker_name(marker),
    })?;

    let len = data.len();
    let end = offset
        .checked_add(region_size)
        .filter(|&end| end <= len)
        .ok_or_else(|| OdinPatchError::RegionOutOfBounds {
            marker: marker_name(marker),
            offset,
            region_size,
            len,
        })?;

    let region = &mut data[offset..end];
    region[..marker.len()].copy_from_slice(marker);
    region[marker.len()..].fill(0);

    Ok(offset)
}

// ---------------------------------------------------------------------------
// Image buffer
// ---------------------------------------------------------------------------

/// What a successful patch did to the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchOutcome {
    /// Offset of the marker that was acted on.
    pub offset: usize,
    /// Number of bytes rewritten, marker included.
    pub region_size: usize,
    /// The region was already marker + zeros before patching.
    pub already_neutralized: bool,
    /// Occurrences of the marker after the first one (left untouched).
    pub extra_occurrences: usize,
}

/// A recovery image held in memory for a single patch.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageBuffer {
    data: Vec<u8>,
    marker_offset: Option<usize>,
}

impl ImageBuffer {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            marker_offset: None,
        }
    }

    /// Load the whole image file.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_bytes(fs::read(path.as_ref())?))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    /// Offset of the marker located by the last successful patch.
    pub fn marker_offset(&self) -> Option<usize> {
        self.marker_offset
    }

    /// Neutralize the region behind `marker`.
    pub fn patch(&mut self, marker: &[u8], region_size: usize) -> Result<PatchOutcome> {
        check_region(marker, region_size)?;

        let already_neutralized = find_marker(&self.data, marker)
            .map(|off| is_neutralized(&self.data, off, marker, region_size))
            .unwrap_or(false);

        let offset = patch_region(&mut self.data, marker, region_size)?;
        self.marker_offset = Some(offset);

        let extra_occurrences = count_markers(&self.data[offset + marker.len()..], marker);
        if extra_occurrences > 0 {
            tracing::debug!(
                extra_occurrences,
                "additional {} occurrences left untouched",
                marker_name(marker)
            );
        }

        Ok(PatchOutcome {
            offset,
            region_size,
            already_neutralized,
            extra_occurrences,
        })
    }

    /// Neutralize the 512-byte `SignerVer02` block.
    pub fn patch_signer_region(&mut self) -> Result<PatchOutcome> {
        self.patch(SIGNERVER2_MAGIC, SIGNERVER2_SIZE)
    }

    /// Write the full buffer to `path`.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path.as_ref(), &self.data)?;
        Ok(())
    }
}

impl fmt::Debug for ImageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageBuffer")
            .field("len", &self.data.len())
            .field(
                "marker_offset",
                &self.marker_offset.map(|o| format!("0x{o:08x}")),
            )
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
