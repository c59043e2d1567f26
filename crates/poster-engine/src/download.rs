use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};

pub const CHUNK_SIZE: usize = 8 * 1024;

/// Streams `reader` into `destination` in [`CHUNK_SIZE`] chunks.
///
/// Bytes land in a hidden temp file next to the destination and are renamed
/// into place only after the whole body arrived and, when the server declared
/// one, its length matched. On any error the destination is left untouched.
pub fn write_atomically<R: Read>(
    mut reader: R,
    destination: &Path,
    expected_len: Option<u64>,
) -> Result<u64> {
    let parent = destination
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let mut temp = tempfile::Builder::new()
        .prefix(".artifact-")
        .suffix(".part")
        .tempfile_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;

    let mut buffer = [0u8; CHUNK_SIZE];
    let mut written: u64 = 0;
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(err).context(format!(
                    "transfer aborted after {written} bytes"
                ))
            }
        };
        temp.write_all(&buffer[..read])
            .context("failed writing artifact chunk")?;
        written += read as u64;
    }

    if let Some(expected) = expected_len {
        if expected != written {
            bail!("truncated transfer: expected {expected} bytes, received {written}");
        }
    }
    if written == 0 {
        bail!("artifact body was empty");
    }

    temp.as_file()
        .sync_all()
        .context("failed flushing artifact to disk")?;
    temp.persist(destination)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to move artifact to {}", destination.display()))?;
    Ok(written)
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Pixel size from the image header; `None` when the bytes are not a known format.
pub fn probe_dimensions(path: &Path) -> Option<(u32, u32)> {
    match image::image_dimensions(path) {
        Ok(dims) => Some(dims),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "could not read image dimensions");
            None
        }
    }
}
