//! Layer archive codec: a single-entry tar stream, gzip compressed.
//!
//! Packing reads the image as is, so holes go into the tar entry as runs of
//! zeros and only gzip keeps them small. Extraction skips all-zero runs with
//! seeks so holes in the image become holes on the local filesystem again.
//! These functions block and are called from `spawn_blocking`.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use sdisk_common::layout::partial_path;
use sdisk_common::{DiskError, DiskResult};

/// Granularity of hole detection on extraction
const SPARSE_CHUNK: usize = 64 * 1024;

/// Write `src` to `out` as a tar.gz holding one entry named `entry_name`.
/// Returns `out`, flushed.
pub fn pack<W: Write>(src: &Path, entry_name: &str, out: W) -> DiskResult<W> {
    let encoder = GzEncoder::new(out, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_path_with_name(src, entry_name)?;
    let encoder = builder.into_inner()?;
    let mut out = encoder.finish()?;
    out.flush()?;
    Ok(out)
}

/// Extract the first regular file of a tar.gz stream to `dest`.
///
/// The data lands in a `.part` sibling that is renamed over `dest` once
/// complete. Returns the extracted length.
pub fn unpack<R: Read>(archive: R, dest: &Path) -> DiskResult<u64> {
    let mut tar = tar::Archive::new(GzDecoder::new(archive));
    for entry in tar.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let part = partial_path(dest);
        let len = match write_sparse(&mut entry, &part) {
            Ok(len) => len,
            Err(e) => {
                let _ = std::fs::remove_file(&part);
                return Err(e.into());
            }
        };
        std::fs::rename(&part, dest)?;
        return Ok(len);
    }
    Err(DiskError::integrity("layer archive contains no image"))
}

/// Copy `reader` into a new file at `dest`, seeking over zero chunks
pub fn write_sparse<R: Read>(reader: &mut R, dest: &Path) -> io::Result<u64> {
    let mut file = File::create(dest)?;
    let mut buf = vec![0u8; SPARSE_CHUNK];
    let mut total = 0u64;
    loop {
        let n = fill(reader, &mut buf)?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        if chunk.iter().all(|&b| b == 0) {
            file.seek(SeekFrom::Current(i64::try_from(n).map_err(io::Error::other)?))?;
        } else {
            file.write_all(chunk)?;
        }
        total += n as u64;
    }
    // trailing holes are only materialized by extending the length
    file.set_len(total)?;
    file.sync_all()?;
    Ok(total)
}

/// Read until `buf` is full or the reader is exhausted
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
