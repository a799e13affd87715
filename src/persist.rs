use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};
use tracing::trace;

use crate::interfaces::DatabaseError;

/// LZ4 frame magic, little-endian 0x184D2204.
const LZ4_FRAME_MAGIC: [u8; 4] = [0x04, 0x22, 0x4D, 0x18];

/// Read-only map of a whole file.
pub fn read_mapped(path: &Path) -> io::Result<Mmap> {
    let file = File::open(path)?;
    // Safety: callers drop the map before the file is rewritten.
    unsafe { Mmap::map(&file) }
}

/// Writable map of a whole file.
pub fn map_file_mut(path: &Path) -> io::Result<MmapMut> {
    let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
    // Safety: the map is private to the caller for its whole lifetime.
    unsafe { MmapMut::map_mut(&file) }
}

/// Buffered write through a temp file in the same directory followed by a
/// rename over the destination, so a failed write never clobbers the old
/// file.
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = temp_path(path);
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        writer.write_all(data)?;
        writer.into_inner().map_err(|err| err.into_error())?.sync_all()?;
    }
    match fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&tmp);
            Err(err)
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

pub fn compress_bytes(data: &[u8]) -> Result<Vec<u8>, DatabaseError> {
    let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
    encoder.write_all(data)?;
    encoder
        .finish()
        .map_err(|err| DatabaseError::InvalidArchive(err.to_string()))
}

/// Decompress a whole-file buffer. `Ok(None)` means the buffer does not carry
/// the frame magic and is already plain, which is not an error; a buffer that
/// *claims* compression but fails to decode is.
pub fn decompress_bytes(data: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
    if data.len() < LZ4_FRAME_MAGIC.len() || data[..4] != LZ4_FRAME_MAGIC {
        return Ok(None);
    }
    let mut decoder = lz4_flex::frame::FrameDecoder::new(data);
    let mut plain = Vec::new();
    decoder
        .read_to_end(&mut plain)
        .map_err(|err| DatabaseError::InvalidArchive(err.to_string()))?;
    trace!(
        compressed = data.len(),
        plain = plain.len(),
        "decompressed database buffer"
    );
    Ok(Some(plain))
}
