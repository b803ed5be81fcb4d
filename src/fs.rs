use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Metadata for one served path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub mtime: u64,
    pub is_dir: bool,
}

/// Abstract file access used by `serve_dir`/`serve_file`. The core
/// calls nothing else on the filesystem, so embedded targets can serve
/// from flash images or archives by implementing this.
pub trait FileProvider {
    /// `None` when the path does not exist.
    fn stat(&self, path: &Path) -> Option<FileStat>;

    /// Reads up to `len` bytes starting at `offset`. A short read past
    /// end-of-file is not an error.
    fn read(&self, path: &Path, offset: u64, len: usize) -> std::io::Result<Vec<u8>>;
}

/// `std::fs`-backed provider.
#[derive(Default, Clone, Copy)]
pub struct StdFs;

impl FileProvider for StdFs {
    fn stat(&self, path: &Path) -> Option<FileStat> {
        let meta = std::fs::metadata(path).ok()?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Some(FileStat {
            size: meta.len(),
            mtime,
            is_dir: meta.is_dir(),
        })
    }

    fn read(&self, path: &Path, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
        let mut file = std::fs::File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut out = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut out[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        out.truncate(filled);
        Ok(out)
    }
}
