//! Buffered file plumbing: streamed copies with optional rolling CRC and
//! pad-aware access to a rank's logical file set.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

pub fn file_size(path: &Path) -> Result<u64, Error> {
    Ok(std::fs::metadata(path)
        .map_err(|err| format_err!("unable to stat {:?} - {}", path, err))?
        .len())
}

/// Copy `src` into `dst_dir` under its own basename, streaming through a
/// buffer of `buf_size` bytes. Returns the destination path, the byte count
/// and the CRC32 when requested. The destination is fsynced before return.
pub fn copy_to(
    src: &Path,
    dst_dir: &Path,
    buf_size: usize,
    with_crc: bool,
) -> Result<(PathBuf, u64, Option<u32>), Error> {
    let name = src
        .file_name()
        .ok_or_else(|| format_err!("refusing to copy path without file name: {:?}", src))?;
    let dst = dst_dir.join(name);

    let mut reader =
        File::open(src).map_err(|err| format_err!("unable to open {:?} - {}", src, err))?;
    let mut writer = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&dst)
        .map_err(|err| format_err!("unable to create {:?} - {}", dst, err))?;

    let mut hasher = with_crc.then(crc32fast::Hasher::new);
    let mut buf = vec![0u8; buf_size.max(4096)];
    let mut written: u64 = 0;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&buf[..n]);
        }
        writer.write_all(&buf[..n])?;
        written += n as u64;
    }

    writer.flush()?;
    nix::unistd::fsync(writer.as_raw_fd())
        .map_err(|err| format_err!("fsync of {:?} failed - {}", dst, err))?;

    Ok((dst, written, hasher.map(|h| h.finalize())))
}

/// A rank's data files viewed as one virtual byte stream in list order,
/// zero padded past the end.
///
/// The XOR encoder reads stripes from this stream; the rebuild root writes
/// them back, silently dropping the padding bytes that fall outside every
/// file.
pub struct LogicalFileSet {
    files: Vec<(PathBuf, File, u64)>,
}

impl LogicalFileSet {
    pub fn open_read(paths: &[(PathBuf, u64)]) -> Result<Self, Error> {
        let mut files = Vec::with_capacity(paths.len());
        for (path, size) in paths {
            let file = File::open(path)
                .map_err(|err| format_err!("unable to open {:?} for reading - {}", path, err))?;
            files.push((path.clone(), file, *size));
        }
        Ok(Self { files })
    }

    /// Create (truncate) every file for writing; sizes are the original
    /// file sizes from the chunk header.
    pub fn create_write(paths: &[(PathBuf, u64)]) -> Result<Self, Error> {
        let mut files = Vec::with_capacity(paths.len());
        for (path, size) in paths {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .map_err(|err| format_err!("unable to create {:?} - {}", path, err))?;
            files.push((path.clone(), file, *size));
        }
        Ok(Self { files })
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|(_, _, size)| size).sum()
    }

    /// Read `buf.len()` bytes at `offset` of the logical stream, zero
    /// padding any range beyond the end of the last file.
    pub fn read_pad(&mut self, buf: &mut [u8], offset: u64) -> Result<(), Error> {
        buf.fill(0);
        let range_end = offset + buf.len() as u64;
        let mut file_start: u64 = 0;
        for (path, file, size) in self.files.iter_mut() {
            let file_end = file_start + *size;
            let start = offset.max(file_start);
            let end = range_end.min(file_end);
            if start < end {
                let buf_off = (start - offset) as usize;
                let count = (end - start) as usize;
                file.seek(SeekFrom::Start(start - file_start))?;
                file.read_exact(&mut buf[buf_off..buf_off + count])
                    .map_err(|err| format_err!("short read from {:?} - {}", path, err))?;
            }
            file_start = file_end;
        }
        Ok(())
    }

    /// Write `buf` at `offset` of the logical stream; bytes past the end of
    /// the last file are padding and are not written anywhere.
    pub fn write_pad(&mut self, buf: &[u8], offset: u64) -> Result<(), Error> {
        let range_end = offset + buf.len() as u64;
        let mut file_start: u64 = 0;
        for (path, file, size) in self.files.iter_mut() {
            let file_end = file_start + *size;
            let start = offset.max(file_start);
            let end = range_end.min(file_end);
            if start < end {
                let buf_off = (start - offset) as usize;
                let count = (end - start) as usize;
                file.seek(SeekFrom::Start(start - file_start))?;
                file.write_all(&buf[buf_off..buf_off + count])
                    .map_err(|err| format_err!("short write to {:?} - {}", path, err))?;
            }
            file_start = file_end;
        }
        Ok(())
    }
}

/// Verify that the on-disk size of `path` matches `expected`.
pub fn check_size(path: &Path, expected: u64) -> Result<(), Error> {
    let actual = file_size(path)?;
    if actual != expected {
        bail!(
            "size mismatch for {:?}: expected {}, found {}",
            path,
            expected,
            actual
        );
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn logical_set_pads_and_round_trips() {
        let dir = std::env::temp_dir().join(format!("scr-fileio-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let a = dir.join("a");
        let b = dir.join("b");
        std::fs::write(&a, vec![1u8; 10]).unwrap();
        std::fs::write(&b, vec![2u8; 5]).unwrap();

        let paths = vec![(a.clone(), 10), (b.clone(), 5)];
        let mut set = LogicalFileSet::open_read(&paths).unwrap();
        assert_eq!(set.total_bytes(), 15);

        // spans the a/b boundary and runs past the end
        let mut buf = vec![0xff; 12];
        set.read_pad(&mut buf, 8).unwrap();
        assert_eq!(&buf[..2], &[1, 1]);
        assert_eq!(&buf[2..7], &[2; 5]);
        assert_eq!(&buf[7..], &[0; 5]);

        // write the stream back through a fresh set, padding dropped
        let out_a = dir.join("out_a");
        let out_b = dir.join("out_b");
        let out_paths = vec![(out_a.clone(), 10), (out_b.clone(), 5)];
        let mut out = LogicalFileSet::create_write(&out_paths).unwrap();
        let mut stream = vec![0u8; 20];
        let mut src = LogicalFileSet::open_read(&paths).unwrap();
        src.read_pad(&mut stream, 0).unwrap();
        out.write_pad(&stream, 0).unwrap();
        drop(out);
        assert_eq!(std::fs::read(&out_a).unwrap(), vec![1u8; 10]);
        assert_eq!(std::fs::read(&out_b).unwrap(), vec![2u8; 5]);

        let sub = dir.join("copied");
        std::fs::create_dir_all(&sub).unwrap();
        let (dst, bytes, crc) = copy_to(&a, &sub, 4, true).unwrap();
        assert_eq!(bytes, 10);
        assert!(crc.is_some());
        assert_eq!(std::fs::read(dst).unwrap(), vec![1u8; 10]);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
