//! Archive container: length-prefixed JSON entry headers, sized payloads
//! and optional CRC32 trailers written back-to-back onto the current sink

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Safety limit for a JSON entry header.
pub(crate) const MAX_HEADER_LEN: usize = 1 << 20;

pub(crate) const COPY_BUFFER_SIZE: usize = 256 * 1024;

const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;

fn is_false(v: &bool) -> bool {
    !*v
}

pub(crate) fn is_regular_mode(mode: u32) -> bool {
    mode & S_IFMT == S_IFREG
}

/// Metadata describing one filesystem object within an archive.
///
/// Exactly one of: regular file (`size ≥ 0`), directory (`size = 0`),
/// symlink (`size = 0`, non-empty `link_dest`) or tombstone (`deleted`,
/// `size = 0`). `has_crc` may only be set on non-deleted regular files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// Forward-slash path relative to the source base directory.
    pub path: String,
    /// Payload bytes that follow the header.
    pub size: u64,
    /// Filesystem mode bits, including the file-type bits.
    pub mode: u32,
    pub mod_time: DateTime<Utc>,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub is_link: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub link_dest: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub has_crc: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
}

impl FileMetadata {
    pub fn is_regular(&self) -> bool {
        !self.deleted && !self.is_dir && !self.is_link && self.mode & S_IFMT == S_IFREG
    }

    /// Permission bits for chmod on restore.
    pub fn perm(&self) -> u32 {
        self.mode & 0o777
    }
}

/// Synthesize mode bits when the platform does not expose st_mode.
#[allow(dead_code)]
pub(crate) fn synthetic_mode(is_dir: bool, is_link: bool) -> u32 {
    if is_dir {
        S_IFDIR | 0o755
    } else if is_link {
        S_IFLNK | 0o777
    } else {
        S_IFREG | 0o644
    }
}

pub(crate) fn mode_of(meta: &std::fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        meta.mode()
    }
    #[cfg(not(unix))]
    {
        synthetic_mode(meta.is_dir(), meta.file_type().is_symlink())
    }
}

/// Writes entries onto whatever sink is current (file, compressor or
/// encryptor). Exactly one writer exists per archive; callers serialize
/// access through a mutex.
pub struct ArchiveWriter<W: Write> {
    w: W,
    buffer: Vec<u8>,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(w: W) -> Self {
        Self {
            w,
            buffer: vec![0u8; COPY_BUFFER_SIZE],
        }
    }

    /// Write one entry: header length, JSON header, exactly `meta.size`
    /// payload bytes from `data`, and a CRC32 trailer when `has_crc`.
    /// `on_write` observes payload byte counts for progress accounting.
    pub fn write_entry(
        &mut self,
        meta: &FileMetadata,
        mut data: Option<&mut dyn Read>,
        mut on_write: impl FnMut(u64),
    ) -> Result<()> {
        let header = serde_json::to_vec(meta)?;
        self.w.write_all(&(header.len() as u32).to_be_bytes())?;
        self.w.write_all(&header)?;

        let mut crc = if meta.has_crc && meta.is_regular() {
            Some(crc32fast::Hasher::new())
        } else {
            None
        };

        if meta.size > 0 {
            let reader = data.as_mut().ok_or_else(|| Error::InvalidInput {
                reason: format!("missing payload reader for {}", meta.path),
            })?;
            let mut written = 0u64;
            while written < meta.size {
                let want = (meta.size - written).min(self.buffer.len() as u64) as usize;
                let n = reader.read(&mut self.buffer[..want])?;
                if n == 0 {
                    return Err(Error::CorruptArchive {
                        reason: format!(
                            "file size mismatch for {}: expected {}, wrote {}",
                            meta.path, meta.size, written
                        ),
                    });
                }
                self.w.write_all(&self.buffer[..n])?;
                if let Some(crc) = crc.as_mut() {
                    crc.update(&self.buffer[..n]);
                }
                written += n as u64;
                on_write(n as u64);
            }
        }

        if let Some(crc) = crc {
            self.w.write_all(&crc.finalize().to_be_bytes())?;
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.w
    }
}

/// Reads entries back. `next_entry` returning `None` marks a clean end of
/// the archive; anything short or out of bounds is a fatal parse error.
pub struct ArchiveReader<R: Read> {
    r: R,
}

impl<R: Read> ArchiveReader<R> {
    pub fn new(r: R) -> Self {
        Self { r }
    }

    pub fn next_entry(&mut self) -> Result<Option<FileMetadata>> {
        let mut len_bytes = [0u8; 4];
        let mut filled = 0;
        while filled < len_bytes.len() {
            let n = self.r.read(&mut len_bytes[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(Error::CorruptArchive {
                    reason: "truncated entry header length".into(),
                });
            }
            filled += n;
        }

        let header_len = u32::from_be_bytes(len_bytes) as usize;
        if header_len == 0 || header_len > MAX_HEADER_LEN {
            return Err(Error::CorruptArchive {
                reason: format!("invalid archive header length: {header_len}"),
            });
        }

        let mut header = vec![0u8; header_len];
        self.r.read_exact(&mut header).map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                Error::CorruptArchive {
                    reason: "truncated entry header".into(),
                }
            } else {
                Error::Io(err)
            }
        })?;

        let meta =
            serde_json::from_slice(&header).map_err(|err| Error::CorruptArchive {
                reason: format!("invalid entry header: {err}"),
            })?;
        Ok(Some(meta))
    }

    /// Read an entire payload into memory (manifest entries only).
    pub fn read_payload(&mut self, size: u64) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; size as usize];
        self.r.read_exact(&mut payload).map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                Error::CorruptArchive {
                    reason: "truncated entry payload".into(),
                }
            } else {
                Error::Io(err)
            }
        })?;
        Ok(payload)
    }

    /// Discard a payload without materializing it.
    pub fn skip_payload(&mut self, size: u64) -> Result<()> {
        let copied = io::copy(&mut (&mut self.r).take(size), &mut io::sink())?;
        if copied != size {
            return Err(Error::CorruptArchive {
                reason: "truncated entry payload".into(),
            });
        }
        Ok(())
    }

    pub fn read_crc(&mut self) -> Result<u32> {
        let mut crc = [0u8; 4];
        self.r.read_exact(&mut crc).map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                Error::CorruptArchive {
                    reason: "truncated crc32 trailer".into(),
                }
            } else {
                Error::Io(err)
            }
        })?;
        Ok(u32::from_be_bytes(crc))
    }

    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn file_meta(path: &str, size: u64, has_crc: bool) -> FileMetadata {
        FileMetadata {
            path: path.into(),
            size,
            mode: S_IFREG | 0o644,
            mod_time: Utc::now(),
            is_dir: false,
            is_link: false,
            link_dest: String::new(),
            has_crc,
            deleted: false,
        }
    }

    #[test]
    fn test_entry_roundtrip_with_crc() {
        let payload = b"hello archive";
        let meta = file_meta("dir/a.txt", payload.len() as u64, true);

        let mut writer = ArchiveWriter::new(Vec::new());
        writer
            .write_entry(&meta, Some(&mut Cursor::new(payload)), |_| {})
            .unwrap();
        let bytes = writer.into_inner();

        let mut reader = ArchiveReader::new(Cursor::new(bytes));
        let parsed = reader.next_entry().unwrap().unwrap();
        assert_eq!(parsed.path, "dir/a.txt");
        assert_eq!(parsed.size, payload.len() as u64);
        assert!(parsed.has_crc);
        assert!(parsed.is_regular());

        let data = reader.read_payload(parsed.size).unwrap();
        assert_eq!(data, payload);
        assert_eq!(reader.read_crc().unwrap(), crc32fast::hash(payload));
        assert!(reader.next_entry().unwrap().is_none());
    }

    #[test]
    fn test_payload_progress_callback() {
        let payload = vec![7u8; 1000];
        let meta = file_meta("big.bin", payload.len() as u64, false);

        let mut counted = 0u64;
        let mut writer = ArchiveWriter::new(Vec::new());
        writer
            .write_entry(&meta, Some(&mut Cursor::new(payload)), |n| counted += n)
            .unwrap();
        assert_eq!(counted, 1000);
    }

    #[test]
    fn test_short_payload_is_an_error() {
        let meta = file_meta("short.bin", 100, false);
        let mut writer = ArchiveWriter::new(Vec::new());
        let err = writer
            .write_entry(&meta, Some(&mut Cursor::new(b"only ten b")), |_| {})
            .unwrap_err();
        assert!(matches!(err, Error::CorruptArchive { .. }));
    }

    #[test]
    fn test_tombstone_serializes_flags() {
        let meta = FileMetadata {
            path: "gone.txt".into(),
            size: 0,
            mode: S_IFREG | 0o644,
            mod_time: Utc::now(),
            is_dir: false,
            is_link: false,
            link_dest: String::new(),
            has_crc: false,
            deleted: true,
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"deleted\":true"));
        assert!(!json.contains("hasCrc"));
        assert!(!json.contains("linkDest"));
    }

    #[test]
    fn test_header_length_bounds() {
        // Length 0 is invalid.
        let mut reader = ArchiveReader::new(Cursor::new(vec![0, 0, 0, 0]));
        assert!(matches!(
            reader.next_entry(),
            Err(Error::CorruptArchive { .. })
        ));

        // Length above the cap is invalid.
        let mut oversized = Vec::new();
        oversized.extend_from_slice(&((MAX_HEADER_LEN as u32) + 1).to_be_bytes());
        let mut reader = ArchiveReader::new(Cursor::new(oversized));
        assert!(matches!(
            reader.next_entry(),
            Err(Error::CorruptArchive { .. })
        ));
    }

    #[test]
    fn test_partial_header_length_is_fatal() {
        let mut reader = ArchiveReader::new(Cursor::new(vec![0, 0]));
        assert!(matches!(
            reader.next_entry(),
            Err(Error::CorruptArchive { .. })
        ));
    }
}
