//! Streaming Huffman layer: `HUFF` stream magic followed by `HCHK` chunk
//! frames, compressed and decompressed by a parallel worker pool that
//! preserves chunk order on both sides.

use crate::huffman::{self, CHUNK_SIZE, MAX_CHUNK_LEN};
use crate::pipeline::{ChunkFn, FrameFn, OrderedReader, OrderedWriter};
use crate::{Error, Result};
use std::io::{self, Read, Write};
use std::sync::Arc;

pub(crate) const STREAM_MAGIC: [u8; 4] = *b"HUFF";
const CHUNK_MAGIC: [u8; 4] = *b"HCHK";

/// Fill `buf` from `r`, tolerating a clean EOF before the first byte.
/// Returns false on clean EOF, errors on a partial read.
fn read_frame_exact<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(Error::CorruptArchive {
                reason: "unexpected end of compressed stream".into(),
            });
        }
        filled += n;
    }
    Ok(true)
}

/// Compressing writer. Bytes accumulate into 256 KiB chunks which are
/// Huffman-encoded in parallel and framed onto the inner sink in order.
pub struct CompressedWriter<W: Write + Send + 'static> {
    pipeline: OrderedWriter<W>,
}

impl<W: Write + Send + 'static> CompressedWriter<W> {
    pub fn new(mut inner: W) -> Result<Self> {
        inner.write_all(&STREAM_MAGIC)?;

        let transform: ChunkFn = Arc::new(|_, data| {
            let body = huffman::compress_chunk(&data)?;
            let mut framed = Vec::with_capacity(8 + body.len());
            framed.extend_from_slice(&CHUNK_MAGIC);
            framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
            framed.extend_from_slice(&body);
            Ok(framed)
        });

        Ok(Self {
            pipeline: OrderedWriter::new(inner, CHUNK_SIZE, transform),
        })
    }

    /// Flush the final short chunk (an empty chunk frame marks the end of
    /// the stream), join the workers and return the inner sink.
    pub fn finish(self) -> Result<W> {
        self.pipeline.finish()
    }
}

impl<W: Write + Send + 'static> Write for CompressedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pipeline.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.pipeline.flush()
    }
}

/// Decompressing reader over a `HUFF` stream.
pub struct CompressedReader {
    pipeline: OrderedReader,
}

impl CompressedReader {
    /// Consumes and validates the stream magic, then starts the parallel
    /// decode pipeline.
    pub fn new<R: Read + Send + 'static>(mut inner: R) -> Result<Self> {
        let mut magic = [0u8; 4];
        if !read_frame_exact(&mut inner, &mut magic)? || magic != STREAM_MAGIC {
            return Err(Error::InvalidMagic { expected: "HUFF" });
        }

        let frame: FrameFn<R> = Box::new(|r| {
            let mut header = [0u8; 8];
            if !read_frame_exact(r, &mut header)? {
                return Ok(None);
            }
            if header[..4] != CHUNK_MAGIC {
                return Err(Error::CorruptArchive {
                    reason: "invalid huffman chunk magic".into(),
                });
            }
            let chunk_len =
                u32::from_be_bytes(header[4..8].try_into().expect("4-byte length")) as usize;
            if chunk_len == 0 {
                // Zero-length chunk is the end-of-stream marker.
                return Ok(None);
            }
            if chunk_len > MAX_CHUNK_LEN {
                return Err(Error::CorruptArchive {
                    reason: format!("huffman chunk too large: {chunk_len}"),
                });
            }
            let mut data = vec![0u8; chunk_len];
            if !read_frame_exact(r, &mut data)? {
                return Err(Error::CorruptArchive {
                    reason: "unexpected end of compressed stream".into(),
                });
            }
            Ok(Some(data))
        });

        let transform: ChunkFn = Arc::new(|_, data| huffman::decompress_chunk(&data));

        Ok(Self {
            pipeline: OrderedReader::spawn(inner, frame, transform),
        })
    }
}

impl Read for CompressedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.pipeline.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compress(input: &[u8]) -> Vec<u8> {
        let mut writer = CompressedWriter::new(Vec::new()).unwrap();
        writer.write_all(input).unwrap();
        writer.finish().unwrap()
    }

    fn decompress(data: Vec<u8>) -> io::Result<Vec<u8>> {
        let mut reader = CompressedReader::new(io::Cursor::new(data)).map_err(Error::into_io)?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_roundtrip_small_inputs() {
        for input in [
            &b""[..],
            b"a",
            b"AAAAABBBCCCCCCDDE",
            b"go gophers are great at golang programming, go go go!",
        ] {
            let out = decompress(compress(input)).unwrap();
            assert_eq!(out, input);
        }
    }

    #[test]
    fn test_roundtrip_multiple_chunks() {
        let input: Vec<u8> = b"The quick brown fox jumps over the lazy dog. "
            .iter()
            .copied()
            .cycle()
            .take(CHUNK_SIZE * 2 + 12345)
            .collect();
        let compressed = compress(&input);
        assert!(compressed.len() < input.len());
        assert_eq!(decompress(compressed).unwrap(), input);
    }

    #[test]
    fn test_stream_starts_with_magic() {
        let compressed = compress(b"hello");
        assert_eq!(&compressed[..4], b"HUFF");
        assert_eq!(&compressed[4..8], b"HCHK");
    }

    #[test]
    fn test_deterministic_output() {
        let input = b"deterministic stream".repeat(1000);
        assert_eq!(compress(&input), compress(&input));
    }

    #[test]
    fn test_rejects_wrong_magic() {
        let err = CompressedReader::new(io::Cursor::new(b"NOPE....".to_vec())).err();
        assert!(matches!(err, Some(Error::InvalidMagic { expected: "HUFF" })));
    }

    #[test]
    fn test_truncated_stream_fails() {
        let mut compressed = compress(&b"x".repeat(2048));
        compressed.truncate(compressed.len() / 2);
        assert!(decompress(compressed).is_err());
    }

    #[test]
    fn test_corrupt_chunk_magic_fails() {
        let mut compressed = compress(b"hello world");
        // Chunk magic sits right after the 4-byte stream magic.
        compressed[4] = b'X';
        assert!(decompress(compressed).is_err());
    }
}
