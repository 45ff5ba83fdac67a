//! Symmetric encryption layer: password-derived keys, `QBAKENCR` framing
//! with a header MAC, and chunk-parallel AES-256-CTR / ChaCha20 streams
//!
//! The stream body is the plaintext cut into 1 MiB chunks; each chunk's
//! keystream is obtained independently by seeking the cipher to
//! `chunk_id * CHUNK_SIZE`, so workers can encrypt and decrypt chunks in any
//! order while the aggregator restores byte order. Payload bytes are not
//! authenticated; the version-2 header MAC is the password check.

use crate::pipeline::{ChunkFn, FrameFn, OrderedReader, OrderedWriter};
use crate::{Error, Result};
use cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use std::io::{self, Read, Write};
use std::sync::Arc;
use zeroize::Zeroizing;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub(crate) const ENCRYPTION_MAGIC: [u8; 8] = *b"QBAKENCR";

const VERSION_1: u8 = 0x01;
const VERSION_2: u8 = 0x02;
const CURRENT_VERSION: u8 = VERSION_2;

/// Unit of parallel cipher work.
pub(crate) const CHUNK_SIZE: usize = 1024 * 1024;

const SALT_LEN: usize = 16;
const PBKDF2_ITERATIONS: u32 = 4096;
const KEY_LEN: usize = 32;
const MAC_LEN: usize = 32;

/// Supported stream cipher algorithms. The ids are part of the on-disk
/// format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Aes256Ctr,
    ChaCha20,
}

impl Algorithm {
    pub fn id(self) -> u8 {
        match self {
            Algorithm::Aes256Ctr => 0x01,
            Algorithm::ChaCha20 => 0x02,
        }
    }

    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0x01 => Ok(Algorithm::Aes256Ctr),
            0x02 => Ok(Algorithm::ChaCha20),
            other => Err(Error::InvalidInput {
                reason: format!("unsupported encryption algorithm id: {other}"),
            }),
        }
    }

    fn nonce_len(self) -> usize {
        match self {
            Algorithm::Aes256Ctr => 16,
            Algorithm::ChaCha20 => 12,
        }
    }
}

fn derive_key(password: &str, salt: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut *key);
    key
}

fn header_mac(key: &[u8], header: &[u8]) -> Result<[u8; MAC_LEN]> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| Error::InvalidInput {
        reason: "invalid mac key length".into(),
    })?;
    mac.update(header);
    Ok(mac.finalize().into_bytes().into())
}

/// XOR chunk `id` of the stream with its keystream slice in place.
fn apply_chunk_keystream(
    algorithm: Algorithm,
    key: &[u8; KEY_LEN],
    nonce: &[u8],
    chunk_id: u64,
    data: &mut [u8],
) -> Result<()> {
    let position = chunk_id
        .checked_mul(CHUNK_SIZE as u64)
        .ok_or_else(|| Error::InvalidInput {
            reason: "cipher stream position overflow".into(),
        })?;
    let overflow = |_| Error::InvalidInput {
        reason: "cipher stream position overflow".into(),
    };
    let bad_params = |_| Error::InvalidInput {
        reason: "invalid cipher key or nonce length".into(),
    };

    match algorithm {
        Algorithm::Aes256Ctr => {
            let mut cipher = Aes256Ctr::new_from_slices(key, nonce).map_err(bad_params)?;
            cipher.try_seek(position).map_err(overflow)?;
            cipher.apply_keystream(data);
        }
        Algorithm::ChaCha20 => {
            let mut cipher = chacha20::ChaCha20::new_from_slices(key, nonce).map_err(bad_params)?;
            cipher.try_seek(position).map_err(overflow)?;
            cipher.apply_keystream(data);
        }
    }
    Ok(())
}

fn cipher_transform(algorithm: Algorithm, key: Zeroizing<[u8; KEY_LEN]>, nonce: Vec<u8>) -> ChunkFn {
    Arc::new(move |id, mut data| {
        apply_chunk_keystream(algorithm, &key, &nonce, id, &mut data)?;
        Ok(data)
    })
}

/// Encrypting writer: emits the `QBAKENCR` header (version 2, MAC'd) and
/// then the chunk-parallel ciphertext of everything written.
pub struct EncryptedWriter<W: Write + Send + 'static> {
    pipeline: OrderedWriter<W>,
}

impl<W: Write + Send + 'static> EncryptedWriter<W> {
    pub fn new(mut inner: W, password: &str, algorithm: Algorithm) -> Result<Self> {
        if password.is_empty() {
            return Err(Error::PasswordRequired);
        }

        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let mut nonce = vec![0u8; algorithm.nonce_len()];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let key = derive_key(password, &salt);

        let mut header = Vec::with_capacity(ENCRYPTION_MAGIC.len() + 4 + SALT_LEN + nonce.len());
        header.extend_from_slice(&ENCRYPTION_MAGIC);
        header.push(CURRENT_VERSION);
        header.push(algorithm.id());
        header.push(salt.len() as u8);
        header.extend_from_slice(&salt);
        header.push(nonce.len() as u8);
        header.extend_from_slice(&nonce);

        let mac = header_mac(&*key, &header)?;
        inner.write_all(&header)?;
        inner.write_all(&mac)?;

        Ok(Self {
            pipeline: OrderedWriter::new(inner, CHUNK_SIZE, cipher_transform(algorithm, key, nonce)),
        })
    }

    /// Flush the final short chunk, join the workers and return the inner
    /// sink. The derived key is zeroized when the pipeline drops it.
    pub fn finish(self) -> Result<W> {
        self.pipeline.finish()
    }
}

impl<W: Write + Send + 'static> Write for EncryptedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pipeline.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.pipeline.flush()
    }
}

/// Decrypting reader. Validates the header (and its MAC on version ≥ 2,
/// failing fast with `InvalidPassword`) before any payload I/O happens.
pub struct DecryptedReader {
    pipeline: OrderedReader,
}

impl DecryptedReader {
    pub fn new<R: Read + Send + 'static>(mut inner: R, password: &str) -> Result<Self> {
        let corrupt = |reason: &str| Error::CorruptArchive {
            reason: reason.to_string(),
        };
        let short_header = |err: io::Error| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                corrupt("truncated encryption header")
            } else {
                Error::Io(err)
            }
        };

        let mut magic = [0u8; ENCRYPTION_MAGIC.len()];
        inner.read_exact(&mut magic).map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                Error::InvalidMagic {
                    expected: "QBAKENCR",
                }
            } else {
                Error::Io(err)
            }
        })?;
        if magic != ENCRYPTION_MAGIC {
            return Err(Error::InvalidMagic {
                expected: "QBAKENCR",
            });
        }
        if password.is_empty() {
            return Err(Error::PasswordRequired);
        }

        let mut meta = [0u8; 2];
        inner.read_exact(&mut meta).map_err(short_header)?;
        let version = meta[0];
        if version != VERSION_1 && version != VERSION_2 {
            return Err(corrupt(&format!(
                "unsupported encryption version: {version}"
            )));
        }
        let algorithm = Algorithm::from_id(meta[1])?;

        let mut len = [0u8; 1];
        inner.read_exact(&mut len).map_err(short_header)?;
        let mut salt = vec![0u8; len[0] as usize];
        inner.read_exact(&mut salt).map_err(short_header)?;

        inner.read_exact(&mut len).map_err(short_header)?;
        let mut nonce = vec![0u8; len[0] as usize];
        inner.read_exact(&mut nonce).map_err(short_header)?;

        let key = derive_key(password, &salt);

        if version >= VERSION_2 {
            let mut expected = [0u8; MAC_LEN];
            inner.read_exact(&mut expected).map_err(short_header)?;

            let mut header = Vec::with_capacity(ENCRYPTION_MAGIC.len() + 4 + salt.len() + nonce.len());
            header.extend_from_slice(&ENCRYPTION_MAGIC);
            header.push(version);
            header.push(algorithm.id());
            header.push(salt.len() as u8);
            header.extend_from_slice(&salt);
            header.push(nonce.len() as u8);
            header.extend_from_slice(&nonce);

            let mut mac = HmacSha256::new_from_slice(&*key).map_err(|_| Error::InvalidInput {
                reason: "invalid mac key length".into(),
            })?;
            mac.update(&header);
            if mac.verify_slice(&expected).is_err() {
                return Err(Error::InvalidPassword);
            }
        }

        let frame: FrameFn<R> = Box::new(|r| {
            let mut chunk = vec![0u8; CHUNK_SIZE];
            let mut filled = 0;
            while filled < chunk.len() {
                let n = r.read(&mut chunk[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                return Ok(None);
            }
            chunk.truncate(filled);
            Ok(Some(chunk))
        });

        Ok(Self {
            pipeline: OrderedReader::spawn(inner, frame, cipher_transform(algorithm, key, nonce)),
        })
    }
}

impl Read for DecryptedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.pipeline.read(buf)
    }
}

/// Sniff an encryption header, reporting the algorithm when present. Reads
/// at most 10 bytes from `r`.
pub fn sniff_encryption<R: Read>(r: &mut R) -> Result<Option<Algorithm>> {
    let mut head = [0u8; ENCRYPTION_MAGIC.len() + 2];
    let mut filled = 0;
    while filled < head.len() {
        let n = r.read(&mut head[filled..])?;
        if n == 0 {
            return Ok(None);
        }
        filled += n;
    }
    if head[..ENCRYPTION_MAGIC.len()] != ENCRYPTION_MAGIC {
        return Ok(None);
    }
    Ok(Algorithm::from_id(head[ENCRYPTION_MAGIC.len() + 1]).ok())
}

/// Score a password from 0 (weak) to 6 and suggest improvements.
pub fn password_strength(password: &str) -> (u8, Vec<String>) {
    let mut score: i32 = 0;
    let mut suggestions = Vec::new();

    let length = password.chars().count();
    if length < 8 {
        suggestions.push("use at least 8 characters, 12 or more recommended".to_string());
    } else if length >= 10 {
        score += 2;
    } else {
        score += 1;
    }

    let has_lower = password.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_special = password
        .chars()
        .any(|c| !c.is_ascii_alphanumeric());

    let mut complexity = 0;
    for (present, hint) in [
        (has_lower, "include lowercase letters"),
        (has_upper, "include uppercase letters"),
        (has_digit, "include digits"),
        (has_special, "include special characters"),
    ] {
        if present {
            complexity += 1;
        } else {
            suggestions.push(hint.to_string());
        }
    }

    // Short passwords do not earn complexity points; a short password with
    // every character class is still weak.
    if length >= 8 {
        score += complexity;
    }

    const WEAK_PATTERNS: [&str; 5] = ["123456", "password", "qwerty", "admin", "root"];
    if WEAK_PATTERNS.contains(&password) {
        score -= 1;
        suggestions.push("avoid common weak passwords".to_string());
    }

    (score.clamp(0, 6) as u8, suggestions)
}
