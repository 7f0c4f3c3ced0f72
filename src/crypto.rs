//! File encryption capability used by the copy pipeline.
//!
//! The pipeline only depends on [`Encryptor`]. [`StreamCipher`] is the
//! default implementation: a BLAKE3 keyed-XOF keystream XORed over the file,
//! preceded by a small header carrying a random IV.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const MAGIC: &[u8; 4] = b"BKJE";
pub const VERSION: u8 = 1;
pub const IV_LEN: usize = 16;
pub const HEADER_LEN: usize = MAGIC.len() + 1 + IV_LEN;

const KEY_CONTEXT: &str = "backup-jobs 2024-01-01 file encryption key";
const CHUNK: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum EncryptError {
    #[error("no encryption key configured")]
    MissingKey,
    #[error("{path}: not an encrypted file")]
    BadHeader { path: PathBuf },
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// `Encrypt(source, dest, key) -> elapsed | error`.
pub trait Encryptor: Send + Sync {
    fn encrypt(&self, source: &Path, dest: &Path, key: &str) -> Result<Duration, EncryptError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StreamCipher;

impl StreamCipher {
    pub fn new() -> Self {
        Self
    }

    /// Inverse of [`Encryptor::encrypt`].
    pub fn decrypt(&self, source: &Path, dest: &Path, key: &str) -> Result<Duration, EncryptError> {
        let started = Instant::now();
        let key = derive_key(key)?;
        let mut reader = BufReader::new(open(source)?);

        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).map_err(|_| EncryptError::BadHeader {
            path: source.to_path_buf(),
        })?;
        if &header[..MAGIC.len()] != MAGIC || header[MAGIC.len()] != VERSION {
            return Err(EncryptError::BadHeader {
                path: source.to_path_buf(),
            });
        }
        let iv = &header[MAGIC.len() + 1..];

        let mut writer = BufWriter::new(create(dest)?);
        apply_keystream(&key, iv, &mut reader, &mut writer, source, dest)?;
        Ok(started.elapsed())
    }
}

impl Encryptor for StreamCipher {
    fn encrypt(&self, source: &Path, dest: &Path, key: &str) -> Result<Duration, EncryptError> {
        let started = Instant::now();
        let key = derive_key(key)?;
        let iv = *uuid::Uuid::new_v4().as_bytes();

        let mut reader = BufReader::new(open(source)?);
        let mut writer = BufWriter::new(create(dest)?);

        let io_err = |source: io::Error| EncryptError::Io {
            path: dest.to_path_buf(),
            source,
        };
        writer.write_all(MAGIC).map_err(io_err)?;
        writer.write_all(&[VERSION]).map_err(io_err)?;
        writer.write_all(&iv).map_err(io_err)?;

        apply_keystream(&key, &iv, &mut reader, &mut writer, source, dest)?;
        Ok(started.elapsed())
    }
}

fn derive_key(passphrase: &str) -> Result<[u8; 32], EncryptError> {
    if passphrase.is_empty() {
        return Err(EncryptError::MissingKey);
    }
    Ok(blake3::derive_key(KEY_CONTEXT, passphrase.as_bytes()))
}

fn apply_keystream<R: Read, W: Write>(
    key: &[u8; 32],
    iv: &[u8],
    reader: &mut R,
    writer: &mut W,
    source: &Path,
    dest: &Path,
) -> Result<(), EncryptError> {
    let mut hasher = blake3::Hasher::new_keyed(key);
    hasher.update(iv);
    let mut keystream = hasher.finalize_xof();

    let mut data = vec![0u8; CHUNK];
    let mut pad = vec![0u8; CHUNK];
    loop {
        let n = reader.read(&mut data).map_err(|e| EncryptError::Io {
            path: source.to_path_buf(),
            source: e,
        })?;
        if n == 0 {
            break;
        }
        keystream.fill(&mut pad[..n]);
        for (byte, k) in data[..n].iter_mut().zip(&pad[..n]) {
            *byte ^= k;
        }
        writer.write_all(&data[..n]).map_err(|e| EncryptError::Io {
            path: dest.to_path_buf(),
            source: e,
        })?;
    }
    writer.flush().map_err(|e| EncryptError::Io {
        path: dest.to_path_buf(),
        source: e,
    })
}

fn open(path: &Path) -> Result<File, EncryptError> {
    File::open(path).map_err(|source| EncryptError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn create(path: &Path) -> Result<File, EncryptError> {
    File::create(path).map_err(|source| EncryptError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_restores_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("report.docx");
        let sealed = dir.path().join("report.enc");
        let opened = dir.path().join("report.out");
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&plain, &content).unwrap();

        let cipher = StreamCipher::new();
        cipher.encrypt(&plain, &sealed, "secret").unwrap();
        let encrypted = std::fs::read(&sealed).unwrap();
        assert_eq!(&encrypted[..4], MAGIC);
        assert_eq!(encrypted.len(), content.len() + HEADER_LEN);
        assert_ne!(&encrypted[HEADER_LEN..], &content[..]);

        cipher.decrypt(&sealed, &opened, "secret").unwrap();
        assert_eq!(std::fs::read(&opened).unwrap(), content);
    }

    #[test]
    fn same_input_gets_fresh_iv() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("a.txt");
        std::fs::write(&plain, b"hello hello").unwrap();
        let cipher = StreamCipher::new();
        cipher.encrypt(&plain, &dir.path().join("1"), "k").unwrap();
        cipher.encrypt(&plain, &dir.path().join("2"), "k").unwrap();
        assert_ne!(
            std::fs::read(dir.path().join("1")).unwrap(),
            std::fs::read(dir.path().join("2")).unwrap()
        );
    }

    #[test]
    fn missing_key_and_bad_header_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("a.txt");
        std::fs::write(&plain, b"plain").unwrap();
        let cipher = StreamCipher::new();
        assert!(matches!(
            cipher.encrypt(&plain, &dir.path().join("b"), ""),
            Err(EncryptError::MissingKey)
        ));
        assert!(matches!(
            cipher.decrypt(&plain, &dir.path().join("c"), "k"),
            Err(EncryptError::BadHeader { .. })
        ));
    }
}
