//! Encrypted image streams.
//!
//! Chunks are encrypted one by one with AES-256-CBC. The key is derived
//! once from the pre-shared secret and a persisted salt; every chunk's IV
//! is derived from its index, so any chunk decrypts on its own. Only the
//! final, partial chunk of a stream is padded (PKCS#7), which is why the
//! chunk size must be a multiple of the cipher block size.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use aes::Aes256;
use cbc::cipher::block_padding::{NoPadding, Pkcs7};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use crate::attrs;
use crate::compression::Compression;
use crate::error::{Error, Result};
use crate::image::{ChunkTransform, ImageStream};
use crate::object::{Handle, Mode, Object, ObjectType, Stream};
use crate::resolver::Resolver;
use crate::urn::Urn;

type Encryptor = cbc::Encryptor<Aes256>;
type Decryptor = cbc::Decryptor<Aes256>;

pub const BLOCK_SIZE: u64 = 16;
const SALT_LEN: usize = 16;

/// Supported values of `aff4:cipher`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cipher {
    /// Chunks are stored as they are.
    Null,
    /// AES-256-CBC keyed from a pre-shared secret.
    Aes256CbcPsk,
}

impl Cipher {
    pub const fn name(self) -> &'static str {
        match self {
            Cipher::Null => "null",
            Cipher::Aes256CbcPsk => "aes256-cbc-psk",
        }
    }

    pub fn from_name(name: &str) -> Option<Cipher> {
        match name {
            "null" => Some(Cipher::Null),
            "aes256-cbc-psk" => Some(Cipher::Aes256CbcPsk),
            _ => None,
        }
    }
}

/// Pre-shared-key chunk cipher.
pub(crate) struct PskCipher {
    master_key: [u8; 32],
}

impl PskCipher {
    pub(crate) fn new(secret: &[u8], salt: &[u8]) -> PskCipher {
        let mut hasher = blake3::Hasher::new();
        hasher.update(secret);
        hasher.update(salt);
        PskCipher {
            master_key: *hasher.finalize().as_bytes(),
        }
    }

    fn iv(&self, chunk_index: u64) -> [u8; 16] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&chunk_index.to_le_bytes());
        hasher.update(&self.master_key);
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
        iv
    }

    /// Persisted fingerprint of the master key.
    fn key_check(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"aff4 key check");
        hasher.update(&self.master_key);
        hasher.finalize().to_hex().to_string()
    }

    fn encryptor(&self, chunk_index: u64) -> Result<Encryptor> {
        Encryptor::new_from_slices(&self.master_key, &self.iv(chunk_index))
            .map_err(|e| Error::crypto(e.to_string()))
    }

    fn decryptor(&self, chunk_index: u64) -> Result<Decryptor> {
        Decryptor::new_from_slices(&self.master_key, &self.iv(chunk_index))
            .map_err(|e| Error::crypto(e.to_string()))
    }
}

impl ChunkTransform for PskCipher {
    fn encode(&self, chunk_index: u64, chunk: &[u8], chunk_size: u64) -> Result<Vec<u8>> {
        let enc = self.encryptor(chunk_index)?;
        if chunk.len() as u64 == chunk_size {
            Ok(enc.encrypt_padded_vec_mut::<NoPadding>(chunk))
        } else {
            Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(chunk))
        }
    }

    fn decode(&self, chunk_index: u64, chunk: Vec<u8>, plain_len: u64) -> Result<Vec<u8>> {
        let dec = self.decryptor(chunk_index)?;
        let plain = if chunk.len() as u64 == plain_len {
            dec.decrypt_padded_vec_mut::<NoPadding>(&chunk)
        } else {
            dec.decrypt_padded_vec_mut::<Pkcs7>(&chunk)
        }
        .map_err(|_| Error::crypto(format!("chunk {} does not decrypt", chunk_index)))?;

        if plain.len() as u64 != plain_len {
            return Err(Error::crypto(format!(
                "chunk {} decrypted to {} bytes, expected {}",
                chunk_index,
                plain.len(),
                plain_len
            )));
        }
        Ok(plain)
    }
}

impl fmt::Debug for PskCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PskCipher(..)")
    }
}

/// An image whose chunks are encrypted.
#[derive(Debug)]
pub struct EncryptedStream {
    inner: ImageStream,
}

impl EncryptedStream {
    pub(crate) fn construct(resolver: &Resolver, urn: &Urn, mode: Mode) -> Result<Box<dyn Object>> {
        let cipher_name = match (resolver.resolve_string(urn, attrs::CIPHER), mode) {
            (Some(name), _) => name,
            (None, Mode::Write) => {
                resolver.set(urn, attrs::CIPHER, Cipher::Aes256CbcPsk.name());
                Cipher::Aes256CbcPsk.name().to_string()
            }
            (None, Mode::Read) => {
                return Err(Error::MissingAttribute {
                    urn: urn.clone(),
                    attr: attrs::CIPHER,
                })
            }
        };
        let cipher = Cipher::from_name(&cipher_name)
            .ok_or_else(|| Error::crypto(format!("unsupported cipher {:?} on {}", cipher_name, urn)))?;

        if mode == Mode::Write {
            resolver.set(urn, attrs::COMPRESSION, Compression::Stored.name());
        }

        let transform: Option<Arc<dyn ChunkTransform>> = match cipher {
            Cipher::Null => None,
            Cipher::Aes256CbcPsk => Some(Arc::new(EncryptedStream::psk_cipher(resolver, urn, mode)?)),
        };

        let inner = ImageStream::build(resolver, urn, mode, ObjectType::Encrypted, transform)?;
        if cipher == Cipher::Aes256CbcPsk && inner.chunk_size() % BLOCK_SIZE != 0 {
            return Err(Error::crypto(format!(
                "chunk size {} of {} is not a multiple of the cipher block size",
                inner.chunk_size(),
                urn
            )));
        }
        if inner.compression() != Compression::Stored {
            return Err(Error::crypto(format!(
                "encrypted stream {} must store its chunks uncompressed",
                urn
            )));
        }

        tracing::debug!(urn = %urn, ?mode, cipher = cipher.name(), "opened encrypted stream");
        Ok(Box::new(EncryptedStream { inner }))
    }

    fn psk_cipher(resolver: &Resolver, urn: &Urn, mode: Mode) -> Result<PskCipher> {
        let secret = resolver
            .resolve_bytes(urn, attrs::SECRET)
            .ok_or_else(|| Error::crypto(format!("no secret supplied for {}", urn)))?;

        let salt = match (resolver.resolve_bytes(urn, attrs::SALT), mode) {
            (Some(salt), _) => salt,
            (None, Mode::Write) => {
                let mut salt = vec![0u8; SALT_LEN];
                rand::thread_rng().fill_bytes(&mut salt);
                resolver.set(urn, attrs::SALT, salt.clone());
                salt
            }
            (None, Mode::Read) => {
                return Err(Error::MissingAttribute {
                    urn: urn.clone(),
                    attr: attrs::SALT,
                })
            }
        };

        let cipher = PskCipher::new(&secret, &salt);
        match (resolver.resolve_string(urn, attrs::KEY_CHECK), mode) {
            (Some(check), Mode::Read) if check != cipher.key_check() => {
                tracing::warn!(urn = %urn, "wrong secret for encrypted stream");
                return Err(Error::crypto(format!("secret does not match {}", urn)));
            }
            (_, Mode::Write) => resolver.set(urn, attrs::KEY_CHECK, cipher.key_check()),
            _ => {}
        }
        Ok(cipher)
    }

    /// Start a new encrypted stream in `volume` keyed by `secret`.
    pub fn create_in(resolver: &Resolver, volume: &Urn, secret: &[u8]) -> Result<Handle<EncryptedStream>> {
        resolver
            .create(ObjectType::Encrypted)
            .set(attrs::STORED, volume)
            .set(attrs::CIPHER, Cipher::Aes256CbcPsk.name())
            .set(attrs::SECRET, secret.to_vec())
            .finish_as::<EncryptedStream>()
    }

    pub fn chunk_size(&self) -> u64 {
        self.inner.chunk_size()
    }
}

impl Object for EncryptedStream {
    fn urn(&self) -> &Urn {
        self.inner.urn()
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::Encrypted
    }

    fn mode(&self) -> Mode {
        self.inner.mode()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }

    fn as_stream(&mut self) -> Option<&mut dyn Stream> {
        Some(self)
    }
}

impl Read for EncryptedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for EncryptedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Seek for EncryptedStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl Stream for EncryptedStream {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.inner.truncate(len)
    }
}
