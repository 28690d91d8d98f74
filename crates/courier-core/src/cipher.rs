//! Password-based file encryption
//!
//! Files are sealed with AES-GCM at one of three key strengths. The key is
//! derived from the password with Argon2id over a random per-file salt, and
//! the plaintext is processed in fixed-size segments so arbitrarily large
//! files never need to fit in memory.
//!
//! Layout of an encrypted file:
//!
//! ```text
//! "CRE1" | key bits u16 | m_cost u32 | t_cost u32 | p_cost u32 | salt[16] | nonce prefix[8]
//! sealed segment 0 | sealed segment 1 | ... | sealed final segment
//! ```
//!
//! All integers are big-endian. Segment `i` uses nonce `prefix || i` (u32)
//! and associated data `header || final_flag`. Every segment but the last
//! holds exactly [`CHUNK_SIZE`] plaintext bytes; the last is always shorter
//! (possibly empty), so truncation and reordering fail authentication.

use crate::CHUNK_SIZE;
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::NamedTempFile;
use thiserror::Error;

type Aes192Gcm = AesGcm<Aes192, U12>;

const MAGIC: &[u8; 4] = b"CRE1";
const SALT_LEN: usize = 16;
const NONCE_PREFIX_LEN: usize = 8;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 4 + 2 + 4 * 3 + SALT_LEN + NONCE_PREFIX_LEN;

/// Largest Argon2 memory cost accepted from a file header (1 GiB)
const MAX_M_COST_KIB: u32 = 1024 * 1024;
/// Largest Argon2 pass count accepted from a file header
const MAX_T_COST: u32 = 16;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("password must not be empty")]
    EmptyPassword,

    #[error("unsupported key length: {0} bits (expected 128, 192 or 256)")]
    UnsupportedKeyLength(u16),

    #[error("file was encrypted with a {found}-bit key, not {expected}-bit")]
    KeyLengthMismatch { expected: u16, found: u16 },

    #[error("not an encrypted file: {0}")]
    BadFormat(String),

    #[error("wrong password or corrupted data")]
    Authentication,

    #[error("encrypted file is truncated")]
    Truncated,

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("source and destination are the same file")]
    SamePath,

    #[error("file too large to encrypt")]
    TooLarge,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// AES key strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum KeyLength {
    Aes128,
    Aes192,
    Aes256,
}

impl KeyLength {
    pub const ALL: [KeyLength; 3] = [KeyLength::Aes128, KeyLength::Aes192, KeyLength::Aes256];

    pub fn bits(self) -> u16 {
        match self {
            KeyLength::Aes128 => 128,
            KeyLength::Aes192 => 192,
            KeyLength::Aes256 => 256,
        }
    }

    pub fn key_bytes(self) -> usize {
        usize::from(self.bits() / 8)
    }
}

impl TryFrom<u16> for KeyLength {
    type Error = CipherError;

    fn try_from(bits: u16) -> Result<Self, CipherError> {
        match bits {
            128 => Ok(KeyLength::Aes128),
            192 => Ok(KeyLength::Aes192),
            256 => Ok(KeyLength::Aes256),
            other => Err(CipherError::UnsupportedKeyLength(other)),
        }
    }
}

impl From<KeyLength> for u16 {
    fn from(key_length: KeyLength) -> u16 {
        key_length.bits()
    }
}

impl FromStr for KeyLength {
    type Err = CipherError;

    fn from_str(s: &str) -> Result<Self, CipherError> {
        let bits = s
            .trim()
            .parse::<u16>()
            .map_err(|_| CipherError::UnsupportedKeyLength(0))?;
        KeyLength::try_from(bits)
    }
}

impl fmt::Display for KeyLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AES-{}", self.bits())
    }
}

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub m_cost_kib: u32,
    /// Number of passes
    pub t_cost: u32,
    /// Degree of parallelism
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost_kib: Params::DEFAULT_M_COST,
            t_cost: Params::DEFAULT_T_COST,
            p_cost: Params::DEFAULT_P_COST,
        }
    }
}

/// Derive `key_length` worth of key bytes from a password.
///
/// Deterministic for a given (password, salt, key length, params).
pub fn derive_key(
    password: &str,
    salt: &[u8],
    key_length: KeyLength,
    params: &KdfParams,
) -> Result<Vec<u8>, CipherError> {
    let argon_params = Params::new(
        params.m_cost_kib,
        params.t_cost,
        params.p_cost,
        Some(key_length.key_bytes()),
    )
    .map_err(|e| CipherError::Kdf(e.to_string()))?;

    let mut key = vec![0u8; key_length.key_bytes()];
    Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params)
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| CipherError::Kdf(e.to_string()))?;
    Ok(key)
}

/// Which way a [`CipherRequest`] goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherOperation {
    Encrypt,
    Decrypt,
}

/// One file to encrypt or decrypt
#[derive(Clone)]
pub struct CipherRequest {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub password: String,
    pub key_length: KeyLength,
    pub operation: CipherOperation,
}

impl fmt::Debug for CipherRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherRequest")
            .field("source", &self.source)
            .field("dest", &self.dest)
            .field("password", &"<redacted>")
            .field("key_length", &self.key_length)
            .field("operation", &self.operation)
            .finish()
    }
}

/// File encryption capability.
///
/// Implementations must leave no destination file behind when they fail.
pub trait FileCipher: Send + Sync {
    fn encrypt(
        &self,
        source: &Path,
        dest: &Path,
        password: &str,
        key_length: KeyLength,
    ) -> Result<(), CipherError>;

    fn decrypt(
        &self,
        source: &Path,
        dest: &Path,
        password: &str,
        key_length: KeyLength,
    ) -> Result<(), CipherError>;

    /// Dispatch a request to `encrypt` or `decrypt`
    fn run(&self, request: &CipherRequest) -> Result<(), CipherError> {
        match request.operation {
            CipherOperation::Encrypt => self.encrypt(
                &request.source,
                &request.dest,
                &request.password,
                request.key_length,
            ),
            CipherOperation::Decrypt => self.decrypt(
                &request.source,
                &request.dest,
                &request.password,
                request.key_length,
            ),
        }
    }
}

/// Chunked AES-GCM with Argon2id key derivation
#[derive(Debug, Clone, Default)]
pub struct AesGcmCipher {
    kdf: KdfParams,
}

impl AesGcmCipher {
    pub fn new(kdf: KdfParams) -> Self {
        Self { kdf }
    }

    pub fn kdf(&self) -> &KdfParams {
        &self.kdf
    }
}

impl FileCipher for AesGcmCipher {
    fn encrypt(
        &self,
        source: &Path,
        dest: &Path,
        password: &str,
        key_length: KeyLength,
    ) -> Result<(), CipherError> {
        check_request(source, dest, password)?;
        check_kdf(&self.kdf)?;

        let input = File::open(source)?;
        let size = input.metadata()?.len();
        let mut input = BufReader::new(input);

        let mut salt = [0u8; SALT_LEN];
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce_prefix);

        let header = Header {
            key_length,
            kdf: self.kdf,
            salt,
            nonce_prefix,
        };
        let header_bytes = header.encode();
        let sealer = Sealer::new(key_length, &derive_key(password, &salt, key_length, &self.kdf)?)?;

        let mut output = PartialOutput::create(dest)?;
        output.write_all(&header_bytes)?;

        let mut plain = vec![0u8; CHUNK_SIZE];
        let mut remaining = size;
        let mut counter: u32 = 0;
        loop {
            let take = remaining.min(CHUNK_SIZE as u64) as usize;
            input.read_exact(&mut plain[..take])?;
            let is_final = take < CHUNK_SIZE;

            let sealed = sealer.seal(
                &header.nonce(counter),
                &associated_data(&header_bytes, is_final),
                &plain[..take],
            )?;
            output.write_all(&sealed)?;

            remaining -= take as u64;
            if is_final {
                break;
            }
            counter = counter.checked_add(1).ok_or(CipherError::TooLarge)?;
        }

        output.finish()?;
        tracing::debug!(
            "Encrypted {} -> {} ({}, {} bytes)",
            source.display(),
            dest.display(),
            key_length,
            size
        );
        Ok(())
    }

    fn decrypt(
        &self,
        source: &Path,
        dest: &Path,
        password: &str,
        key_length: KeyLength,
    ) -> Result<(), CipherError> {
        check_request(source, dest, password)?;

        let mut input = BufReader::new(File::open(source)?);
        let mut header_bytes = [0u8; HEADER_LEN];
        if read_full(&mut input, &mut header_bytes)? < HEADER_LEN {
            return Err(CipherError::BadFormat("header too short".to_string()));
        }
        let header = Header::decode(&header_bytes)?;
        if header.key_length != key_length {
            return Err(CipherError::KeyLengthMismatch {
                expected: key_length.bits(),
                found: header.key_length.bits(),
            });
        }

        let key = derive_key(password, &header.salt, key_length, &header.kdf)?;
        let sealer = Sealer::new(key_length, &key)?;

        let mut output = PartialOutput::create(dest)?;
        let mut sealed = vec![0u8; CHUNK_SIZE + TAG_LEN];
        let mut counter: u32 = 0;
        loop {
            let n = read_full(&mut input, &mut sealed)?;
            if n < TAG_LEN {
                return Err(CipherError::Truncated);
            }
            let is_final = n < sealed.len();

            let plain = sealer.open(
                &header.nonce(counter),
                &associated_data(&header_bytes, is_final),
                &sealed[..n],
            )?;
            output.write_all(&plain)?;

            if is_final {
                break;
            }
            counter = counter.checked_add(1).ok_or(CipherError::TooLarge)?;
        }

        output.finish()?;
        tracing::debug!("Decrypted {} -> {}", source.display(), dest.display());
        Ok(())
    }
}

fn check_request(source: &Path, dest: &Path, password: &str) -> Result<(), CipherError> {
    if password.is_empty() {
        return Err(CipherError::EmptyPassword);
    }
    if dest.exists() && std::fs::canonicalize(source)? == std::fs::canonicalize(dest)? {
        return Err(CipherError::SamePath);
    }
    Ok(())
}

/// Argon2 costs accepted from a header. Encryption checks its own settings
/// against the same bounds, or it would write files it cannot open.
fn check_kdf(kdf: &KdfParams) -> Result<(), CipherError> {
    if kdf.m_cost_kib > MAX_M_COST_KIB {
        return Err(CipherError::BadFormat(format!(
            "memory cost {} KiB is out of range",
            kdf.m_cost_kib
        )));
    }
    if kdf.t_cost > MAX_T_COST {
        return Err(CipherError::BadFormat(format!(
            "time cost {} is out of range",
            kdf.t_cost
        )));
    }
    Ok(())
}

fn associated_data(header: &[u8], is_final: bool) -> Vec<u8> {
    let mut aad = Vec::with_capacity(header.len() + 1);
    aad.extend_from_slice(header);
    aad.push(u8::from(is_final));
    aad
}

/// Read until `buf` is full or the input ends
fn read_full<R: Read>(input: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

struct Header {
    key_length: KeyLength,
    kdf: KdfParams,
    salt: [u8; SALT_LEN],
    nonce_prefix: [u8; NONCE_PREFIX_LEN],
}

impl Header {
    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(MAGIC);
        out[4..6].copy_from_slice(&self.key_length.bits().to_be_bytes());
        out[6..10].copy_from_slice(&self.kdf.m_cost_kib.to_be_bytes());
        out[10..14].copy_from_slice(&self.kdf.t_cost.to_be_bytes());
        out[14..18].copy_from_slice(&self.kdf.p_cost.to_be_bytes());
        out[18..34].copy_from_slice(&self.salt);
        out[34..42].copy_from_slice(&self.nonce_prefix);
        out
    }

    fn decode(bytes: &[u8; HEADER_LEN]) -> Result<Self, CipherError> {
        if &bytes[0..4] != MAGIC {
            return Err(CipherError::BadFormat("missing magic".to_string()));
        }
        let be_u32 = |at: usize| u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);

        let key_length = KeyLength::try_from(u16::from_be_bytes([bytes[4], bytes[5]]))?;
        let kdf = KdfParams {
            m_cost_kib: be_u32(6),
            t_cost: be_u32(10),
            p_cost: be_u32(14),
        };
        check_kdf(&kdf)?;

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&bytes[18..34]);
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        nonce_prefix.copy_from_slice(&bytes[34..42]);

        Ok(Self {
            key_length,
            kdf,
            salt,
            nonce_prefix,
        })
    }

    fn nonce(&self, counter: u32) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..NONCE_PREFIX_LEN].copy_from_slice(&self.nonce_prefix);
        nonce[NONCE_PREFIX_LEN..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }
}

/// AES-GCM at the selected strength
enum Sealer {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

impl Sealer {
    fn new(key_length: KeyLength, key: &[u8]) -> Result<Self, CipherError> {
        let invalid = |_| CipherError::Kdf(format!("derived key is not {} bits", key_length.bits()));
        Ok(match key_length {
            KeyLength::Aes128 => Sealer::Aes128(Aes128Gcm::new_from_slice(key).map_err(invalid)?),
            KeyLength::Aes192 => Sealer::Aes192(Aes192Gcm::new_from_slice(key).map_err(invalid)?),
            KeyLength::Aes256 => Sealer::Aes256(Aes256Gcm::new_from_slice(key).map_err(invalid)?),
        })
    }

    fn seal(&self, nonce: &[u8; 12], aad: &[u8], plain: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = Nonce::<U12>::from_slice(nonce);
        let payload = Payload { msg: plain, aad };
        let sealed = match self {
            Sealer::Aes128(c) => c.encrypt(nonce, payload),
            Sealer::Aes192(c) => c.encrypt(nonce, payload),
            Sealer::Aes256(c) => c.encrypt(nonce, payload),
        };
        // Only fails for inputs beyond GCM's length limit
        sealed.map_err(|_| CipherError::TooLarge)
    }

    fn open(&self, nonce: &[u8; 12], aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = Nonce::<U12>::from_slice(nonce);
        let payload = Payload { msg: sealed, aad };
        let opened = match self {
            Sealer::Aes128(c) => c.decrypt(nonce, payload),
            Sealer::Aes192(c) => c.decrypt(nonce, payload),
            Sealer::Aes256(c) => c.decrypt(nonce, payload),
        };
        opened.map_err(|_| CipherError::Authentication)
    }
}

/// Output written to a scratch file beside the destination and moved over
/// it only by `finish`. Dropping it unfinished removes the scratch file and
/// leaves any existing destination untouched.
struct PartialOutput {
    dest: PathBuf,
    writer: BufWriter<NamedTempFile>,
}

impl PartialOutput {
    fn create(dest: &Path) -> Result<Self, CipherError> {
        let dir = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let scratch = tempfile::Builder::new()
            .prefix(".partial-")
            .tempfile_in(dir)?;
        Ok(Self {
            dest: dest.to_path_buf(),
            writer: BufWriter::new(scratch),
        })
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), CipherError> {
        Ok(self.writer.write_all(bytes)?)
    }

    fn finish(self) -> Result<(), CipherError> {
        let scratch = self.writer.into_inner().map_err(|e| e.into_error())?;
        scratch.as_file().sync_all()?;
        scratch.persist(&self.dest).map_err(|e| e.error)?;
        Ok(())
    }
}
