//! Encrypted OOXML container codec (MS-OFFCRYPTO §2.3.4).
//!
//! Reads and writes the OLE/CFB encryption envelope used by modern Office
//! spreadsheet files:
//! - "Agile" encryption (XML descriptor, Office 2010+): parameterised
//!   cipher/hash/chaining, segmented body, HMAC data integrity
//! - "Standard" encryption (binary descriptor, Office 2007-era): fixed
//!   AES-ECB with SHA-1 iterated key derivation
//!
//! The package payload is treated as an opaque byte stream; callers hand in
//! raw OOXML ZIP bytes and get them back byte-for-byte. Verifier and HMAC
//! comparisons are constant-time.

mod agile;
mod crypto;
mod dataspaces;
mod error;
mod protection;
mod spool;
mod standard;
mod util;

use std::io::{Cursor, Read, Seek, SeekFrom, Write};

pub use crate::agile::{
    AgileDataIntegrity, AgileEncryptionInfo, AgileKeyData, AgilePasswordKeyEncryptor,
};
pub use crate::crypto::{ChainingMode, CipherAlgorithm, HashAlgorithm, DEFAULT_PASSWORD};
pub use crate::error::OffcryptoError;
pub use crate::protection::sheet_protection_hash;
pub use crate::standard::{
    StandardEncryptionHeader, StandardEncryptionInfo, StandardEncryptionVerifier,
};

const OLE_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

const ENCRYPTION_INFO_STREAM: &str = "EncryptionInfo";
const ENCRYPTED_PACKAGE_STREAM: &str = "EncryptedPackage";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EncryptionScheme {
    Agile,
    Standard,
}

/// Parameters for [`encrypt_package_to_ole`].
#[derive(Debug, Clone)]
pub struct EncryptOptions {
    pub scheme: EncryptionScheme,
    pub key_bits: u32,
    pub hash_algorithm: HashAlgorithm,
    pub cipher_chaining: ChainingMode,
    pub spin_count: u32,
}

impl Default for EncryptOptions {
    fn default() -> Self {
        Self {
            scheme: EncryptionScheme::Agile,
            key_bits: 256,
            hash_algorithm: HashAlgorithm::Sha512,
            cipher_chaining: ChainingMode::Cbc,
            spin_count: 100_000,
        }
    }
}

/// Parsed `EncryptionInfo` stream contents.
#[derive(Debug, Clone)]
pub enum EncryptionInfo {
    Agile(AgileEncryptionInfo),
    Standard(StandardEncryptionInfo),
}

/// Parse an `EncryptionInfo` stream, dispatching on the version header:
/// version 4.4 is the Agile XML descriptor, `minor == 2` (major 2/3/4 in the
/// wild) is the Standard binary descriptor.
pub fn parse_encryption_info(bytes: &[u8]) -> Result<EncryptionInfo, OffcryptoError> {
    let mut r = util::Reader::new(bytes);
    let major = r.read_u16_le("EncryptionVersionInfo.major")?;
    let minor = r.read_u16_le("EncryptionVersionInfo.minor")?;
    let flags = r.read_u32_le("EncryptionVersionInfo.flags")?;

    if (major, minor) == (4, 4) {
        if flags != 0x40 {
            log::warn!("Agile EncryptionInfo has unexpected flags {flags:#x}");
        }
        return Ok(EncryptionInfo::Agile(agile::parse_agile_encryption_info(
            bytes,
        )?));
    }
    if minor == 2 && matches!(major, 2 | 3 | 4) {
        return Ok(EncryptionInfo::Standard(
            standard::parse_standard_encryption_info(bytes)?,
        ));
    }
    Err(OffcryptoError::UnsupportedAlgorithm(format!(
        "EncryptionInfo version {major}.{minor}"
    )))
}

/// Returns true if the bytes look like an OLE/CFB container holding an
/// Office-encrypted OOXML package (`EncryptionInfo` + `EncryptedPackage`).
pub fn is_encrypted_ooxml_ole(bytes: &[u8]) -> bool {
    if bytes.len() < OLE_MAGIC.len() || bytes[..OLE_MAGIC.len()] != OLE_MAGIC {
        return false;
    }
    let Ok(mut ole) = cfb::CompoundFile::open(Cursor::new(bytes)) else {
        return false;
    };
    stream_exists(&mut ole, ENCRYPTION_INFO_STREAM) && stream_exists(&mut ole, ENCRYPTED_PACKAGE_STREAM)
}

/// Encrypt a raw OOXML package into an Office `EncryptedPackage` OLE/CFB
/// wrapper and return the container bytes.
pub fn encrypt_package_to_ole(
    package: &[u8],
    password: &str,
    opts: &EncryptOptions,
) -> Result<Vec<u8>, OffcryptoError> {
    let backing = encrypt_package_to_writer(
        &mut Cursor::new(package),
        package.len() as u64,
        password,
        opts,
        Cursor::new(Vec::new()),
    )?;
    Ok(backing.into_inner())
}

/// Encrypt a package read from `package` (exactly `package_len` bytes) into
/// an OLE/CFB container written to `backing`.
///
/// The root storage receives the `EncryptionInfo` and `EncryptedPackage`
/// streams plus the fixed `\x06DataSpaces` tree. For the Agile profile the
/// body is spooled segment by segment, so the cleartext does not need to fit
/// in memory; the Standard body is small enough to buffer.
pub fn encrypt_package_to_writer<R, F>(
    package: &mut R,
    package_len: u64,
    password: &str,
    opts: &EncryptOptions,
    backing: F,
) -> Result<F, OffcryptoError>
where
    R: Read,
    F: Read + Write + Seek,
{
    // Unsupported parameter combinations are rejected before any key
    // material is generated.
    validate_options(opts)?;

    let mut ole = cfb::CompoundFile::create(backing)?;
    dataspaces::write_data_spaces(&mut ole)?;

    match opts.scheme {
        EncryptionScheme::Standard => {
            let mut buffered = Vec::new();
            package.take(package_len).read_to_end(&mut buffered)?;
            if buffered.len() as u64 != package_len {
                return Err(OffcryptoError::MalformedEnvelope(
                    "package stream ended before the declared length".to_string(),
                ));
            }
            let (info, body) =
                standard::encrypt_standard_encrypted_package(&buffered, password, opts.key_bits)?;
            ole.create_stream(ENCRYPTION_INFO_STREAM)?.write_all(&info)?;
            ole.create_stream(ENCRYPTED_PACKAGE_STREAM)?.write_all(&body)?;
        }
        EncryptionScheme::Agile => {
            let (info, mut body) =
                agile::encrypt_agile_encrypted_package(package, package_len, password, opts)?;
            ole.create_stream(ENCRYPTION_INFO_STREAM)?.write_all(&info)?;
            body.rewind()?;
            let mut stream = ole.create_stream(ENCRYPTED_PACKAGE_STREAM)?;
            std::io::copy(&mut body, &mut stream)?;
            stream.flush()?;
        }
    }

    ole.flush()?;
    Ok(ole.into_inner())
}

/// Decrypt an Office-encrypted OOXML OLE/CFB container and return the raw
/// package bytes.
pub fn decrypt_encrypted_package_ole(
    bytes: &[u8],
    password: &str,
) -> Result<Vec<u8>, OffcryptoError> {
    decrypt_encrypted_package_from(Cursor::new(bytes), password)
}

/// Decrypt from any seekable source (file, memory map, ...).
pub fn decrypt_encrypted_package_from<R: Read + Seek>(
    mut reader: R,
    password: &str,
) -> Result<Vec<u8>, OffcryptoError> {
    reader.seek(SeekFrom::Start(0))?;
    let mut magic = [0u8; 8];
    if reader.read_exact(&mut magic).is_err() || magic != OLE_MAGIC {
        return Err(OffcryptoError::NotEncryptedPackage);
    }
    reader.seek(SeekFrom::Start(0))?;

    let mut ole = cfb::CompoundFile::open(reader).map_err(|e| {
        OffcryptoError::MalformedEnvelope(format!("invalid compound file: {e}"))
    })?;

    let encryption_info = read_stream(&mut ole, ENCRYPTION_INFO_STREAM)?;
    let encrypted_package = read_stream(&mut ole, ENCRYPTED_PACKAGE_STREAM)?;

    decrypt_streams(&encryption_info, &encrypted_package, password)
}

/// Decrypt from the raw `EncryptionInfo` and `EncryptedPackage` stream
/// bytes, already extracted from the OLE wrapper.
pub fn decrypt_streams(
    encryption_info: &[u8],
    encrypted_package: &[u8],
    password: &str,
) -> Result<Vec<u8>, OffcryptoError> {
    match parse_encryption_info(encryption_info)? {
        EncryptionInfo::Agile(info) => {
            agile::decrypt_agile_encrypted_package(&info, encrypted_package, password)
        }
        EncryptionInfo::Standard(info) => {
            standard::decrypt_standard_encrypted_package(&info, encrypted_package, password)
        }
    }
}

fn validate_options(opts: &EncryptOptions) -> Result<(), OffcryptoError> {
    if !matches!(opts.key_bits, 128 | 192 | 256) {
        return Err(OffcryptoError::UnsupportedAlgorithm(format!(
            "AES key size {} bits",
            opts.key_bits
        )));
    }
    if opts.scheme == EncryptionScheme::Standard && opts.hash_algorithm != HashAlgorithm::Sha1 {
        return Err(OffcryptoError::UnsupportedAlgorithm(format!(
            "Standard encryption is fixed to SHA1, got {}",
            opts.hash_algorithm.as_ooxml_name()
        )));
    }
    Ok(())
}

fn stream_exists<R: Read + Seek>(ole: &mut cfb::CompoundFile<R>, name: &str) -> bool {
    ole.open_stream(name).is_ok()
}

fn read_stream<R: Read + Seek>(
    ole: &mut cfb::CompoundFile<R>,
    name: &str,
) -> Result<Vec<u8>, OffcryptoError> {
    let mut stream = ole.open_stream(name).map_err(|_| {
        OffcryptoError::MalformedEnvelope(format!("missing {name} stream"))
    })?;
    let mut out = Vec::new();
    stream.read_to_end(&mut out)?;
    Ok(out)
}
