//! ECMA-376 "Standard" encryption (binary `EncryptionInfo`, Office 2007-era).
//!
//! Fixed AES-ECB with SHA-1 iterated key derivation; the profile carries no
//! data-integrity check beyond the password verifier.

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::crypto::{
    aes_ecb_decrypt_in_place, aes_ecb_encrypt_in_place, HashAlgorithm, StandardKeyDeriver,
};
use crate::error::OffcryptoError;
use crate::util::{checked_vec_len, ct_eq, decode_utf16le_nul_terminated, utf16le_bytes, Reader};

// CryptoAPI algorithm identifiers.
pub(crate) const CALG_AES_128: u32 = 0x0000_660E;
pub(crate) const CALG_AES_192: u32 = 0x0000_660F;
pub(crate) const CALG_AES_256: u32 = 0x0000_6610;
pub(crate) const CALG_RC4: u32 = 0x0000_6801;
pub(crate) const CALG_SHA1: u32 = 0x0000_8004;

// EncryptionVersionInfo / EncryptionHeader flag bits.
pub(crate) const FLAG_CRYPTOAPI: u32 = 0x0000_0004;
pub(crate) const FLAG_EXTERNAL: u32 = 0x0000_0010;
pub(crate) const FLAG_AES: u32 = 0x0000_0020;

const PROV_RSA_AES: u32 = 0x0000_0018;

/// Exact CSP literal expected by Office readers (stored NUL-terminated).
const CSP_NAME: &str = "Microsoft Enhanced RSA and AES Cryptographic Provider";

/// Number of verifier-hash bytes actually compared during validation.
const VERIFIER_COMPARE_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardEncryptionHeader {
    pub flags: u32,
    pub size_extra: u32,
    pub alg_id: u32,
    pub alg_id_hash: u32,
    pub key_bits: u32,
    pub provider_type: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    pub csp_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardEncryptionVerifier {
    pub salt: Vec<u8>,
    pub encrypted_verifier: [u8; 16],
    pub verifier_hash_size: u32,
    pub encrypted_verifier_hash: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardEncryptionInfo {
    pub version_major: u16,
    pub version_minor: u16,
    pub flags: u32,
    pub header: StandardEncryptionHeader,
    pub verifier: StandardEncryptionVerifier,
}

/// Parse a Standard (binary) `EncryptionInfo` stream, including the 8-byte
/// version header.
///
/// Unsupported algorithm parameters are rejected here, before any key
/// derivation or decryption is attempted.
pub(crate) fn parse_standard_encryption_info(
    bytes: &[u8],
) -> Result<StandardEncryptionInfo, OffcryptoError> {
    let mut r = Reader::new(bytes);
    let version_major = r.read_u16_le("EncryptionVersionInfo.major")?;
    let version_minor = r.read_u16_le("EncryptionVersionInfo.minor")?;
    let flags = r.read_u32_le("EncryptionVersionInfo.flags")?;

    if flags & FLAG_EXTERNAL != 0 {
        return Err(OffcryptoError::UnsupportedAlgorithm(
            "external (CryptoAPI provider) encryption".to_string(),
        ));
    }

    let header_size = r.read_u32_le("EncryptionInfo.headerSize")? as usize;
    // The fixed EncryptionHeader prefix is 8 DWORDs; cap the size well above
    // any real CSP name so hostile inputs cannot drive huge reads.
    const MIN_HEADER_SIZE: usize = 8 * 4;
    const MAX_HEADER_SIZE: usize = 1024 * 1024;
    if !(MIN_HEADER_SIZE..=MAX_HEADER_SIZE).contains(&header_size) {
        return Err(OffcryptoError::MalformedEnvelope(
            "EncryptionInfo.headerSize is out of bounds".to_string(),
        ));
    }

    let header_bytes = r.take(header_size, "EncryptionHeader")?;
    let mut hr = Reader::new(header_bytes);
    let header = StandardEncryptionHeader {
        flags: hr.read_u32_le("EncryptionHeader.flags")?,
        size_extra: hr.read_u32_le("EncryptionHeader.sizeExtra")?,
        alg_id: hr.read_u32_le("EncryptionHeader.algId")?,
        alg_id_hash: hr.read_u32_le("EncryptionHeader.algIdHash")?,
        key_bits: hr.read_u32_le("EncryptionHeader.keySize")?,
        provider_type: hr.read_u32_le("EncryptionHeader.providerType")?,
        reserved1: hr.read_u32_le("EncryptionHeader.reserved1")?,
        reserved2: hr.read_u32_le("EncryptionHeader.reserved2")?,
        csp_name: decode_utf16le_nul_terminated(hr.remaining())?,
    };

    if header.flags & FLAG_EXTERNAL != 0 {
        return Err(OffcryptoError::UnsupportedAlgorithm(
            "external (CryptoAPI provider) encryption".to_string(),
        ));
    }

    let expected_key_bits = match header.alg_id {
        CALG_AES_128 => 128,
        CALG_AES_192 => 192,
        CALG_AES_256 => 256,
        CALG_RC4 => {
            return Err(OffcryptoError::UnsupportedAlgorithm(
                "RC4 (legacy CryptoAPI) encryption".to_string(),
            ))
        }
        other => {
            return Err(OffcryptoError::UnsupportedAlgorithm(format!(
                "algId {other:#010x}"
            )))
        }
    };
    if header.key_bits != expected_key_bits {
        return Err(OffcryptoError::UnsupportedAlgorithm(format!(
            "keySize {} does not match algId {:#010x}",
            header.key_bits, header.alg_id
        )));
    }
    if header.alg_id_hash != CALG_SHA1 {
        return Err(OffcryptoError::UnsupportedAlgorithm(format!(
            "algIdHash {:#010x}",
            header.alg_id_hash
        )));
    }

    let salt_size = r.read_u32_le("EncryptionVerifier.saltSize")? as usize;
    if salt_size != 16 {
        return Err(OffcryptoError::MalformedEnvelope(
            "EncryptionVerifier.saltSize must be 16".to_string(),
        ));
    }
    let salt = r.take(16, "EncryptionVerifier.salt")?.to_vec();

    let mut encrypted_verifier = [0u8; 16];
    encrypted_verifier.copy_from_slice(r.take(16, "EncryptionVerifier.encryptedVerifier")?);

    let verifier_hash_size = r.read_u32_le("EncryptionVerifier.verifierHashSize")?;
    // Office writes the SHA-1 length (20); this writer records the padded
    // ciphertext length (32). Accept both.
    if verifier_hash_size != 20 && verifier_hash_size != 32 {
        return Err(OffcryptoError::MalformedEnvelope(
            "EncryptionVerifier.verifierHashSize must be 20 or 32".to_string(),
        ));
    }
    // The hash ciphertext is padded to the AES block boundary: 32 bytes.
    let encrypted_verifier_hash = r
        .take(32, "EncryptionVerifier.encryptedVerifierHash")?
        .to_vec();

    Ok(StandardEncryptionInfo {
        version_major,
        version_minor,
        flags,
        header,
        verifier: StandardEncryptionVerifier {
            salt,
            encrypted_verifier,
            verifier_hash_size,
            encrypted_verifier_hash,
        },
    })
}

fn alg_id_for_key_bits(key_bits: u32) -> Result<u32, OffcryptoError> {
    match key_bits {
        128 => Ok(CALG_AES_128),
        192 => Ok(CALG_AES_192),
        256 => Ok(CALG_AES_256),
        other => Err(OffcryptoError::UnsupportedAlgorithm(format!(
            "Standard encryption requires AES-128/192/256, got {other}-bit key"
        ))),
    }
}

/// Serialise a Standard `EncryptionInfo` stream for the given salt and
/// verifier ciphertexts.
fn build_encryption_info(
    key_bits: u32,
    salt: &[u8; 16],
    encrypted_verifier: &[u8; 16],
    encrypted_verifier_hash: &[u8; 32],
) -> Result<Vec<u8>, OffcryptoError> {
    let alg_id = alg_id_for_key_bits(key_bits)?;
    let flags = FLAG_CRYPTOAPI | FLAG_AES;

    let mut csp_name = utf16le_bytes(CSP_NAME);
    csp_name.extend_from_slice(&[0, 0]);
    while csp_name.len() % 4 != 0 {
        csp_name.push(0);
    }

    let mut header = Vec::new();
    header.extend_from_slice(&flags.to_le_bytes());
    header.extend_from_slice(&0u32.to_le_bytes()); // sizeExtra
    header.extend_from_slice(&alg_id.to_le_bytes());
    header.extend_from_slice(&CALG_SHA1.to_le_bytes());
    header.extend_from_slice(&key_bits.to_le_bytes());
    header.extend_from_slice(&PROV_RSA_AES.to_le_bytes());
    header.extend_from_slice(&0u32.to_le_bytes()); // reserved1
    header.extend_from_slice(&0u32.to_le_bytes()); // reserved2
    header.extend_from_slice(&csp_name);

    let mut out = Vec::new();
    out.extend_from_slice(&4u16.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&(header.len() as u32).to_le_bytes());
    out.extend_from_slice(&header);

    out.extend_from_slice(&16u32.to_le_bytes()); // saltSize
    out.extend_from_slice(salt);
    out.extend_from_slice(encrypted_verifier);
    out.extend_from_slice(&(encrypted_verifier_hash.len() as u32).to_le_bytes());
    out.extend_from_slice(encrypted_verifier_hash);

    Ok(out)
}

/// Encrypt a package with the Standard profile.
///
/// Returns the `EncryptionInfo` and `EncryptedPackage` stream bytes.
pub(crate) fn encrypt_standard_encrypted_package(
    package: &[u8],
    password: &str,
    key_bits: u32,
) -> Result<(Vec<u8>, Vec<u8>), OffcryptoError> {
    // Reject unsupported parameters before generating any key material.
    alg_id_for_key_bits(key_bits)?;

    let mut salt = [0u8; 16];
    let mut verifier = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut verifier);

    let deriver = StandardKeyDeriver::new(HashAlgorithm::Sha1, key_bits, &salt, password);
    let key = deriver.derive_key_for_block(0)?;

    // The verifier ciphertext is stored at the cleartext length (16 bytes);
    // the verifier hash is stored at the padded AES length (32 bytes).
    let mut encrypted_verifier = verifier;
    aes_ecb_encrypt_in_place(&key, &mut encrypted_verifier)?;

    let verifier_hash = HashAlgorithm::Sha1.digest(&verifier);
    let mut encrypted_verifier_hash = [0u8; 32];
    encrypted_verifier_hash[..verifier_hash.len()].copy_from_slice(&verifier_hash);
    aes_ecb_encrypt_in_place(&key, &mut encrypted_verifier_hash)?;

    let encryption_info =
        build_encryption_info(key_bits, &salt, &encrypted_verifier, &encrypted_verifier_hash)?;

    let mut encrypted_package = Vec::with_capacity(8 + package.len() + 16);
    encrypted_package.extend_from_slice(&(package.len() as u64).to_le_bytes());
    let body_start = encrypted_package.len();
    encrypted_package.extend_from_slice(package);
    while (encrypted_package.len() - body_start) % 16 != 0 {
        encrypted_package.push(0);
    }
    aes_ecb_encrypt_in_place(&key, &mut encrypted_package[body_start..])?;

    Ok((encryption_info, encrypted_package))
}

/// Verify the password against the `EncryptionVerifier` fields.
fn verify_password(info: &StandardEncryptionInfo, key: &[u8]) -> Result<(), OffcryptoError> {
    let mut verifier_plain = info.verifier.encrypted_verifier;
    aes_ecb_decrypt_in_place(key, &mut verifier_plain)?;

    let mut hash_plain = info.verifier.encrypted_verifier_hash.clone();
    aes_ecb_decrypt_in_place(key, &mut hash_plain)?;

    let verifier_hash = Zeroizing::new(HashAlgorithm::Sha1.digest(&verifier_plain));
    if hash_plain.len() < VERIFIER_COMPARE_LEN {
        return Err(OffcryptoError::InvalidPassword);
    }
    if !ct_eq(
        &verifier_hash[..VERIFIER_COMPARE_LEN],
        &hash_plain[..VERIFIER_COMPARE_LEN],
    ) {
        return Err(OffcryptoError::InvalidPassword);
    }
    Ok(())
}

/// Decrypt a Standard `EncryptedPackage` stream.
pub(crate) fn decrypt_standard_encrypted_package(
    info: &StandardEncryptionInfo,
    encrypted_package: &[u8],
    password: &str,
) -> Result<Vec<u8>, OffcryptoError> {
    let mut r = Reader::new(encrypted_package);
    let total_size = r.read_u64_le("EncryptedPackage.originalSize")?;
    let expected_len = checked_vec_len(total_size)?;
    let ciphertext = r.remaining();

    if ciphertext.len() % 16 != 0 {
        return Err(OffcryptoError::MalformedEnvelope(
            "EncryptedPackage ciphertext is not AES-block aligned".to_string(),
        ));
    }
    if expected_len > ciphertext.len() {
        return Err(OffcryptoError::MalformedEnvelope(format!(
            "declared package size {total_size} exceeds ciphertext length {}",
            ciphertext.len()
        )));
    }

    let deriver = StandardKeyDeriver::new(
        HashAlgorithm::Sha1,
        info.header.key_bits,
        &info.verifier.salt,
        password,
    );
    let key = deriver.derive_key_for_block(0)?;
    verify_password(info, &key)?;

    let mut plain = ciphertext.to_vec();
    aes_ecb_decrypt_in_place(&key, &mut plain)?;
    plain.truncate(expected_len);
    Ok(plain)
}
