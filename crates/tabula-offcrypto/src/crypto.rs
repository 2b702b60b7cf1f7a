//! Cryptographic primitives for the MS-OFFCRYPTO container codec.
//!
//! Algorithm selection is enum-dispatched: [`HashAlgorithm`],
//! [`CipherAlgorithm`] and [`ChainingMode`] are small tagged variants that
//! construct the concrete RustCrypto cipher/hash on demand.

use aes::{Aes128, Aes192, Aes256};
use cipher::block_padding::NoPadding;
use cipher::generic_array::GenericArray;
use cipher::{
    AsyncStreamCipher, BlockCipher, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut,
    InnerIvInit, KeyInit,
};
use des::{Des, TdesEde2, TdesEde3};
use hmac::{Hmac, Mac};
use md5::Md5;
use rc2::Rc2;
use ripemd::Ripemd160;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::io::Read;
use zeroize::Zeroizing;

use crate::error::OffcryptoError;

/// Password substituted for the empty password (legacy Excel default).
pub const DEFAULT_PASSWORD: &str = "VelvetSweatshop";

/// Spin count fixed by the Standard profile (CryptoAPI).
pub(crate) const STANDARD_SPIN_COUNT: u32 = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
    Ripemd160,
}

impl HashAlgorithm {
    pub fn as_ooxml_name(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "MD5",
            HashAlgorithm::Sha1 => "SHA1",
            HashAlgorithm::Sha256 => "SHA256",
            HashAlgorithm::Sha384 => "SHA384",
            HashAlgorithm::Sha512 => "SHA512",
            HashAlgorithm::Ripemd160 => "RIPEMD-160",
        }
    }

    pub(crate) fn from_name(name: &str) -> Result<Self, OffcryptoError> {
        match name.trim() {
            "MD5" | "MD-5" => Ok(HashAlgorithm::Md5),
            "SHA1" | "SHA-1" => Ok(HashAlgorithm::Sha1),
            "SHA256" | "SHA-256" => Ok(HashAlgorithm::Sha256),
            "SHA384" | "SHA-384" => Ok(HashAlgorithm::Sha384),
            "SHA512" | "SHA-512" => Ok(HashAlgorithm::Sha512),
            "RIPEMD-160" | "RIPEMD160" => Ok(HashAlgorithm::Ripemd160),
            other => Err(OffcryptoError::UnsupportedAlgorithm(format!(
                "unsupported hashAlgorithm {other}"
            ))),
        }
    }

    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Md5 => 16,
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
            HashAlgorithm::Ripemd160 => 20,
        }
    }

    pub(crate) fn block_len(&self) -> usize {
        // Hash block sizes in bytes; SHA-384/512 use 128-byte blocks, the rest 64.
        match self {
            HashAlgorithm::Sha384 | HashAlgorithm::Sha512 => 128,
            _ => 64,
        }
    }

    pub(crate) fn digest(&self, data: &[u8]) -> Vec<u8> {
        fn one<D: Digest>(data: &[u8]) -> Vec<u8> {
            D::digest(data).to_vec()
        }
        match self {
            HashAlgorithm::Md5 => one::<Md5>(data),
            HashAlgorithm::Sha1 => one::<Sha1>(data),
            HashAlgorithm::Sha256 => one::<Sha256>(data),
            HashAlgorithm::Sha384 => one::<Sha384>(data),
            HashAlgorithm::Sha512 => one::<Sha512>(data),
            HashAlgorithm::Ripemd160 => one::<Ripemd160>(data),
        }
    }

    pub(crate) fn digest_two(&self, a: &[u8], b: &[u8]) -> Vec<u8> {
        fn two<D: Digest>(a: &[u8], b: &[u8]) -> Vec<u8> {
            D::new().chain_update(a).chain_update(b).finalize().to_vec()
        }
        match self {
            HashAlgorithm::Md5 => two::<Md5>(a, b),
            HashAlgorithm::Sha1 => two::<Sha1>(a, b),
            HashAlgorithm::Sha256 => two::<Sha256>(a, b),
            HashAlgorithm::Sha384 => two::<Sha384>(a, b),
            HashAlgorithm::Sha512 => two::<Sha512>(a, b),
            HashAlgorithm::Ripemd160 => two::<Ripemd160>(a, b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    Aes,
    Des,
    TripleDes,
    TripleDes112,
    Rc2,
}

impl CipherAlgorithm {
    pub fn as_ooxml_name(&self) -> &'static str {
        match self {
            CipherAlgorithm::Aes => "AES",
            CipherAlgorithm::Des => "DES",
            CipherAlgorithm::TripleDes => "3DES",
            CipherAlgorithm::TripleDes112 => "3DES_112",
            CipherAlgorithm::Rc2 => "RC2",
        }
    }

    pub(crate) fn from_name(name: &str) -> Result<Self, OffcryptoError> {
        match name.trim() {
            "AES" => Ok(CipherAlgorithm::Aes),
            "DES" => Ok(CipherAlgorithm::Des),
            "3DES" | "DES3" => Ok(CipherAlgorithm::TripleDes),
            "3DES_112" => Ok(CipherAlgorithm::TripleDes112),
            "RC2" => Ok(CipherAlgorithm::Rc2),
            other => Err(OffcryptoError::UnsupportedAlgorithm(format!(
                "unsupported cipherAlgorithm {other}"
            ))),
        }
    }

    pub fn block_len(&self) -> usize {
        match self {
            CipherAlgorithm::Aes => 16,
            _ => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainingMode {
    /// Cipher block chaining (`ChainingModeCBC`).
    Cbc,
    /// Full-block cipher feedback (`ChainingModeCFB`).
    Cfb,
}

impl ChainingMode {
    pub fn as_ooxml_name(&self) -> &'static str {
        match self {
            ChainingMode::Cbc => "ChainingModeCBC",
            ChainingMode::Cfb => "ChainingModeCFB",
        }
    }

    pub(crate) fn from_name(name: &str) -> Result<Self, OffcryptoError> {
        match name.trim() {
            "ChainingModeCBC" => Ok(ChainingMode::Cbc),
            "ChainingModeCFB" => Ok(ChainingMode::Cfb),
            other => Err(OffcryptoError::UnsupportedAlgorithm(format!(
                "unsupported cipherChaining {other}"
            ))),
        }
    }
}

/// Encode the password as UTF-16LE without BOM or terminator.
///
/// An empty password is substituted with the legacy Excel default
/// (`"VelvetSweatshop"`) before encoding; this applies to both profiles.
pub(crate) fn password_to_utf16le(password: &str) -> Zeroizing<Vec<u8>> {
    let password = if password.is_empty() {
        DEFAULT_PASSWORD
    } else {
        password
    };
    let mut out = Vec::with_capacity(password.len() * 2);
    for cu in password.encode_utf16() {
        out.extend_from_slice(&cu.to_le_bytes());
    }
    Zeroizing::new(out)
}

/// `H(salt || password)` iterated `spin_count` times as
/// `h_{i+1} = H(u32le(i) || h_i)`.
pub(crate) fn hash_password(
    hash_alg: HashAlgorithm,
    salt: &[u8],
    password_utf16le: &[u8],
    spin_count: u32,
) -> Zeroizing<Vec<u8>> {
    fn spin<D: Digest>(salt: &[u8], password: &[u8], spin_count: u32) -> Vec<u8> {
        let mut h = D::new().chain_update(salt).chain_update(password).finalize();
        for i in 0..spin_count {
            h = D::new().chain_update(i.to_le_bytes()).chain_update(&h).finalize();
        }
        h.to_vec()
    }
    Zeroizing::new(match hash_alg {
        HashAlgorithm::Md5 => spin::<Md5>(salt, password_utf16le, spin_count),
        HashAlgorithm::Sha1 => spin::<Sha1>(salt, password_utf16le, spin_count),
        HashAlgorithm::Sha256 => spin::<Sha256>(salt, password_utf16le, spin_count),
        HashAlgorithm::Sha384 => spin::<Sha384>(salt, password_utf16le, spin_count),
        HashAlgorithm::Sha512 => spin::<Sha512>(salt, password_utf16le, spin_count),
        HashAlgorithm::Ripemd160 => spin::<Ripemd160>(salt, password_utf16le, spin_count),
    })
}

/// Truncate `bytes` to `n`, or right-pad with `fill` if shorter.
pub(crate) fn fix_hash_size(bytes: &[u8], n: usize, fill: u8) -> Vec<u8> {
    if bytes.len() >= n {
        return bytes[..n].to_vec();
    }
    let mut out = vec![fill; n];
    out[..bytes.len()].copy_from_slice(bytes);
    out
}

/// Finalise a block key against an already-spun password hash:
/// `key = fix(H(baseHash || blockKey), keyBytes)`.
///
/// Key material is padded with `0x36`, per MS-OFFCRYPTO `TruncateHash`.
pub(crate) fn derive_agile_key(
    hash_alg: HashAlgorithm,
    base_hash: &[u8],
    block_key: &[u8],
    key_bytes: usize,
) -> Zeroizing<Vec<u8>> {
    let digest = Zeroizing::new(hash_alg.digest_two(base_hash, block_key));
    Zeroizing::new(fix_hash_size(&digest, key_bytes, 0x36))
}

/// Derive an IV as `fix(H(salt || blockKey), ivLen)` with `0x36` padding.
pub(crate) fn derive_iv(
    hash_alg: HashAlgorithm,
    salt: &[u8],
    block_key: &[u8],
    iv_len: usize,
) -> Vec<u8> {
    fix_hash_size(&hash_alg.digest_two(salt, block_key), iv_len, 0x36)
}

fn invalid_key_len(alg: CipherAlgorithm, len: usize) -> OffcryptoError {
    OffcryptoError::UnsupportedAlgorithm(format!(
        "invalid {} key length {len}",
        alg.as_ooxml_name()
    ))
}

fn invalid_iv_len(len: usize) -> OffcryptoError {
    OffcryptoError::MalformedEnvelope(format!("IV length {len} does not match cipher block size"))
}

fn new_cipher<C: KeyInit>(alg: CipherAlgorithm, key: &[u8]) -> Result<C, OffcryptoError> {
    C::new_from_slice(key).map_err(|_| invalid_key_len(alg, key.len()))
}

fn new_rc2(key: &[u8]) -> Result<Rc2, OffcryptoError> {
    if key.is_empty() || key.len() > 128 {
        return Err(invalid_key_len(CipherAlgorithm::Rc2, key.len()));
    }
    Ok(Rc2::new_with_eff_key_len(key, key.len() * 8))
}

fn chain_encrypt_with<C>(
    cipher: C,
    chaining: ChainingMode,
    iv: &[u8],
    buf: &mut [u8],
) -> Result<(), OffcryptoError>
where
    C: BlockEncryptMut + BlockCipher,
{
    match chaining {
        ChainingMode::Cbc => {
            let enc = cbc::Encryptor::<C>::inner_iv_slice_init(cipher, iv)
                .map_err(|_| invalid_iv_len(iv.len()))?;
            let msg_len = buf.len();
            enc.encrypt_padded_mut::<NoPadding>(buf, msg_len).map_err(|_| {
                OffcryptoError::MalformedEnvelope("plaintext is not block aligned".to_string())
            })?;
        }
        ChainingMode::Cfb => {
            let enc = cfb_mode::Encryptor::<C>::inner_iv_slice_init(cipher, iv)
                .map_err(|_| invalid_iv_len(iv.len()))?;
            enc.encrypt(buf);
        }
    }
    Ok(())
}

fn chain_decrypt_with<C>(
    cipher: C,
    chaining: ChainingMode,
    iv: &[u8],
    buf: &mut [u8],
) -> Result<(), OffcryptoError>
where
    C: BlockEncryptMut + BlockDecryptMut + BlockCipher,
{
    match chaining {
        ChainingMode::Cbc => {
            let dec = cbc::Decryptor::<C>::inner_iv_slice_init(cipher, iv)
                .map_err(|_| invalid_iv_len(iv.len()))?;
            dec.decrypt_padded_mut::<NoPadding>(buf).map_err(|_| {
                OffcryptoError::MalformedEnvelope("ciphertext is not block aligned".to_string())
            })?;
        }
        ChainingMode::Cfb => {
            let dec = cfb_mode::Decryptor::<C>::inner_iv_slice_init(cipher, iv)
                .map_err(|_| invalid_iv_len(iv.len()))?;
            dec.decrypt(buf);
        }
    }
    Ok(())
}

/// Encrypt `buf` in place with the selected cipher and chaining mode.
///
/// For CBC, `buf` must already be padded to the cipher block size.
pub(crate) fn cipher_encrypt(
    alg: CipherAlgorithm,
    chaining: ChainingMode,
    key: &[u8],
    iv: &[u8],
    buf: &mut [u8],
) -> Result<(), OffcryptoError> {
    match alg {
        CipherAlgorithm::Aes => match key.len() {
            16 => chain_encrypt_with(new_cipher::<Aes128>(alg, key)?, chaining, iv, buf),
            24 => chain_encrypt_with(new_cipher::<Aes192>(alg, key)?, chaining, iv, buf),
            32 => chain_encrypt_with(new_cipher::<Aes256>(alg, key)?, chaining, iv, buf),
            len => Err(invalid_key_len(alg, len)),
        },
        CipherAlgorithm::Des => chain_encrypt_with(new_cipher::<Des>(alg, key)?, chaining, iv, buf),
        CipherAlgorithm::TripleDes => {
            chain_encrypt_with(new_cipher::<TdesEde3>(alg, key)?, chaining, iv, buf)
        }
        CipherAlgorithm::TripleDes112 => {
            chain_encrypt_with(new_cipher::<TdesEde2>(alg, key)?, chaining, iv, buf)
        }
        CipherAlgorithm::Rc2 => chain_encrypt_with(new_rc2(key)?, chaining, iv, buf),
    }
}

/// Decrypt `buf` in place with the selected cipher and chaining mode.
pub(crate) fn cipher_decrypt(
    alg: CipherAlgorithm,
    chaining: ChainingMode,
    key: &[u8],
    iv: &[u8],
    buf: &mut [u8],
) -> Result<(), OffcryptoError> {
    match alg {
        CipherAlgorithm::Aes => match key.len() {
            16 => chain_decrypt_with(new_cipher::<Aes128>(alg, key)?, chaining, iv, buf),
            24 => chain_decrypt_with(new_cipher::<Aes192>(alg, key)?, chaining, iv, buf),
            32 => chain_decrypt_with(new_cipher::<Aes256>(alg, key)?, chaining, iv, buf),
            len => Err(invalid_key_len(alg, len)),
        },
        CipherAlgorithm::Des => chain_decrypt_with(new_cipher::<Des>(alg, key)?, chaining, iv, buf),
        CipherAlgorithm::TripleDes => {
            chain_decrypt_with(new_cipher::<TdesEde3>(alg, key)?, chaining, iv, buf)
        }
        CipherAlgorithm::TripleDes112 => {
            chain_decrypt_with(new_cipher::<TdesEde2>(alg, key)?, chaining, iv, buf)
        }
        CipherAlgorithm::Rc2 => chain_decrypt_with(new_rc2(key)?, chaining, iv, buf),
    }
}

/// Encrypt `buf` in place with AES-ECB (Standard profile body and verifier).
pub(crate) fn aes_ecb_encrypt_in_place(key: &[u8], buf: &mut [u8]) -> Result<(), OffcryptoError> {
    fn encrypt_with<C>(key: &[u8], buf: &mut [u8]) -> Result<(), OffcryptoError>
    where
        C: BlockEncrypt + KeyInit,
    {
        let cipher = new_cipher::<C>(CipherAlgorithm::Aes, key)?;
        for block in buf.chunks_mut(16) {
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }

    if buf.len() % 16 != 0 {
        return Err(OffcryptoError::MalformedEnvelope(format!(
            "AES-ECB buffer length must be a multiple of 16 (got {})",
            buf.len()
        )));
    }
    match key.len() {
        16 => encrypt_with::<Aes128>(key, buf),
        24 => encrypt_with::<Aes192>(key, buf),
        32 => encrypt_with::<Aes256>(key, buf),
        len => Err(invalid_key_len(CipherAlgorithm::Aes, len)),
    }
}

/// Decrypt `buf` in place with AES-ECB.
pub(crate) fn aes_ecb_decrypt_in_place(key: &[u8], buf: &mut [u8]) -> Result<(), OffcryptoError> {
    fn decrypt_with<C>(key: &[u8], buf: &mut [u8]) -> Result<(), OffcryptoError>
    where
        C: BlockDecrypt + KeyInit,
    {
        let cipher = new_cipher::<C>(CipherAlgorithm::Aes, key)?;
        for block in buf.chunks_mut(16) {
            cipher.decrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }

    if buf.len() % 16 != 0 {
        return Err(OffcryptoError::MalformedEnvelope(format!(
            "AES-ECB buffer length must be a multiple of 16 (got {})",
            buf.len()
        )));
    }
    match key.len() {
        16 => decrypt_with::<Aes128>(key, buf),
        24 => decrypt_with::<Aes192>(key, buf),
        32 => decrypt_with::<Aes256>(key, buf),
        len => Err(invalid_key_len(CipherAlgorithm::Aes, len)),
    }
}

fn mac_with<M: Mac, R: Read>(mut mac: M, reader: &mut R) -> Result<Vec<u8>, OffcryptoError> {
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        mac.update(&buf[..n]);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Compute `HMAC_H(key, data)` over an in-memory buffer.
pub(crate) fn compute_hmac(hash_alg: HashAlgorithm, key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(data);
    hmac_over_reader(hash_alg, key, &mut cursor).expect("in-memory reads cannot fail")
}

/// Compute `HMAC_H(key, ·)` over a sequential reader (the just-written
/// `EncryptedPackage` spool), reading from its current position to EOF.
pub(crate) fn hmac_over_reader<R: Read>(
    hash_alg: HashAlgorithm,
    key: &[u8],
    reader: &mut R,
) -> Result<Vec<u8>, OffcryptoError> {
    match hash_alg {
        HashAlgorithm::Md5 => mac_with(
            <Hmac<Md5> as Mac>::new_from_slice(key).expect("HMAC accepts any key length"),
            reader,
        ),
        HashAlgorithm::Sha1 => mac_with(
            <Hmac<Sha1> as Mac>::new_from_slice(key).expect("HMAC accepts any key length"),
            reader,
        ),
        HashAlgorithm::Sha256 => mac_with(
            <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts any key length"),
            reader,
        ),
        HashAlgorithm::Sha384 => mac_with(
            <Hmac<Sha384> as Mac>::new_from_slice(key).expect("HMAC accepts any key length"),
            reader,
        ),
        HashAlgorithm::Sha512 => mac_with(
            <Hmac<Sha512> as Mac>::new_from_slice(key).expect("HMAC accepts any key length"),
            reader,
        ),
        HashAlgorithm::Ripemd160 => mac_with(
            <Hmac<Ripemd160> as Mac>::new_from_slice(key).expect("HMAC accepts any key length"),
            reader,
        ),
    }
}

/// MS-OFFCRYPTO Standard (CryptoAPI) password/key derivation.
///
/// The expensive spun password hash is computed once and reused across block
/// indices.
pub(crate) struct StandardKeyDeriver {
    hash_alg: HashAlgorithm,
    key_bytes: usize,
    password_hash: Zeroizing<Vec<u8>>,
}

impl StandardKeyDeriver {
    pub(crate) fn new(hash_alg: HashAlgorithm, key_bits: u32, salt: &[u8], password: &str) -> Self {
        let pw = password_to_utf16le(password);
        let password_hash = hash_password(hash_alg, salt, &pw, STANDARD_SPIN_COUNT);
        Self {
            hash_alg,
            key_bytes: (key_bits as usize) / 8,
            password_hash,
        }
    }

    pub(crate) fn derive_key_for_block(
        &self,
        block_index: u32,
    ) -> Result<Zeroizing<Vec<u8>>, OffcryptoError> {
        let h: Zeroizing<Vec<u8>> = Zeroizing::new(
            self.hash_alg
                .digest_two(&self.password_hash, &block_index.to_le_bytes()),
        );
        crypt_derive_key(self.hash_alg, &h, self.key_bytes)
    }
}

/// CryptoAPI `CryptDeriveKey`-style expansion:
///
///   D1 = H((h padded with zeros to the hash block size) XOR 0x36)
///   D2 = H((h padded with zeros to the hash block size) XOR 0x5C)
///   key = (D1 || D2)[..key_len]
fn crypt_derive_key(
    hash_alg: HashAlgorithm,
    hash: &[u8],
    key_len: usize,
) -> Result<Zeroizing<Vec<u8>>, OffcryptoError> {
    let block_len = hash_alg.block_len();

    let mut ipad: Zeroizing<Vec<u8>> = Zeroizing::new(vec![0x36u8; block_len]);
    let mut opad: Zeroizing<Vec<u8>> = Zeroizing::new(vec![0x5Cu8; block_len]);
    let take = hash.len().min(block_len);
    for i in 0..take {
        ipad[i] ^= hash[i];
        opad[i] ^= hash[i];
    }

    let d1: Zeroizing<Vec<u8>> = Zeroizing::new(hash_alg.digest(&ipad));
    let d2: Zeroizing<Vec<u8>> = Zeroizing::new(hash_alg.digest(&opad));

    let mut out: Zeroizing<Vec<u8>> = Zeroizing::new(Vec::with_capacity(d1.len() + d2.len()));
    out.extend_from_slice(&d1);
    out.extend_from_slice(&d2);
    if key_len > out.len() {
        return Err(OffcryptoError::UnsupportedAlgorithm(format!(
            "requested key length {key_len} exceeds derivation output length {}",
            out.len()
        )));
    }
    out.truncate(key_len);
    Ok(out)
}
