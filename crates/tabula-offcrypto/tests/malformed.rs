use std::io::{Cursor, Read, Write};

use tabula_offcrypto::{
    decrypt_encrypted_package_ole, encrypt_package_to_ole, EncryptOptions, OffcryptoError,
};

fn agile_opts() -> EncryptOptions {
    EncryptOptions {
        spin_count: 10_000,
        ..EncryptOptions::default()
    }
}

fn build_container(streams: &[(&str, &[u8])]) -> Vec<u8> {
    let mut ole = cfb::CompoundFile::create(Cursor::new(Vec::new())).expect("create cfb");
    for (name, bytes) in streams {
        ole.create_stream(name)
            .expect("create stream")
            .write_all(bytes)
            .expect("write stream");
    }
    ole.into_inner().into_inner()
}

#[test]
fn non_cfb_input_is_not_an_encrypted_package() {
    for input in [&b""[..], b"PK\x03\x04", b"this is not an OLE container"] {
        let err = decrypt_encrypted_package_ole(input, "pw").expect_err("not cfb");
        assert!(
            matches!(err, OffcryptoError::NotEncryptedPackage),
            "got {err:?}"
        );
    }
}

#[test]
fn ole_magic_with_garbage_body_is_malformed() {
    let mut bytes = vec![0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
    bytes.extend_from_slice(&[0u8; 64]);
    let err = decrypt_encrypted_package_ole(&bytes, "pw").expect_err("garbage");
    assert!(matches!(err, OffcryptoError::MalformedEnvelope(_)), "got {err:?}");
}

#[test]
fn missing_encryption_info_stream_is_malformed() {
    let container = build_container(&[("EncryptedPackage", &[0u8; 8])]);
    let err = decrypt_encrypted_package_ole(&container, "pw").expect_err("missing info");
    assert!(matches!(err, OffcryptoError::MalformedEnvelope(_)), "got {err:?}");
}

#[test]
fn missing_encrypted_package_stream_is_malformed() {
    let real = encrypt_package_to_ole(b"pkg", "pw", &agile_opts()).expect("encrypt");
    let mut ole = cfb::CompoundFile::open(Cursor::new(&real)).expect("open");
    let mut info = Vec::new();
    ole.open_stream("EncryptionInfo")
        .expect("open")
        .read_to_end(&mut info)
        .expect("read");

    let container = build_container(&[("EncryptionInfo", &info)]);
    let err = decrypt_encrypted_package_ole(&container, "pw").expect_err("missing package");
    assert!(matches!(err, OffcryptoError::MalformedEnvelope(_)), "got {err:?}");
}

#[test]
fn truncated_encryption_info_is_malformed() {
    let container = build_container(&[
        ("EncryptionInfo", &[0x04, 0x00][..]),
        ("EncryptedPackage", &[0u8; 8]),
    ]);
    let err = decrypt_encrypted_package_ole(&container, "pw").expect_err("truncated");
    assert!(matches!(err, OffcryptoError::MalformedEnvelope(_)), "got {err:?}");
}

#[test]
fn flipping_any_ciphertext_bit_fails_agile_integrity() {
    let package = b"bytes whose integrity matters".to_vec();
    let password = "correct horse battery staple";
    let ole = encrypt_package_to_ole(&package, password, &agile_opts()).expect("encrypt");

    let mut ole_in = cfb::CompoundFile::open(Cursor::new(&ole)).expect("open cfb");
    let mut encryption_info = Vec::new();
    ole_in
        .open_stream("EncryptionInfo")
        .expect("open info")
        .read_to_end(&mut encryption_info)
        .expect("read info");
    let mut encrypted_package = Vec::new();
    ole_in
        .open_stream("EncryptedPackage")
        .expect("open package")
        .read_to_end(&mut encrypted_package)
        .expect("read package");
    assert!(encrypted_package.len() > 8);

    // Flip one bit in several positions of the ciphertext (past the length
    // prefix) and in the length prefix itself.
    for (pos, bit) in [(8usize, 0x01u8), (9, 0x80), (encrypted_package.len() - 1, 0x10), (0, 0x01)]
    {
        let mut tampered_package = encrypted_package.clone();
        tampered_package[pos] ^= bit;

        let tampered = build_container(&[
            ("EncryptionInfo", &encryption_info[..]),
            ("EncryptedPackage", &tampered_package[..]),
        ]);
        let err =
            decrypt_encrypted_package_ole(&tampered, password).expect_err("tampered input");
        assert!(
            matches!(
                err,
                OffcryptoError::IntegrityFailure | OffcryptoError::MalformedEnvelope(_)
            ),
            "pos={pos} got {err:?}"
        );
        if pos >= 8 {
            assert!(
                matches!(err, OffcryptoError::IntegrityFailure),
                "ciphertext flip at {pos} must be an integrity failure, got {err:?}"
            );
        }
    }
}

#[test]
fn standard_decrypt_honours_size_prefix() {
    let package = b"exactly this many bytes".to_vec();
    let opts = EncryptOptions {
        scheme: tabula_offcrypto::EncryptionScheme::Standard,
        key_bits: 128,
        hash_algorithm: tabula_offcrypto::HashAlgorithm::Sha1,
        cipher_chaining: tabula_offcrypto::ChainingMode::Cbc,
        spin_count: 50_000,
    };
    let ole = encrypt_package_to_ole(&package, "pw", &opts).expect("encrypt");
    let decrypted = decrypt_encrypted_package_ole(&ole, "pw").expect("decrypt");
    assert_eq!(decrypted.len(), package.len());
    assert_eq!(decrypted, package);
}

#[test]
fn standard_oversized_size_prefix_is_malformed() {
    let package = b"tiny".to_vec();
    let opts = EncryptOptions {
        scheme: tabula_offcrypto::EncryptionScheme::Standard,
        key_bits: 128,
        hash_algorithm: tabula_offcrypto::HashAlgorithm::Sha1,
        cipher_chaining: tabula_offcrypto::ChainingMode::Cbc,
        spin_count: 50_000,
    };
    let ole = encrypt_package_to_ole(&package, "pw", &opts).expect("encrypt");

    let mut ole_in = cfb::CompoundFile::open(Cursor::new(&ole)).expect("open cfb");
    let mut encryption_info = Vec::new();
    ole_in
        .open_stream("EncryptionInfo")
        .expect("open info")
        .read_to_end(&mut encryption_info)
        .expect("read info");
    let mut encrypted_package = Vec::new();
    ole_in
        .open_stream("EncryptedPackage")
        .expect("open package")
        .read_to_end(&mut encrypted_package)
        .expect("read package");

    // Claim more plaintext than ciphertext exists.
    encrypted_package[..8].copy_from_slice(&(1u64 << 32).to_le_bytes());
    let tampered = build_container(&[
        ("EncryptionInfo", &encryption_info[..]),
        ("EncryptedPackage", &encrypted_package[..]),
    ]);
    let err = decrypt_encrypted_package_ole(&tampered, "pw").expect_err("oversized");
    assert!(matches!(err, OffcryptoError::MalformedEnvelope(_)), "got {err:?}");
}
