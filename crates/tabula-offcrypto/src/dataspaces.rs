//! Synthesis of the fixed `\x06DataSpaces` storage tree.
//!
//! Conformant Office readers expect the encrypted container to carry a
//! DataSpaces description of the transform chain. The contents are fully
//! fixed for password-encrypted OOXML packages, so the four streams are
//! emitted as canned byte layouts (MS-OFFCRYPTO §2.1).

use std::io::{Read, Seek, Write};

use crate::util::utf16le_bytes;

pub(crate) const DATA_SPACES_STORAGE: &str = "\u{6}DataSpaces";

const FEATURE_IDENTIFIER: &str = "Microsoft.Container.DataSpaces";
const DATA_SPACE_NAME: &str = "StrongEncryptionDataSpace";
const TRANSFORM_NAME: &str = "StrongEncryptionTransform";
const TRANSFORM_ID: &str = "{FF9A3F03-56EF-4613-BDD5-5A41C1D07246}";
const ENCRYPTION_TRANSFORM_NAME: &str = "Microsoft.Container.EncryptionTransform";

/// Append a `UNICODE-LP-P4` field: u32 byte length, UTF-16LE data, zero
/// padding to a 4-byte boundary.
fn write_unicode_lp_p4(out: &mut Vec<u8>, s: &str) {
    let data = utf16le_bytes(s);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&data);
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

/// Append a `Version` field (u16 major, u16 minor).
fn write_version(out: &mut Vec<u8>, major: u16, minor: u16) {
    out.extend_from_slice(&major.to_le_bytes());
    out.extend_from_slice(&minor.to_le_bytes());
}

/// `Version` stream: `DataSpaceVersionInfo`.
pub(crate) fn version_stream() -> Vec<u8> {
    let mut out = Vec::new();
    write_unicode_lp_p4(&mut out, FEATURE_IDENTIFIER);
    write_version(&mut out, 1, 0); // ReaderVersion
    write_version(&mut out, 1, 0); // UpdaterVersion
    write_version(&mut out, 1, 0); // WriterVersion
    out
}

/// `DataSpaceMap` stream: one entry mapping `EncryptedPackage` to
/// `StrongEncryptionDataSpace`.
pub(crate) fn data_space_map_stream() -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&8u32.to_le_bytes()); // HeaderLength
    out.extend_from_slice(&1u32.to_le_bytes()); // EntryCount

    let entry_start = out.len();
    out.extend_from_slice(&0u32.to_le_bytes()); // Length (patched below)
    out.extend_from_slice(&1u32.to_le_bytes()); // ReferenceComponentCount
    out.extend_from_slice(&0u32.to_le_bytes()); // ReferenceComponentType (stream)
    write_unicode_lp_p4(&mut out, "EncryptedPackage");
    write_unicode_lp_p4(&mut out, DATA_SPACE_NAME);

    let entry_len = (out.len() - entry_start) as u32;
    out[entry_start..entry_start + 4].copy_from_slice(&entry_len.to_le_bytes());
    out
}

/// `DataSpaceInfo/StrongEncryptionDataSpace` stream: `DataSpaceDefinition`
/// referencing the single transform.
pub(crate) fn data_space_definition_stream() -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&8u32.to_le_bytes()); // HeaderLength
    out.extend_from_slice(&1u32.to_le_bytes()); // TransformReferenceCount
    write_unicode_lp_p4(&mut out, TRANSFORM_NAME);
    out
}

/// `TransformInfo/StrongEncryptionTransform/\x06Primary` stream:
/// `TransformInfoHeader` + `EncryptionTransformInfo`.
pub(crate) fn transform_info_stream() -> Vec<u8> {
    let mut out = Vec::new();

    let header_start = out.len();
    out.extend_from_slice(&0u32.to_le_bytes()); // TransformLength (patched below)
    out.extend_from_slice(&1u32.to_le_bytes()); // TransformType
    write_unicode_lp_p4(&mut out, TRANSFORM_ID);
    let header_len = (out.len() - header_start) as u32;
    out[header_start..header_start + 4].copy_from_slice(&header_len.to_le_bytes());

    write_unicode_lp_p4(&mut out, ENCRYPTION_TRANSFORM_NAME);
    write_version(&mut out, 1, 0); // ReaderVersion
    write_version(&mut out, 1, 0); // UpdaterVersion
    write_version(&mut out, 1, 0); // WriterVersion

    out.extend_from_slice(&0u32.to_le_bytes()); // EncryptionName (null)
    out.extend_from_slice(&0u32.to_le_bytes()); // EncryptionBlockSize
    out.extend_from_slice(&0u32.to_le_bytes()); // CipherMode
    out.extend_from_slice(&4u32.to_le_bytes()); // Reserved
    out
}

/// Populate the `\x06DataSpaces` substorage inside a compound file.
pub(crate) fn write_data_spaces<F: Read + Write + Seek>(
    ole: &mut cfb::CompoundFile<F>,
) -> std::io::Result<()> {
    let root = format!("/{DATA_SPACES_STORAGE}");
    ole.create_storage(&root)?;
    ole.create_stream(format!("{root}/Version"))?
        .write_all(&version_stream())?;
    ole.create_stream(format!("{root}/DataSpaceMap"))?
        .write_all(&data_space_map_stream())?;

    ole.create_storage(format!("{root}/DataSpaceInfo"))?;
    ole.create_stream(format!("{root}/DataSpaceInfo/{DATA_SPACE_NAME}"))?
        .write_all(&data_space_definition_stream())?;

    ole.create_storage(format!("{root}/TransformInfo"))?;
    ole.create_storage(format!("{root}/TransformInfo/{TRANSFORM_NAME}"))?;
    ole.create_stream(format!("{root}/TransformInfo/{TRANSFORM_NAME}/\u{6}Primary"))?
        .write_all(&transform_info_stream())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Golden bytes match containers produced by the Office reference
    // implementation.

    #[test]
    fn version_stream_golden_bytes() {
        assert_eq!(
            version_stream(),
            b"\x3C\0\0\0\
              M\0i\0c\0r\0o\0s\0o\0f\0t\0.\0C\0o\0n\0t\0a\0i\0n\0e\0r\0.\0\
              D\0a\0t\0a\0S\0p\0a\0c\0e\0s\0\
              \x01\0\0\0\x01\0\0\0\x01\0\0\0"
                .to_vec(),
        );
    }

    #[test]
    fn data_space_map_golden_bytes() {
        assert_eq!(
            data_space_map_stream(),
            b"\x08\0\0\0\x01\0\0\0\x68\0\0\0\x01\0\0\0\0\0\0\0\
              \x20\0\0\0E\0n\0c\0r\0y\0p\0t\0e\0d\0P\0a\0c\0k\0a\0g\0e\0\
              \x32\0\0\0\
              S\0t\0r\0o\0n\0g\0E\0n\0c\0r\0y\0p\0t\0i\0o\0n\0D\0a\0t\0a\0S\0p\0a\0c\0e\0\0\0"
                .to_vec(),
        );
    }

    #[test]
    fn data_space_definition_golden_bytes() {
        assert_eq!(
            data_space_definition_stream(),
            b"\x08\0\0\0\x01\0\0\0\
              \x32\0\0\0\
              S\0t\0r\0o\0n\0g\0E\0n\0c\0r\0y\0p\0t\0i\0o\0n\0T\0r\0a\0n\0s\0f\0o\0r\0m\0\0\0"
                .to_vec(),
        );
    }

    #[test]
    fn transform_info_golden_bytes() {
        assert_eq!(
            transform_info_stream(),
            b"\x58\0\0\0\x01\0\0\0\
              \x4C\0\0\0\
              {\0F\0F\09\0A\03\0F\00\03\0-\05\06\0E\0F\0-\04\06\01\03\0-\0B\0D\0D\05\0-\0\
              5\0A\04\01\0C\01\0D\00\07\02\04\06\0}\0\
              \x4E\0\0\0\
              M\0i\0c\0r\0o\0s\0o\0f\0t\0.\0C\0o\0n\0t\0a\0i\0n\0e\0r\0.\0\
              E\0n\0c\0r\0y\0p\0t\0i\0o\0n\0T\0r\0a\0n\0s\0f\0o\0r\0m\0\0\0\
              \x01\0\0\0\x01\0\0\0\x01\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\x04\0\0\0"
                .to_vec(),
        );
    }

    #[test]
    fn unicode_lp_p4_pads_to_four_bytes() {
        let mut out = Vec::new();
        write_unicode_lp_p4(&mut out, "Odd");
        assert_eq!(out, b"\x06\0\0\0O\0d\0d\0\0\0".to_vec());

        let mut out = Vec::new();
        write_unicode_lp_p4(&mut out, "Even");
        assert_eq!(out, b"\x08\0\0\0E\0v\0e\0n\0".to_vec());
    }
}
