//! File-to-file flows over a real attachment store directory.

use {
    kuvert_protocol::AttachmentKeys,
    kuvert_sdk::{
        crypto::{
            decrypt_attachment, encrypt_attachment_to_file, DecryptOptions, EncryptOptions,
            Error, IntegrityCheck, PlaintextSource,
        },
        store::AttachmentRoot,
    },
    std::{
        io::{self, Read},
        path::{Path, PathBuf},
    },
};

fn walk_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in fs_err::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        let path = entry.path();
        if path.is_dir() {
            files.extend(walk_files(&path));
        } else {
            files.push(path);
        }
    }
    files
}

#[test]
fn file_to_file_roundtrip() {
    let keys = AttachmentKeys::generate().unwrap();
    let plaintext: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();

    let cipher_dir = tempfile::tempdir().unwrap();
    let cipher_root = AttachmentRoot::new(cipher_dir.path());
    let (encrypted, cipher_relative) = encrypt_attachment_to_file(
        PlaintextSource::Bytes(&plaintext),
        &EncryptOptions::new(&keys),
        &cipher_root,
    )
    .unwrap();

    let ciphertext_path = cipher_root.resolve(&cipher_relative).unwrap();
    let frame_len = fs_err::metadata(&ciphertext_path).unwrap().len();
    assert_eq!(frame_len, encrypted.ciphertext_size);

    let plain_dir = tempfile::tempdir().unwrap();
    let plain_root = AttachmentRoot::new(plain_dir.path());
    let (decrypted, plain_relative) = decrypt_attachment(
        &DecryptOptions {
            ciphertext_path: &ciphertext_path,
            id_for_logging: "file-roundtrip",
            plaintext_size: plaintext.len() as u64,
            keys: &keys,
            integrity: IntegrityCheck::standard(&encrypted.digest).unwrap(),
            outer_keys: None,
        },
        &plain_root,
    )
    .unwrap();

    let restored = fs_err::read(plain_root.resolve(&plain_relative).unwrap()).unwrap();
    assert_eq!(restored, plaintext);
    assert_eq!(decrypted.plaintext_hash, encrypted.plaintext_hash);
    assert_eq!(decrypted.iv, encrypted.iv);
}

#[test]
fn failed_decryption_leaves_no_file() {
    let keys = AttachmentKeys::generate().unwrap();
    let plaintext = b"will be tampered with".to_vec();

    let cipher_dir = tempfile::tempdir().unwrap();
    let cipher_root = AttachmentRoot::new(cipher_dir.path());
    let (encrypted, cipher_relative) = encrypt_attachment_to_file(
        PlaintextSource::Bytes(&plaintext),
        &EncryptOptions::new(&keys),
        &cipher_root,
    )
    .unwrap();

    let ciphertext_path = cipher_root.resolve(&cipher_relative).unwrap();
    let mut frame = fs_err::read(&ciphertext_path).unwrap();
    *frame.last_mut().unwrap() ^= 0x01;
    fs_err::write(&ciphertext_path, &frame).unwrap();

    let plain_dir = tempfile::tempdir().unwrap();
    let plain_root = AttachmentRoot::new(plain_dir.path());
    let err = decrypt_attachment(
        &DecryptOptions {
            ciphertext_path: &ciphertext_path,
            id_for_logging: "tampered",
            plaintext_size: plaintext.len() as u64,
            keys: &keys,
            integrity: IntegrityCheck::standard(&encrypted.digest).unwrap(),
            outer_keys: None,
        },
        &plain_root,
    )
    .unwrap_err();
    assert!(matches!(err, Error::BadMac));
    assert!(walk_files(plain_dir.path()).is_empty());
}

/// Delivers a few bytes, then fails the way an embedding application cancels
/// a transfer.
struct AbortingReader {
    delivered: bool,
}

impl Read for AbortingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.delivered {
            return Err(io::Error::other(Error::Aborted));
        }
        self.delivered = true;
        let len = buf.len().min(1024);
        buf[..len].fill(0x42);
        Ok(len)
    }
}

#[test]
fn aborted_encryption_cleans_up_and_surfaces_as_abort() {
    let keys = AttachmentKeys::generate().unwrap();
    let store_dir = tempfile::tempdir().unwrap();
    let root = AttachmentRoot::new(store_dir.path());

    let mut reader = AbortingReader { delivered: false };
    let err = encrypt_attachment_to_file(
        PlaintextSource::Reader(&mut reader),
        &EncryptOptions::new(&keys),
        &root,
    )
    .unwrap_err();
    assert!(err.is_aborted());
    assert!(walk_files(store_dir.path()).is_empty());
}
