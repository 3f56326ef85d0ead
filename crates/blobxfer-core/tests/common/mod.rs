#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use blobxfer_core::{KeyMaterial, MemoryBlobStore, TransferConfig, TransferEngine, store::BlobStore};
use rsa::{
    RsaPrivateKey,
    pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding},
};
use tracing_subscriber::EnvFilter;

pub const CONTAINER: &str = "test-container";

/// Installs a test-writer subscriber; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One RSA key per test binary. 1024 bits keeps key generation fast.
pub fn test_key() -> RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand_core::OsRng, 1024).unwrap())
        .clone()
}

pub fn key_material() -> KeyMaterial {
    KeyMaterial::from_private_key(test_key())
}

/// Writes the test key pair as PKCS#8 PEM files and returns
/// `(public, private)`.
pub fn write_key_pems(dir: &Path) -> (PathBuf, PathBuf) {
    let key = test_key();
    let public = dir.join("public.pem");
    let private = dir.join("private.pem");
    fs::write(&public, key.to_public_key().to_public_key_pem(LineEnding::LF).unwrap()).unwrap();
    fs::write(&private, key.to_pkcs8_pem(LineEnding::LF).unwrap().as_bytes()).unwrap();
    (public, private)
}

/// Deterministic content of exactly `size` bytes.
pub fn create_sized_content(size: usize) -> Vec<u8> {
    let pattern = b"0123456789ABCDEF";
    (0..size).map(|i| pattern[i % pattern.len()]).collect()
}

pub fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, data).unwrap();
    path
}

pub fn config() -> TransferConfig {
    TransferConfig::new(CONTAINER).with_workers(8)
}

/// Engine over `store` with the shared test key loaded.
pub fn engine(store: &Arc<MemoryBlobStore>, config: TransferConfig) -> TransferEngine {
    TransferEngine::new(Arc::clone(store) as Arc<dyn BlobStore>, config)
        .unwrap()
        .with_keys(key_material())
}
