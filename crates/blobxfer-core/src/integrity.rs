//! Content hashing and skip-on-match decisions.
//!
//! All digests are base64-encoded MD5, the convention of the `Content-MD5`
//! header.

use std::{
    fs::File,
    io::{self, Read},
    path::Path,
};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use md5::{Digest, Md5};
use tracing::{debug, trace};

use crate::{
    config::PAGE_SIZE_BYTES,
    crypto::metadata::peek_pre_encrypted_md5,
    store::BlobProperties,
};

const READ_BUFFER_SIZE: usize = 1024 * 1024;

pub fn md5_base64(data: &[u8]) -> String {
    BASE64.encode(Md5::digest(data))
}

/// MD5 of an empty payload (`1B2M2Y8AsgTpgAmY7PhCfg==`).
pub fn empty_md5() -> String {
    md5_base64(&[])
}

/// Finishes a running MD5 into its base64 form.
pub fn finish_md5(hasher: Md5) -> String {
    BASE64.encode(hasher.finalize())
}

/// MD5 of a local file.
///
/// With `page_align` set the file is hashed as if zero-padded to the next
/// 512-byte boundary, which is what a page object stores.
pub fn file_md5(path: &Path, page_align: bool) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total += n as u64;
    }
    if page_align {
        let remainder = total % PAGE_SIZE_BYTES;
        if remainder != 0 {
            hasher.update(vec![0u8; (PAGE_SIZE_BYTES - remainder) as usize]);
        }
    }
    trace!(?path, bytes = total, page_align, "Hashed local file");
    Ok(finish_md5(hasher))
}

/// The MD5 an upload should be compared against on the remote side.
///
/// Encrypted objects are compared by the plaintext MD5 recorded in their
/// encryption metadata; plain objects by their content MD5.
pub fn remote_comparison_md5(remote: &BlobProperties, encrypted: bool) -> Option<String> {
    if encrypted {
        peek_pre_encrypted_md5(&remote.metadata)
    } else {
        remote.content_md5.clone()
    }
}

/// Whether an upload can be skipped because the remote copy matches.
pub fn upload_matches(local_md5: &str, remote: Option<&BlobProperties>, encrypted: bool) -> bool {
    let Some(remote) = remote else {
        return false;
    };
    let matched = remote_comparison_md5(remote, encrypted).is_some_and(|md5| md5 == local_md5);
    debug!(name = %remote.name, matched, "Compared local file against remote MD5");
    matched
}

/// Whether a download can be skipped because the local file matches.
pub fn download_matches(local: &Path, remote_md5: Option<&str>) -> io::Result<bool> {
    let Some(remote_md5) = remote_md5 else {
        return Ok(false);
    };
    if !local.is_file() {
        return Ok(false);
    }
    Ok(file_md5(local, false)? == remote_md5)
}
