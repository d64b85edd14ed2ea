//! Blob identity
//!
//! A digest is the triple (instance, hash, size). The hex length of the
//! hash selects the algorithm, so a digest carries everything needed to
//! re-verify the bytes it names.

use crate::blobstore::{StorageError, StorageResult};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest as _, Sha256, Sha384, Sha512};
use std::fmt;

/// Hash function, selected by the hex length of the digest's hash field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// Select the algorithm matching a hex-encoded hash of the given length.
    pub fn from_hash_length(hex_length: usize) -> Option<Self> {
        match hex_length {
            32 => Some(HashAlgorithm::Md5),
            40 => Some(HashAlgorithm::Sha1),
            64 => Some(HashAlgorithm::Sha256),
            96 => Some(HashAlgorithm::Sha384),
            128 => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }

    pub fn hasher(&self) -> DigestHasher {
        match self {
            HashAlgorithm::Md5 => DigestHasher::Md5(Md5::new()),
            HashAlgorithm::Sha1 => DigestHasher::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => DigestHasher::Sha256(Sha256::new()),
            HashAlgorithm::Sha384 => DigestHasher::Sha384(Sha384::new()),
            HashAlgorithm::Sha512 => DigestHasher::Sha512(Sha512::new()),
        }
    }
}

/// Incremental hasher producing hex digests.
pub enum DigestHasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl DigestHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            DigestHasher::Md5(h) => h.update(data),
            DigestHasher::Sha1(h) => h.update(data),
            DigestHasher::Sha256(h) => h.update(data),
            DigestHasher::Sha384(h) => h.update(data),
            DigestHasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finish_hex(self) -> String {
        match self {
            DigestHasher::Md5(h) => hex::encode(h.finalize()),
            DigestHasher::Sha1(h) => hex::encode(h.finalize()),
            DigestHasher::Sha256(h) => hex::encode(h.finalize()),
            DigestHasher::Sha384(h) => hex::encode(h.finalize()),
            DigestHasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Identity of a blob: instance name, hex hash and exact byte length.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    instance: String,
    hash: String,
    size_bytes: u64,
}

impl Digest {
    /// Create a digest, validating the hash field.
    pub fn new(instance: &str, hash: &str, size_bytes: u64) -> StorageResult<Self> {
        if HashAlgorithm::from_hash_length(hash.len()).is_none() {
            return Err(StorageError::InvalidArgument(format!(
                "unknown digest hash length: {}",
                hash.len()
            )));
        }
        if !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidArgument(format!(
                "non-hexadecimal digest hash: {:?}",
                hash
            )));
        }
        Ok(Self {
            instance: instance.to_string(),
            hash: hash.to_ascii_lowercase(),
            size_bytes,
        })
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        // Hash length was validated at construction.
        HashAlgorithm::from_hash_length(self.hash.len()).unwrap_or(HashAlgorithm::Sha256)
    }

    /// Hasher using the same algorithm as this digest.
    pub fn hasher(&self) -> DigestHasher {
        self.algorithm().hasher()
    }

    /// Compute the digest of a payload under this digest's algorithm and
    /// instance name.
    pub fn derive(&self, data: &[u8]) -> Digest {
        let mut hasher = self.hasher();
        hasher.update(data);
        Digest {
            instance: self.instance.clone(),
            hash: hasher.finish_hex(),
            size_bytes: data.len() as u64,
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.instance.is_empty() {
            write!(f, "{}-{}", self.hash, self.size_bytes)
        } else {
            write!(f, "{}-{}-{}", self.hash, self.size_bytes, self.instance)
        }
    }
}
