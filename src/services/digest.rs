//! Digest algorithms and incremental hashing over byte streams.

use crate::errors::StorageError;
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha384, Sha512};
use std::{fmt, io, path::Path, str::FromStr};
use tokio::fs::File;
use tokio_util::io::ReaderStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    #[serde(rename = "MD5")]
    Md5,
    #[serde(rename = "SHA-256")]
    Sha256,
    #[serde(rename = "SHA-384")]
    Sha384,
    #[default]
    #[serde(rename = "SHA-512")]
    Sha512,
}

impl DigestAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha384 => "SHA-384",
            DigestAlgorithm::Sha512 => "SHA-512",
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = StorageError;

    /// Accepts `SHA-512`, `sha512` and the other usual spellings.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized: String = value
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_uppercase();
        match normalized.as_str() {
            "MD5" => Ok(DigestAlgorithm::Md5),
            "SHA256" => Ok(DigestAlgorithm::Sha256),
            "SHA384" => Ok(DigestAlgorithm::Sha384),
            "SHA512" => Ok(DigestAlgorithm::Sha512),
            _ => Err(StorageError::invalid(format!(
                "unsupported digest algorithm `{}`",
                value
            ))),
        }
    }
}

enum HashState {
    Md5(md5::Context),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

/// Incremental hasher for one of the supported algorithms.
pub struct Digest {
    state: HashState,
}

impl Digest {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        let state = match algorithm {
            DigestAlgorithm::Md5 => HashState::Md5(md5::Context::new()),
            DigestAlgorithm::Sha256 => HashState::Sha256(Sha256::new()),
            DigestAlgorithm::Sha384 => HashState::Sha384(Sha384::new()),
            DigestAlgorithm::Sha512 => HashState::Sha512(Sha512::new()),
        };
        Self { state }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HashState::Md5(ctx) => ctx.consume(data),
            HashState::Sha256(hasher) => hasher.update(data),
            HashState::Sha384(hasher) => hasher.update(data),
            HashState::Sha512(hasher) => hasher.update(data),
        }
    }

    /// Lowercase hex encoding of the final hash.
    pub fn finalize_hex(self) -> String {
        match self.state {
            HashState::Md5(ctx) => format!("{:x}", ctx.compute()),
            HashState::Sha256(hasher) => hex::encode(hasher.finalize()),
            HashState::Sha384(hasher) => hex::encode(hasher.finalize()),
            HashState::Sha512(hasher) => hex::encode(hasher.finalize()),
        }
    }
}

pub fn digest_bytes(algorithm: DigestAlgorithm, data: &[u8]) -> String {
    let mut digest = Digest::new(algorithm);
    digest.update(data);
    digest.finalize_hex()
}

/// Drain `stream`, returning its hex digest and total length.
pub async fn digest_stream<S>(algorithm: DigestAlgorithm, stream: S) -> io::Result<(String, u64)>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let mut digest = Digest::new(algorithm);
    let mut size: u64 = 0;
    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        size += chunk.len() as u64;
        digest.update(&chunk);
    }
    Ok((digest.finalize_hex(), size))
}

pub async fn digest_file(algorithm: DigestAlgorithm, path: &Path) -> io::Result<(String, u64)> {
    let file = File::open(path).await?;
    digest_stream(algorithm, ReaderStream::new(file)).await
}
