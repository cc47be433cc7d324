//! Validity signatures for derived artifacts.
//!
//! A signature is SHA-256 over the content hash, the step name, the step's
//! tool version and the signature of the upstream artifact the step
//! consumes (if any). An artifact is valid iff the signature computed from
//! current inputs equals the one it is stored under; a row merely existing
//! means nothing.

use sha2::{Digest, Sha256};

/// Inputs that determine a step's output.
#[derive(Debug, Clone, Copy)]
pub struct SignatureInputs<'a> {
    pub content_hash: &'a str,
    pub step: &'a str,
    pub tool_version: &'a str,
    pub upstream: Option<&'a str>,
}

impl SignatureInputs<'_> {
    pub fn compute(&self) -> String {
        let mut hasher = Sha256::new();
        // Length-prefix every field so that no two input tuples can
        // serialize to the same byte stream.
        for field in [
            self.content_hash,
            self.step,
            self.tool_version,
            self.upstream.unwrap_or(""),
        ] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        hasher.update([self.upstream.is_some() as u8]);
        hex::encode(hasher.finalize())
    }
}

/// SHA-256 of raw file bytes, hex encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
