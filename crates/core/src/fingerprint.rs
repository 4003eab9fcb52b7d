use std::fmt;

use sha2::{Digest, Sha256};

/// Stable digest of function source used for change detection only.
///
/// 32 lowercase hex chars: the first 16 bytes of SHA-256 over the raw text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn fingerprint(text: &str) -> Fingerprint {
    let digest = Sha256::digest(text.as_bytes());
    Fingerprint(hex::encode(&digest[..16]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_length_lowercase_hex() {
        for text in ["", "package handlers", "ünïcödé\n\t"] {
            let fp = fingerprint(text);
            assert_eq!(fp.as_str().len(), 32);
            assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn deterministic_and_content_sensitive() {
        let a = fingerprint("func Handler() {}");
        assert_eq!(a, fingerprint("func Handler() {}"));
        assert_ne!(a, fingerprint("func Handler() { }"));
        // sha256("") prefix
        assert_eq!(fingerprint("").as_str(), "e3b0c44298fc1c149afbf4c8996fb924");
    }
}
