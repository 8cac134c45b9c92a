use anyhow::{anyhow, Result};
use hex::encode;
use rand::Rng;
use std::fmt;

/// 12 lowercase hex characters identifying one container for the lifetime
/// of a single `run` invocation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerId(String);

/// First 12 hex characters of the SHA-256 of an image's config blob.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageId(String);

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

impl ContainerId {
    /// 6 random bytes, hex-encoded: 12 hex characters of randomness.
    pub fn generate() -> Self {
        let random_bytes = rand::thread_rng().gen::<[u8; 6]>();
        ContainerId(encode(random_bytes))
    }

    pub fn parse(s: &str) -> Result<Self> {
        if s.len() == 12 && is_lower_hex(s) {
            Ok(ContainerId(s.to_string()))
        } else {
            Err(anyhow!("invalid container ID: {}", s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 6 characters, used to name host/peer veth links.
    pub fn short(&self) -> &str {
        &self.0[0..6]
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl ImageId {
    pub fn from_digest_hex(full_hex: &str) -> Result<Self> {
        if full_hex.len() < 12 {
            return Err(anyhow!("digest too short to derive an image ID: {}", full_hex));
        }
        ImageId::parse(&full_hex[..12])
    }

    pub fn parse(s: &str) -> Result<Self> {
        if s.len() == 12 && is_lower_hex(s) {
            Ok(ImageId(s.to_string()))
        } else {
            Err(anyhow!("invalid image ID: {}", s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_container_id_is_12_lowercase_hex() {
        let id = ContainerId::generate();
        assert_eq!(id.as_str().len(), 12);
        assert!(is_lower_hex(id.as_str()));
    }

    #[test]
    fn container_id_short_is_first_six_chars() {
        let id = ContainerId::parse("abcdef012345").unwrap();
        assert_eq!(id.short(), "abcdef");
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(ContainerId::parse("too-short").is_err());
        assert!(ContainerId::parse("ABCDEF012345").is_err());
        assert!(ImageId::parse("not hex at all").is_err());
    }

    #[test]
    fn image_id_from_digest_takes_first_12_chars() {
        let id = ImageId::from_digest_hex("0123456789abcdeffedcba9876543210").unwrap();
        assert_eq!(id.as_str(), "0123456789ab");
    }
}
