//! Content fingerprint used to coalesce equivalent submissions.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::provider::Resolution;

/// The generation parameters that decide whether two submissions are the same work.
#[derive(Debug, Clone, Copy)]
pub struct FingerprintInput<'a> {
    pub image_url: Option<&'a str>,
    pub prompt: Option<&'a str>,
    pub category: Option<&'a str>,
    pub strength: Option<f32>,
    pub seed: u32,
    pub resolution: Resolution,
    pub aspect_ratio: Option<&'a str>,
    pub reference_image_urls: &'a [String],
}

// Field order is part of the hash input; keep it sorted.
#[derive(Serialize)]
struct Canonical<'a> {
    aspect_ratio: Option<String>,
    category: Option<String>,
    image_url: Option<&'a str>,
    prompt: Option<&'a str>,
    reference_image_urls: Vec<&'a str>,
    resolution: &'static str,
    seed: u32,
    strength: Option<String>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl FingerprintInput<'_> {
    fn canonical(&self) -> Canonical<'_> {
        Canonical {
            aspect_ratio: non_empty(self.aspect_ratio).map(str::to_ascii_lowercase),
            category: non_empty(self.category).map(str::to_lowercase),
            image_url: non_empty(self.image_url),
            prompt: non_empty(self.prompt),
            reference_image_urls: self
                .reference_image_urls
                .iter()
                .map(|url| url.trim())
                .filter(|url| !url.is_empty())
                .collect(),
            resolution: self.resolution.as_str(),
            seed: self.seed,
            // fixed precision so 0.5 and 0.50000001 from different clients agree
            strength: self.strength.map(|s| format!("{s:.3}")),
        }
    }
}

/// Hex SHA-256 over the canonical JSON form of `input`.
pub fn fingerprint(input: &FingerprintInput<'_>) -> String {
    let canonical = serde_json::to_vec(&input.canonical()).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(refs: &[String]) -> FingerprintInput<'_> {
        FingerprintInput {
            image_url: Some("https://x/a.jpg"),
            prompt: Some("enhance"),
            category: Some("Portrait"),
            strength: Some(0.5),
            seed: 42,
            resolution: Resolution::TwoK,
            aspect_ratio: None,
            reference_image_urls: refs,
        }
    }

    #[test]
    fn stable_and_hex() {
        let fp = fingerprint(&base(&[]));
        assert_eq!(fp, fingerprint(&base(&[])));
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn normalization_ignores_cosmetic_differences() {
        let a = fingerprint(&base(&[]));
        let b = fingerprint(&FingerprintInput {
            image_url: Some("  https://x/a.jpg "),
            category: Some("portrait"),
            strength: Some(0.500_000_1),
            aspect_ratio: Some("  "),
            ..base(&[])
        });
        assert_eq!(a, b);
    }

    #[test]
    fn any_parameter_change_is_a_new_fingerprint() {
        let refs = vec!["https://x/style.jpg".to_string()];
        let a = fingerprint(&base(&[]));
        assert_ne!(a, fingerprint(&FingerprintInput { seed: 43, ..base(&[]) }));
        assert_ne!(a, fingerprint(&FingerprintInput { prompt: Some("sharpen"), ..base(&[]) }));
        assert_ne!(
            a,
            fingerprint(&FingerprintInput { resolution: Resolution::FourK, ..base(&[]) })
        );
        assert_ne!(a, fingerprint(&FingerprintInput { strength: None, ..base(&[]) }));
        assert_ne!(a, fingerprint(&base(&refs)));
    }

    #[test]
    fn reference_order_matters() {
        let one = vec!["https://x/1.jpg".to_string(), "https://x/2.jpg".to_string()];
        let two = vec!["https://x/2.jpg".to_string(), "https://x/1.jpg".to_string()];
        assert_ne!(fingerprint(&base(&one)), fingerprint(&base(&two)));
    }
}
