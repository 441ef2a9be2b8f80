//! Fingerprints and the distance functions the index is built on.
//!
//! A [`Hasher`] turns raw file bytes into an opaque [`Fingerprint`] and scores
//! two fingerprints as a similarity percentage. The index never looks inside a
//! fingerprint; it only asks a [`Metric`] for a small integer distance.

pub mod image;

pub use self::image::ImageHasher;

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HashError {
    #[error("Could not decode media: {0}")]
    Decode(String),

    #[error("Hasher produced an empty fingerprint")]
    Empty,
}

/// Serialized fingerprint as produced by a [`Hasher`].
///
/// The bytes are persisted verbatim, so two fingerprints are equal exactly
/// when their serialized forms are.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(Vec<u8>);

impl Fingerprint {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Hydrus filetypes a video fingerprinter is expected to handle.
pub const VIDEO_FILETYPES: &[&str] = &["video", "gif", "apng"];

/// Computes and compares fingerprints.
pub trait Hasher: Send + Sync {
    /// Fingerprint the raw bytes of one media file.
    fn compute(&self, bytes: &[u8]) -> Result<Fingerprint, HashError>;

    /// Similarity of two fingerprints in `0.0..=100.0`, higher is closer.
    fn similarity(&self, a: &Fingerprint, b: &Fingerprint) -> f64;

    /// Hydrus filetypes `compute` can decode. Media stores use this to avoid
    /// listing files that could only ever fail.
    fn filetypes(&self) -> &[&str] {
        VIDEO_FILETYPES
    }
}

/// Distance used to place and find fingerprints in the VP-tree.
///
/// Implementations must be symmetric. Search prunes with the triangle
/// inequality, so the closer a metric comes to satisfying it the fewer
/// neighbours near a sphere boundary are missed.
pub trait Metric {
    fn distance(&self, a: &Fingerprint, b: &Fingerprint) -> u32;
}

impl<M: Metric + ?Sized> Metric for &M {
    fn distance(&self, a: &Fingerprint, b: &Fingerprint) -> u32 {
        (**self).distance(a, b)
    }
}

/// Largest distance [`SimilarityMetric`] can produce.
pub const MAX_DISTANCE: u32 = 101;

/// Map a similarity percentage onto the tree's distance scale.
///
/// Identical inputs land on 1 rather than 0; the result is always in
/// `1..=MAX_DISTANCE`.
pub fn similarity_to_distance(similarity: f64) -> u32 {
    let similarity = similarity.clamp(0.0, 100.0).floor() as u32;
    (100 - similarity) + 1
}

/// Adapts a [`Hasher`]'s similarity score into a [`Metric`].
pub struct SimilarityMetric<'a> {
    hasher: &'a dyn Hasher,
}

impl<'a> SimilarityMetric<'a> {
    pub fn new(hasher: &'a dyn Hasher) -> Self {
        Self { hasher }
    }
}

impl Metric for SimilarityMetric<'_> {
    fn distance(&self, a: &Fingerprint, b: &Fingerprint) -> u32 {
        // Compare in a fixed order so a hasher with an asymmetric score still
        // yields a symmetric distance.
        let (a, b) = if a.as_bytes() <= b.as_bytes() { (a, b) } else { (b, a) };
        similarity_to_distance(self.hasher.similarity(a, b))
    }
}

/// Raw bit-level Hamming distance between serialized fingerprints.
#[derive(Debug, Default, Clone, Copy)]
pub struct HammingMetric;

impl Metric for HammingMetric {
    fn distance(&self, a: &Fingerprint, b: &Fingerprint) -> u32 {
        hamming_distance(a.as_bytes(), b.as_bytes())
    }
}

/// Number of differing bits. Bytes past the end of the shorter input count as
/// fully different.
pub fn hamming_distance(a: &[u8], b: &[u8]) -> u32 {
    let common: u32 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum();
    let tail = a.len().abs_diff(b.len()) as u32 * 8;
    common + tail
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedHasher(f64);

    impl Hasher for FixedHasher {
        fn compute(&self, bytes: &[u8]) -> Result<Fingerprint, HashError> {
            Ok(Fingerprint::from_bytes(bytes))
        }

        fn similarity(&self, _a: &Fingerprint, _b: &Fingerprint) -> f64 {
            self.0
        }
    }

    #[test]
    fn test_similarity_to_distance_range() {
        assert_eq!(similarity_to_distance(100.0), 1);
        assert_eq!(similarity_to_distance(99.9), 2);
        assert_eq!(similarity_to_distance(50.0), 51);
        assert_eq!(similarity_to_distance(0.0), MAX_DISTANCE);
        assert_eq!(similarity_to_distance(-3.0), MAX_DISTANCE);
        assert_eq!(similarity_to_distance(250.0), 1);
    }

    #[test]
    fn test_similarity_metric_is_positive() {
        let hasher = FixedHasher(100.0);
        let metric = SimilarityMetric::new(&hasher);
        let a = Fingerprint::from_bytes(vec![1, 2, 3]);
        assert_eq!(metric.distance(&a, &a), 1);
    }

    #[test]
    fn test_similarity_metric_is_symmetric() {
        struct Lopsided;
        impl Hasher for Lopsided {
            fn compute(&self, bytes: &[u8]) -> Result<Fingerprint, HashError> {
                Ok(Fingerprint::from_bytes(bytes))
            }
            fn similarity(&self, a: &Fingerprint, _b: &Fingerprint) -> f64 {
                a.as_bytes()[0] as f64
            }
        }

        let metric = SimilarityMetric::new(&Lopsided);
        let a = Fingerprint::from_bytes(vec![10]);
        let b = Fingerprint::from_bytes(vec![90]);
        assert_eq!(metric.distance(&a, &b), metric.distance(&b, &a));
    }

    #[test]
    fn test_hamming_distance() {
        assert_eq!(hamming_distance(&[0b0000_0000], &[0b0000_0011]), 2);
        assert_eq!(hamming_distance(&[0xff], &[0xfe]), 1);
        assert_eq!(hamming_distance(&[0xff, 0x00], &[0xff]), 8);
        assert_eq!(hamming_distance(&[], &[]), 0);
    }

    #[test]
    fn test_fingerprint_display_is_hex() {
        let fp = Fingerprint::from_bytes(vec![0x0a, 0xff]);
        assert_eq!(fp.to_string(), "0aff");
    }
}
