use img_hash::HasherConfig;

use super::{hamming_distance, Fingerprint, HashError, Hasher};

/// Gradient hash of the first frame of a still or animated image (GIF, APNG,
/// WebP, ...). Decoders for real video containers plug in through [`Hasher`]
/// the same way.
pub struct ImageHasher {
    side: u32,
}

impl ImageHasher {
    pub fn new() -> Self {
        Self::with_hash_size(16)
    }

    pub fn with_hash_size(side: u32) -> Self {
        Self { side: side.max(1) }
    }
}

impl Default for ImageHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for ImageHasher {
    fn compute(&self, bytes: &[u8]) -> Result<Fingerprint, HashError> {
        let img = ::image::load_from_memory(bytes).map_err(|e| HashError::Decode(e.to_string()))?;

        // thumbnail() keeps the aspect ratio and is much cheaper than resize
        let thumbnail = img.thumbnail(64, 64);
        let rgba = thumbnail.to_rgba8();
        let (width, height) = rgba.dimensions();

        // img_hash links its own copy of the image crate
        let frame = img_hash::image::RgbaImage::from_raw(width, height, rgba.into_raw())
            .ok_or_else(|| HashError::Decode("frame buffer size mismatch".to_string()))?;
        let hasher = HasherConfig::new().hash_size(self.side, self.side).to_hasher();
        let hash = hasher.hash_image(&img_hash::image::DynamicImage::ImageRgba8(frame));

        let fingerprint = Fingerprint::from_bytes(hash.as_bytes().to_vec());
        if fingerprint.is_empty() {
            return Err(HashError::Empty);
        }
        Ok(fingerprint)
    }

    fn similarity(&self, a: &Fingerprint, b: &Fingerprint) -> f64 {
        let bits = (self.side * self.side).max(8 * a.as_bytes().len().max(b.as_bytes().len()) as u32);
        let dist = hamming_distance(a.as_bytes(), b.as_bytes()).min(bits);
        100.0 * (1.0 - dist as f64 / bits as f64)
    }

    /// Only animated images decode; video containers do not.
    fn filetypes(&self) -> &[&str] {
        &["gif", "apng"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn encode_png(img: RgbImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
        bytes
    }

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, _| {
            let v = (x * 255 / width.max(1)) as u8;
            Rgb([v, v, v])
        })
    }

    #[test]
    fn test_compute_rejects_garbage() {
        let hasher = ImageHasher::new();
        let err = hasher.compute(b"definitely not an image").unwrap_err();
        assert!(matches!(err, HashError::Decode(_)));
    }

    #[test]
    fn test_video_container_is_not_advertised() {
        let hasher = ImageHasher::new();
        let mp4_header = b"\x00\x00\x00\x18ftypmp42\x00\x00\x00\x00mp42isom";
        assert!(matches!(hasher.compute(mp4_header), Err(HashError::Decode(_))));

        assert!(!hasher.filetypes().contains(&"video"));
        assert_eq!(hasher.filetypes(), ["gif", "apng"]);
    }

    #[test]
    fn test_rescaled_copy_is_similar() {
        let hasher = ImageHasher::new();
        let original = hasher.compute(&encode_png(gradient(256, 128))).unwrap();
        let smaller = hasher.compute(&encode_png(gradient(128, 64))).unwrap();

        assert_eq!(original.as_bytes().len(), 32);
        assert!(hasher.similarity(&original, &smaller) > 90.0);
        assert_eq!(hasher.similarity(&original, &original), 100.0);
    }

    #[test]
    fn test_inverted_image_is_dissimilar() {
        let hasher = ImageHasher::new();
        let img = gradient(256, 128);
        let mut inverted = img.clone();
        for pixel in inverted.pixels_mut() {
            pixel.0 = [255 - pixel.0[0], 255 - pixel.0[1], 255 - pixel.0[2]];
        }

        let a = hasher.compute(&encode_png(img)).unwrap();
        let b = hasher.compute(&encode_png(inverted)).unwrap();
        assert!(hasher.similarity(&a, &b) < 50.0);
    }
}
