// Image decoding for texture uploads

use std::path::Path;

use super::ImageDecoder;

/// Tightly packed RGBA8 pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl DecodedImage {
    /// 1x1 image of a single color, used when no texture is available.
    pub fn solid_color(rgba: [u8; 4]) -> Self {
        Self {
            width: 1,
            height: 1,
            pixels: rgba.to_vec(),
        }
    }
}

/// Decodes anything the `image` crate understands into RGBA8.
#[derive(Debug, Default, Clone, Copy)]
pub struct RgbaDecoder;

impl ImageDecoder for RgbaDecoder {
    fn decode(&self, path: &Path) -> Option<DecodedImage> {
        match image::open(path) {
            Ok(img) => {
                let rgba = img.to_rgba8();
                let (width, height) = rgba.dimensions();
                log::debug!("Decoded {:?}: {}x{}", path, width, height);
                Some(DecodedImage {
                    width,
                    height,
                    pixels: rgba.into_raw(),
                })
            }
            Err(e) => {
                log::warn!("Failed to decode image {:?}: {}", path, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solid_color_is_one_pixel() {
        let white = DecodedImage::solid_color([255; 4]);
        assert_eq!((white.width, white.height), (1, 1));
        assert_eq!(white.pixels, vec![255, 255, 255, 255]);
    }

    #[test]
    fn decodes_png_to_rgba() {
        let path = std::env::temp_dir().join(format!("deferred-vk-{}-tex.png", std::process::id()));
        let img = image::RgbImage::from_pixel(2, 3, image::Rgb([10, 20, 30]));
        img.save(&path).unwrap();

        let decoded = RgbaDecoder.decode(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!((decoded.width, decoded.height), (2, 3));
        assert_eq!(decoded.pixels.len(), 2 * 3 * 4);
        assert_eq!(&decoded.pixels[..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn unreadable_file_yields_none() {
        assert!(RgbaDecoder.decode(Path::new("missing/texture.png")).is_none());
    }
}
