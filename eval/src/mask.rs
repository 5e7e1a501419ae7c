//! Label masks: single-channel images whose pixel values are class labels.
//!
//! Masks are decoded with the `image` crate (TIFF by default). 0 is
//! background. 16-bit masks are accepted as long as every label fits in a
//! byte.

use std::path::Path;

use anyhow::{Context, Result, bail};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMask {
    image: GrayImage,
}

impl LabelMask {
    /// Row-major `labels`, exactly `width * height` of them.
    pub fn new(width: u32, height: u32, labels: Vec<u8>) -> Result<Self> {
        let got = labels.len();
        let Some(image) = GrayImage::from_raw(width, height, labels) else {
            bail!(
                "{width}x{height} mask needs {} labels, got {got}",
                width as usize * height as usize
            );
        };
        Ok(Self { image })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let image = image::open(path).with_context(|| format!("read mask {}", path.display()))?;
        Self::from_image(image).with_context(|| format!("decode mask {}", path.display()))
    }

    fn from_image(image: DynamicImage) -> Result<Self> {
        match image {
            DynamicImage::ImageLuma8(image) => Ok(Self { image }),
            DynamicImage::ImageLuma16(wide) => {
                let (width, height) = wide.dimensions();
                let labels = wide
                    .into_raw()
                    .into_iter()
                    .map(|label| {
                        u8::try_from(label)
                            .with_context(|| format!("label {label} does not fit in 8 bits"))
                    })
                    .collect::<Result<Vec<u8>>>()?;
                Self::new(width, height, labels)
            }
            other => bail!(
                "expected a single-channel label mask, found {:?}",
                other.color()
            ),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Row-major labels.
    pub fn labels(&self) -> &[u8] {
        self.image.as_raw()
    }

    /// Nearest-neighbour resample; never invents a label.
    pub fn resize(&self, width: u32, height: u32) -> LabelMask {
        if self.dimensions() == (width, height) {
            return self.clone();
        }
        Self {
            image: imageops::resize(&self.image, width, height, FilterType::Nearest),
        }
    }

    /// Encode by the extension of `path`.
    #[cfg(test)]
    pub fn save(&self, path: &Path) -> Result<()> {
        self.image
            .save(path)
            .with_context(|| format!("write mask {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use image::{ImageBuffer, Luma, RgbImage};

    use super::*;

    #[test]
    fn reads_back_a_tiff_mask() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("mask.tif");
        let mask = LabelMask::new(3, 2, vec![0, 1, 2, 3, 4, 5]).expect("mask");
        mask.save(&path).expect("save");

        let loaded = LabelMask::load(&path).expect("load");
        assert_eq!(loaded.dimensions(), (3, 2));
        assert_eq!(loaded.labels(), &[0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn accepts_sixteen_bit_masks_with_small_labels() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("wide.tif");
        let wide: ImageBuffer<Luma<u16>, Vec<u16>> =
            ImageBuffer::from_raw(2, 1, vec![5, 1]).expect("buffer");
        wide.save(&path).expect("save");
        assert_eq!(LabelMask::load(&path).expect("load").labels(), &[5, 1]);

        let too_wide: ImageBuffer<Luma<u16>, Vec<u16>> =
            ImageBuffer::from_raw(2, 1, vec![5, 300]).expect("buffer");
        too_wide.save(&path).expect("save");
        let err = LabelMask::load(&path).expect_err("label 300");
        assert!(format!("{err:#}").contains("label 300"));
    }

    #[test]
    fn rejects_colour_images_and_missing_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("rgb.tif");
        RgbImage::new(2, 2).save(&path).expect("save");
        let err = LabelMask::load(&path).expect_err("rgb");
        assert!(format!("{err:#}").contains("single-channel"));

        assert!(LabelMask::load(&temp.path().join("missing.tif")).is_err());
    }

    #[test]
    fn wrong_label_count_is_rejected() {
        assert!(LabelMask::new(2, 2, vec![1, 2, 3]).is_err());
    }

    #[test]
    fn upscales_by_repeating_pixels() {
        let mask = LabelMask::new(2, 1, vec![1, 2]).expect("mask");
        let resized = mask.resize(4, 2);
        assert_eq!(resized.dimensions(), (4, 2));
        assert_eq!(resized.labels(), &[1, 1, 2, 2, 1, 1, 2, 2]);
    }

    #[test]
    fn downscaling_keeps_labels_intact() {
        let mask = LabelMask::new(4, 1, vec![1, 1, 3, 3]).expect("mask");
        assert_eq!(mask.resize(2, 1).labels(), &[1, 3]);

        // Uneven ratio: only labels from the source may appear.
        let labels: Vec<u8> = (0..49).map(|n| if n % 3 == 0 { 5 } else { 2 }).collect();
        let mask = LabelMask::new(7, 7, labels).expect("mask");
        let seen: BTreeSet<u8> = mask.resize(3, 5).labels().iter().copied().collect();
        assert!(seen.is_subset(&BTreeSet::from([2, 5])), "{seen:?}");
    }
}
