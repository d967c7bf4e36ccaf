//! Image transformations applied after decode.
//!
//! A transformation's [`Transformation::key`] is part of the cache key, so
//! two transformations with equal keys must produce identical output.

use crate::decoder::DecodedImage;
use crate::error::LoadResult;
use crate::request::ImageSource;

/// Pure image-to-image function. Must not keep references to its input.
pub trait Transformation: Send + Sync {
    /// Stable identity of this transformation and its parameters.
    fn key(&self) -> String;

    fn transform(
        &self,
        image: DecodedImage,
        path: &str,
        source: ImageSource,
        is_placeholder: bool,
        key: &str,
    ) -> LoadResult<DecodedImage>;
}

/// Converts to grayscale using Rec. 601 luma weights. Alpha is preserved.
#[derive(Debug, Default, Clone, Copy)]
pub struct GrayscaleTransformation;

impl Transformation for GrayscaleTransformation {
    fn key(&self) -> String {
        "GrayscaleTransformation".to_string()
    }

    fn transform(
        &self,
        image: DecodedImage,
        _path: &str,
        _source: ImageSource,
        _is_placeholder: bool,
        _key: &str,
    ) -> LoadResult<DecodedImage> {
        let channels = image.channels as usize;
        if channels < 3 {
            return Ok(image);
        }

        let mut data = image.data.to_vec();
        for pixel in data.chunks_exact_mut(channels) {
            let luma = (0.299 * pixel[0] as f32 + 0.587 * pixel[1] as f32 + 0.114 * pixel[2] as f32)
                .round() as u8;
            pixel[0] = luma;
            pixel[1] = luma;
            pixel[2] = luma;
        }
        Ok(DecodedImage::new(data, image.width, image.height, image.channels))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipType {
    Horizontal,
    Vertical,
}

/// Mirrors the image along one axis.
#[derive(Debug, Clone, Copy)]
pub struct FlipTransformation {
    pub flip: FlipType,
}

impl FlipTransformation {
    pub fn horizontal() -> Self {
        Self {
            flip: FlipType::Horizontal,
        }
    }

    pub fn vertical() -> Self {
        Self {
            flip: FlipType::Vertical,
        }
    }
}

impl Transformation for FlipTransformation {
    fn key(&self) -> String {
        format!("FlipTransformation,Type={:?}", self.flip)
    }

    fn transform(
        &self,
        image: DecodedImage,
        _path: &str,
        _source: ImageSource,
        _is_placeholder: bool,
        _key: &str,
    ) -> LoadResult<DecodedImage> {
        let channels = image.channels as usize;
        let row_len = image.width as usize * channels;
        let mut data = Vec::with_capacity(image.data.len());

        for y in 0..image.height as usize {
            let src_y = match self.flip {
                FlipType::Vertical => image.height as usize - 1 - y,
                FlipType::Horizontal => y,
            };
            let row = &image.data[src_y * row_len..(src_y + 1) * row_len];
            match self.flip {
                FlipType::Vertical => data.extend_from_slice(row),
                FlipType::Horizontal => {
                    for pixel in row.chunks_exact(channels).rev() {
                        data.extend_from_slice(pixel);
                    }
                }
            }
        }
        Ok(DecodedImage::new(data, image.width, image.height, image.channels))
    }
}
