//! Snapshot codec: encodes and decodes layer rasters as PNG blobs.
//!
//! Everything that crosses a persistence or wire boundary as "an image"
//! goes through this module, so the rest of the crate never touches the
//! `image` crate directly.

use std::io::Cursor;

use image::{ImageFormat, RgbaImage};
use thiserror::Error;

/// File extension used for persisted snapshots.
pub const SNAPSHOT_EXT: &str = "png";

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("not a valid snapshot blob")]
    Decode(#[source] image::ImageError),
    #[error("snapshot encoding failed")]
    Encode(#[source] image::ImageError),
    #[error("buffer length {len} does not match {width}x{height} RGBA")]
    BufferSize { width: u32, height: u32, len: usize },
}

/// A decoded RGBA raster.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA bytes, `width * height * 4` long.
    pub data: Vec<u8>,
}

/// Decode a snapshot blob into an RGBA raster.
pub fn decode(blob: &[u8]) -> Result<Decoded, CodecError> {
    let img = image::load_from_memory_with_format(blob, ImageFormat::Png)
        .map_err(CodecError::Decode)?
        .to_rgba8();
    let (width, height) = img.dimensions();
    Ok(Decoded {
        width,
        height,
        data: img.into_raw(),
    })
}

/// Encode an RGBA raster into a snapshot blob.
pub fn encode(width: u32, height: u32, rgba: &[u8]) -> Result<Vec<u8>, CodecError> {
    let img = RgbaImage::from_raw(width, height, rgba.to_vec()).ok_or(CodecError::BufferSize {
        width,
        height,
        len: rgba.len(),
    })?;
    let mut blob = Vec::new();
    img.write_to(&mut Cursor::new(&mut blob), ImageFormat::Png)
        .map_err(CodecError::Encode)?;
    Ok(blob)
}
