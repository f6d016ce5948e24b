//! Freeze-frame images for pseudo-pause

use std::io::Read;
use std::path::Path;

use crate::capture::traits::{PixelFormat, VideoFrame};
use crate::utils::error::{RecorderError, RecorderResult};

/// Still image written in place of live video while pseudo-paused
#[derive(Debug, Clone)]
pub struct FreezeFrame {
    frame: VideoFrame,
}

impl FreezeFrame {
    pub fn from_frame(frame: VideoFrame) -> Self {
        Self { frame }
    }

    /// Wrap tightly packed RGBA pixels
    pub fn from_rgba(data: Vec<u8>, width: u32, height: u32) -> RecorderResult<Self> {
        let frame = VideoFrame::new(data, width, height, PixelFormat::Rgba);
        if !frame.is_well_formed() {
            return Err(RecorderError::Image(format!(
                "Expected {} bytes for a {}x{} RGBA image, got {}",
                PixelFormat::Rgba.frame_size(width, height),
                width,
                height,
                frame.data.len()
            )));
        }
        Ok(Self { frame })
    }

    pub fn from_png_file(path: &Path) -> RecorderResult<Self> {
        let file = std::fs::File::open(path)?;
        Self::decode_png(file)
    }

    pub fn from_png_bytes(bytes: &[u8]) -> RecorderResult<Self> {
        Self::decode_png(bytes)
    }

    fn decode_png<R: Read>(source: R) -> RecorderResult<Self> {
        let mut decoder = png::Decoder::new(source);
        decoder.set_transformations(png::Transformations::EXPAND);
        let mut reader = decoder
            .read_info()
            .map_err(|e| RecorderError::Image(format!("PNG decode error: {}", e)))?;

        let mut buf = vec![0; reader.output_buffer_size()];
        let info = reader
            .next_frame(&mut buf)
            .map_err(|e| RecorderError::Image(format!("PNG frame error: {}", e)))?;

        if info.bit_depth != png::BitDepth::Eight {
            return Err(RecorderError::Image(format!(
                "Unsupported PNG bit depth: {:?}",
                info.bit_depth
            )));
        }

        let pixels = &buf[..info.buffer_size()];
        let data = match info.color_type {
            png::ColorType::Rgba => pixels.to_vec(),
            png::ColorType::Rgb => {
                let mut rgba = Vec::with_capacity(pixels.len() / 3 * 4);
                for chunk in pixels.chunks(3) {
                    rgba.extend_from_slice(chunk);
                    rgba.push(255);
                }
                rgba
            }
            png::ColorType::Grayscale => pixels.iter().flat_map(|&l| [l, l, l, 255]).collect(),
            png::ColorType::GrayscaleAlpha => pixels
                .chunks(2)
                .flat_map(|c| [c[0], c[0], c[0], c[1]])
                .collect(),
            other => {
                return Err(RecorderError::Image(format!(
                    "Unsupported PNG color type: {:?}",
                    other
                )));
            }
        };

        Self::from_rgba(data, info.width, info.height)
    }

    pub fn frame(&self) -> &VideoFrame {
        &self.frame
    }

    /// Convert to the geometry and pixel format a writer is encoding.
    ///
    /// The image is scaled nearest-neighbour and converted to RGBA, BGRA,
    /// NV12 or YUYV422 (BT.601 limited range). Returns `None` when the source
    /// is not packed 32-bit or the target size cannot hold the format's
    /// chroma subsampling.
    pub fn fit(&self, width: u32, height: u32, format: PixelFormat) -> Option<VideoFrame> {
        let source = &self.frame;
        if source.width == width && source.height == height && source.pixel_format == format {
            return Some(source.clone());
        }
        if !source.pixel_format.is_packed_32() || width == 0 || height == 0 {
            return None;
        }

        let rgba = self.scaled_rgba(width, height)?;
        let data = match format {
            PixelFormat::Rgba => rgba,
            PixelFormat::Bgra => rgba
                .chunks_exact(4)
                .flat_map(|px| [px[2], px[1], px[0], px[3]])
                .collect(),
            PixelFormat::Nv12 => rgba_to_nv12(&rgba, width as usize, height as usize)?,
            PixelFormat::Yuyv422 => rgba_to_yuyv422(&rgba, width as usize, height as usize)?,
        };

        Some(VideoFrame::new(data, width, height, format))
    }

    fn scaled_rgba(&self, width: u32, height: u32) -> Option<Vec<u8>> {
        let source = &self.frame;
        let bgra = source.pixel_format == PixelFormat::Bgra;
        let mut data = Vec::with_capacity(PixelFormat::Rgba.frame_size(width, height));
        for y in 0..height as usize {
            let sy = y * source.height as usize / height as usize;
            for x in 0..width as usize {
                let sx = x * source.width as usize / width as usize;
                let i = (sy * source.width as usize + sx) * 4;
                let px = source.data.get(i..i + 4)?;
                if bgra {
                    data.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
                } else {
                    data.extend_from_slice(px);
                }
            }
        }
        Some(data)
    }
}

fn luma(r: i32, g: i32, b: i32) -> u8 {
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16) as u8
}

fn chroma(r: i32, g: i32, b: i32) -> (u8, u8) {
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (u as u8, v as u8)
}

/// Average colour of the given RGBA pixel offsets
fn average(rgba: &[u8], offsets: &[usize]) -> (i32, i32, i32) {
    let n = offsets.len() as i32;
    let sum = offsets.iter().fold((0, 0, 0), |(r, g, b), &i| {
        (r + rgba[i] as i32, g + rgba[i + 1] as i32, b + rgba[i + 2] as i32)
    });
    (sum.0 / n, sum.1 / n, sum.2 / n)
}

fn rgba_to_nv12(rgba: &[u8], width: usize, height: usize) -> Option<Vec<u8>> {
    if width % 2 != 0 || height % 2 != 0 {
        return None;
    }

    let mut data = Vec::with_capacity(width * height * 3 / 2);
    for px in rgba.chunks_exact(4) {
        data.push(luma(px[0] as i32, px[1] as i32, px[2] as i32));
    }
    for y in (0..height).step_by(2) {
        for x in (0..width).step_by(2) {
            let top = (y * width + x) * 4;
            let bottom = ((y + 1) * width + x) * 4;
            let (r, g, b) = average(rgba, &[top, top + 4, bottom, bottom + 4]);
            let (u, v) = chroma(r, g, b);
            data.extend_from_slice(&[u, v]);
        }
    }
    Some(data)
}

fn rgba_to_yuyv422(rgba: &[u8], width: usize, height: usize) -> Option<Vec<u8>> {
    if width % 2 != 0 {
        return None;
    }

    let mut data = Vec::with_capacity(width * height * 2);
    for pair in rgba.chunks_exact(8) {
        let y0 = luma(pair[0] as i32, pair[1] as i32, pair[2] as i32);
        let y1 = luma(pair[4] as i32, pair[5] as i32, pair[6] as i32);
        let (r, g, b) = average(pair, &[0, 4]);
        let (u, v) = chroma(r, g, b);
        data.extend_from_slice(&[y0, u, y1, v]);
    }
    Some(data)
}
