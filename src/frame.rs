use crate::error::{ProcessingError, ReadError};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, GrayImage, Luma};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

/// Identifier of one of the two feeder cameras
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraId {
    /// Wide view of the feeder approach
    CritterCam,
    /// Close-up of the nut tray
    NutCam,
}

impl CameraId {
    pub const ALL: [CameraId; 2] = [CameraId::CritterCam, CameraId::NutCam];

    pub fn as_str(&self) -> &'static str {
        match self {
            CameraId::CritterCam => "critter_cam",
            CameraId::NutCam => "nut_cam",
        }
    }

    /// Human-facing label used in log lines
    pub fn label(&self) -> &'static str {
        match self {
            CameraId::CritterCam => "CritterCam",
            CameraId::NutCam => "NutCam",
        }
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CameraId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "critter_cam" | "CritterCam" => Ok(CameraId::CritterCam),
            "nut_cam" | "NutCam" => Ok(CameraId::NutCam),
            other => Err(format!("unknown camera id '{}'", other)),
        }
    }
}

/// Pixel layout of a frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Packed 8-bit RGB, the canonical layout handed to consumers
    Rgb24,
    /// Single 8-bit intensity channel
    Gray8,
    /// YUV 4:2:2 packed (Y0 U Y1 V)
    Yuyv,
    /// YUV 4:2:0 planar (Y plane, then U, then V)
    I420,
    /// JPEG compressed still
    Jpeg,
}

impl PixelFormat {
    /// Expected buffer size for uncompressed formats
    pub fn expected_size(&self, width: u32, height: u32) -> Option<usize> {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Rgb24 => Some(pixels * 3),
            PixelFormat::Gray8 => Some(pixels),
            PixelFormat::Yuyv => Some(pixels * 2),
            PixelFormat::I420 => Some(pixels + 2 * ((width as usize / 2) * (height as usize / 2))),
            PixelFormat::Jpeg => None,
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::Jpeg)
    }
}

/// A captured frame. The pixel buffer is shared and never mutated after capture.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Per-camera sequence number
    pub id: u64,
    /// Capture wall-clock time
    pub timestamp: SystemTime,
    pub data: Arc<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Frame {
    pub fn new(
        id: u64,
        timestamp: SystemTime,
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Self {
        Self {
            id,
            timestamp,
            data: Arc::new(data),
            width,
            height,
            format,
        }
    }

    /// Build a canonical RGB frame stamped with the current time
    pub fn rgb(id: u64, width: u32, height: u32, data: Vec<u8>) -> Self {
        Self::new(id, SystemTime::now(), data, width, height, PixelFormat::Rgb24)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Check the buffer length against the declared format and dimensions
    pub fn validate_size(&self) -> bool {
        match self.format.expected_size(self.width, self.height) {
            Some(expected) => self.data.len() == expected,
            None => !self.data.is_empty(),
        }
    }

    pub fn age_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(self.timestamp)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Convert a backend-native frame into packed RGB24
    pub fn into_rgb(self) -> std::result::Result<Frame, ReadError> {
        if !self.validate_size() {
            return Err(ReadError::malformed(format!(
                "{:?} frame {} ({}x{}) has unexpected size {}",
                self.format,
                self.id,
                self.width,
                self.height,
                self.data.len()
            )));
        }

        let (width, height, rgb) = match self.format {
            PixelFormat::Rgb24 => return Ok(self),
            PixelFormat::Gray8 => (self.width, self.height, gray_to_rgb(&self.data)),
            PixelFormat::Yuyv => (
                self.width,
                self.height,
                yuyv_to_rgb(&self.data, self.width, self.height),
            ),
            PixelFormat::I420 => (
                self.width,
                self.height,
                i420_to_rgb(&self.data, self.width, self.height),
            ),
            PixelFormat::Jpeg => {
                let decoded = image::load_from_memory(&self.data)
                    .map_err(|e| ReadError::malformed(format!("JPEG decode failed: {}", e)))?
                    .to_rgb8();
                let (w, h) = decoded.dimensions();
                (w, h, decoded.into_raw())
            }
        };

        Ok(Frame {
            id: self.id,
            timestamp: self.timestamp,
            data: Arc::new(rgb),
            width,
            height,
            format: PixelFormat::Rgb24,
        })
    }

    /// Single-channel intensity image for analysis
    pub fn to_gray(&self) -> std::result::Result<GrayImage, ProcessingError> {
        if self.width == 0 || self.height == 0 {
            return Err(ProcessingError::malformed(format!(
                "frame {} has zero dimension ({}x{})",
                self.id, self.width, self.height
            )));
        }

        match self.format {
            PixelFormat::Gray8 => {
                GrayImage::from_raw(self.width, self.height, self.data.to_vec()).ok_or_else(|| {
                    ProcessingError::malformed(format!(
                        "gray frame {} has {} bytes for {}x{}",
                        self.id,
                        self.data.len(),
                        self.width,
                        self.height
                    ))
                })
            }
            PixelFormat::Rgb24 => {
                if !self.validate_size() {
                    return Err(ProcessingError::malformed(format!(
                        "RGB frame {} has {} bytes for {}x{}",
                        self.id,
                        self.data.len(),
                        self.width,
                        self.height
                    )));
                }
                let mut gray = GrayImage::new(self.width, self.height);
                for (pixel, rgb) in gray.pixels_mut().zip(self.data.chunks_exact(3)) {
                    *pixel = Luma([luminance(rgb[0], rgb[1], rgb[2])]);
                }
                Ok(gray)
            }
            _ => {
                let rgb = self
                    .clone()
                    .into_rgb()
                    .map_err(|e| ProcessingError::malformed(e.to_string()))?;
                rgb.to_gray()
            }
        }
    }

    /// Compress the frame as JPEG at the given quality (1-100)
    pub fn encode_jpeg(&self, quality: u8) -> std::result::Result<Bytes, ProcessingError> {
        let (data, color) = match self.format {
            PixelFormat::Jpeg => return Ok(Bytes::from(self.data.to_vec())),
            PixelFormat::Rgb24 => (Arc::clone(&self.data), ColorType::Rgb8),
            PixelFormat::Gray8 => (Arc::clone(&self.data), ColorType::L8),
            _ => {
                let rgb = self.clone().into_rgb().map_err(|e| ProcessingError::Encoding {
                    details: e.to_string(),
                })?;
                (rgb.data, ColorType::Rgb8)
            }
        };

        if !self.format.is_compressed() && !self.validate_size() {
            return Err(ProcessingError::Encoding {
                details: format!("frame {} buffer does not match its dimensions", self.id),
            });
        }

        let mut buf = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
        encoder
            .encode(&data, self.width, self.height, color)
            .map_err(|e| ProcessingError::Encoding {
                details: e.to_string(),
            })?;

        Ok(Bytes::from(buf))
    }
}

fn luminance(r: u8, g: u8, b: u8) -> u8 {
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32).round() as u8
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;
    let r = y + 1.402 * v;
    let g = y - 0.344_136 * u - 0.714_136 * v;
    let b = y + 1.772 * u;
    [
        r.round().clamp(0.0, 255.0) as u8,
        g.round().clamp(0.0, 255.0) as u8,
        b.round().clamp(0.0, 255.0) as u8,
    ]
}

fn gray_to_rgb(data: &[u8]) -> Vec<u8> {
    data.iter().flat_map(|&v| [v, v, v]).collect()
}

fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    // Y0 U Y1 V covers two pixels
    for quad in data.chunks_exact(4) {
        rgb.extend_from_slice(&yuv_to_rgb(quad[0], quad[1], quad[3]));
        rgb.extend_from_slice(&yuv_to_rgb(quad[2], quad[1], quad[3]));
    }
    rgb.truncate(width as usize * height as usize * 3);
    rgb
}

fn i420_to_rgb(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let chroma_w = w / 2;
    let chroma_h = h / 2;
    let y_plane = &data[..w * h];
    let u_plane = &data[w * h..w * h + chroma_w * chroma_h];
    let v_plane = &data[w * h + chroma_w * chroma_h..];

    let mut rgb = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        let chroma_row = (row / 2).min(chroma_h.saturating_sub(1));
        for col in 0..w {
            let chroma_col = (col / 2).min(chroma_w.saturating_sub(1));
            let ci = chroma_row * chroma_w + chroma_col;
            let (u, v) = match (u_plane.get(ci), v_plane.get(ci)) {
                (Some(&u), Some(&v)) => (u, v),
                _ => (128, 128),
            };
            rgb.extend_from_slice(&yuv_to_rgb(y_plane[row * w + col], u, v));
        }
    }
    rgb
}
