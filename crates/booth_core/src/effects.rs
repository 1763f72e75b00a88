//! Post-capture colour effects applied to finished frames.
//!
//! Each effect is a chain of CSS-style filter functions evaluated in order on
//! straight RGB values in `0.0..=1.0`, then re-encoded as JPEG.

use std::{fmt, io::Cursor, str::FromStr};

use image::{codecs::jpeg::JpegEncoder, imageops, RgbImage};
use serde::{Deserialize, Serialize};
use shared::domain::Frame;
use thiserror::Error;
use tracing::debug;

pub const EFFECT_JPEG_QUALITY: u8 = 90;

#[derive(Debug, Error)]
pub enum EffectError {
    #[error("unknown effect '{0}'")]
    UnknownEffect(String),
    #[error("failed to decode frame: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode image: {0}")]
    Encode(#[source] image::ImageError),
    #[error("no frames to assemble")]
    NoFrames,
    #[error("output size must be non-zero, got {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    #[default]
    Original,
    Vintage,
    BlackWhite,
    Cool,
    Warm,
    Dramatic,
    Soft,
    Vibrant,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterOp {
    Sepia(f32),
    Saturate(f32),
    Grayscale(f32),
    HueRotate(f32),
    Brightness(f32),
    Contrast(f32),
    Blur(f32),
}

impl Effect {
    pub const ALL: [Effect; 8] = [
        Effect::Original,
        Effect::Vintage,
        Effect::BlackWhite,
        Effect::Cool,
        Effect::Warm,
        Effect::Dramatic,
        Effect::Soft,
        Effect::Vibrant,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Effect::Original => "original",
            Effect::Vintage => "vintage",
            Effect::BlackWhite => "blackwhite",
            Effect::Cool => "cool",
            Effect::Warm => "warm",
            Effect::Dramatic => "dramatic",
            Effect::Soft => "soft",
            Effect::Vibrant => "vibrant",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Effect::Original => "Original",
            Effect::Vintage => "Vintage",
            Effect::BlackWhite => "B&W",
            Effect::Cool => "Cool",
            Effect::Warm => "Warm",
            Effect::Dramatic => "Dramatic",
            Effect::Soft => "Soft",
            Effect::Vibrant => "Vibrant",
        }
    }

    pub fn filters(self) -> &'static [FilterOp] {
        use FilterOp::*;
        match self {
            Effect::Original => &[],
            Effect::Vintage => &[Sepia(0.8), Saturate(1.2), Contrast(1.1)],
            Effect::BlackWhite => &[Grayscale(1.0), Contrast(1.2)],
            Effect::Cool => &[HueRotate(180.0), Saturate(1.5)],
            Effect::Warm => &[HueRotate(30.0), Saturate(1.3), Brightness(1.1)],
            Effect::Dramatic => &[Contrast(1.5), Brightness(0.9), Saturate(1.2)],
            Effect::Soft => &[Blur(0.5), Brightness(1.1), Saturate(0.9)],
            Effect::Vibrant => &[Saturate(2.0), Contrast(1.2), Brightness(1.05)],
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Effect {
    type Err = EffectError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = value.trim();
        Effect::ALL
            .into_iter()
            .find(|effect| {
                effect.id().eq_ignore_ascii_case(wanted) || effect.label().eq_ignore_ascii_case(wanted)
            })
            .ok_or_else(|| EffectError::UnknownEffect(wanted.to_string()))
    }
}

type ColorMatrix = [[f32; 3]; 3];

fn sepia_matrix(amount: f32) -> ColorMatrix {
    let s = 1.0 - amount.clamp(0.0, 1.0);
    [
        [0.393 + 0.607 * s, 0.769 - 0.769 * s, 0.189 - 0.189 * s],
        [0.349 - 0.349 * s, 0.686 + 0.314 * s, 0.168 - 0.168 * s],
        [0.272 - 0.272 * s, 0.534 - 0.534 * s, 0.131 + 0.869 * s],
    ]
}

fn grayscale_matrix(amount: f32) -> ColorMatrix {
    let s = 1.0 - amount.clamp(0.0, 1.0);
    [
        [0.2126 + 0.7874 * s, 0.7152 - 0.7152 * s, 0.0722 - 0.0722 * s],
        [0.2126 - 0.2126 * s, 0.7152 + 0.2848 * s, 0.0722 - 0.0722 * s],
        [0.2126 - 0.2126 * s, 0.7152 - 0.7152 * s, 0.0722 + 0.9278 * s],
    ]
}

fn saturate_matrix(s: f32) -> ColorMatrix {
    [
        [0.213 + 0.787 * s, 0.715 - 0.715 * s, 0.072 - 0.072 * s],
        [0.213 - 0.213 * s, 0.715 + 0.285 * s, 0.072 - 0.072 * s],
        [0.213 - 0.213 * s, 0.715 - 0.715 * s, 0.072 + 0.928 * s],
    ]
}

fn hue_rotate_matrix(degrees: f32) -> ColorMatrix {
    let (sin, cos) = degrees.to_radians().sin_cos();
    [
        [
            0.213 + cos * 0.787 - sin * 0.213,
            0.715 - cos * 0.715 - sin * 0.715,
            0.072 - cos * 0.072 + sin * 0.928,
        ],
        [
            0.213 - cos * 0.213 + sin * 0.143,
            0.715 + cos * 0.285 + sin * 0.140,
            0.072 - cos * 0.072 - sin * 0.283,
        ],
        [
            0.213 - cos * 0.213 - sin * 0.787,
            0.715 - cos * 0.715 + sin * 0.715,
            0.072 + cos * 0.928 + sin * 0.072,
        ],
    ]
}

fn apply_matrix(rgb: [f32; 3], m: &ColorMatrix) -> [f32; 3] {
    let [r, g, b] = rgb;
    [
        (m[0][0] * r + m[0][1] * g + m[0][2] * b).clamp(0.0, 1.0),
        (m[1][0] * r + m[1][1] * g + m[1][2] * b).clamp(0.0, 1.0),
        (m[2][0] * r + m[2][1] * g + m[2][2] * b).clamp(0.0, 1.0),
    ]
}

/// Applies one per-pixel op. `Blur` is spatial and is a no-op here.
fn apply_pixel_op(rgb: [f32; 3], op: FilterOp) -> [f32; 3] {
    match op {
        FilterOp::Sepia(amount) => apply_matrix(rgb, &sepia_matrix(amount)),
        FilterOp::Grayscale(amount) => apply_matrix(rgb, &grayscale_matrix(amount)),
        FilterOp::Saturate(amount) => apply_matrix(rgb, &saturate_matrix(amount)),
        FilterOp::HueRotate(degrees) => apply_matrix(rgb, &hue_rotate_matrix(degrees)),
        FilterOp::Brightness(amount) => rgb.map(|c| (c * amount).clamp(0.0, 1.0)),
        FilterOp::Contrast(amount) => rgb.map(|c| ((c - 0.5) * amount + 0.5).clamp(0.0, 1.0)),
        FilterOp::Blur(_) => rgb,
    }
}

fn apply_filter_chain(image: RgbImage, ops: &[FilterOp]) -> RgbImage {
    let mut image = image;
    for op in ops {
        if let FilterOp::Blur(sigma) = *op {
            if sigma > 0.0 {
                image = imageops::blur(&image, sigma);
            }
            continue;
        }
        for pixel in image.pixels_mut() {
            let rgb = pixel.0.map(|c| c as f32 / 255.0);
            let out = apply_pixel_op(rgb, *op);
            pixel.0 = out.map(|c| (c * 255.0).round() as u8);
        }
    }
    image
}

pub(crate) fn decode_frame(frame: &Frame) -> Result<RgbImage, EffectError> {
    image::load_from_memory(frame.bytes())
        .map(|image| image.to_rgb8())
        .map_err(EffectError::Decode)
}

fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, EffectError> {
    let mut buffer = Cursor::new(Vec::new());
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, EFFECT_JPEG_QUALITY);
    encoder.encode_image(image).map_err(EffectError::Encode)?;
    Ok(buffer.into_inner())
}

/// Returns `frame` filtered by `effect`. `Original` hands back an untouched copy.
pub fn apply_effect(frame: &Frame, effect: Effect) -> Result<Frame, EffectError> {
    let ops = effect.filters();
    if ops.is_empty() {
        return Ok(frame.clone());
    }

    let image = decode_frame(frame)?;
    let (width, height) = image.dimensions();
    let filtered = apply_filter_chain(image, ops);
    let bytes = encode_jpeg(&filtered)?;
    debug!(%effect, width, height, bytes = bytes.len(), "effect applied");
    Ok(Frame::jpeg(bytes))
}

pub fn apply_to_all(frames: &[Frame], effect: Effect) -> Result<Vec<Frame>, EffectError> {
    frames
        .iter()
        .map(|frame| apply_effect(frame, effect))
        .collect()
}
