use std::time::Duration;

use image::{
    codecs::gif::{GifEncoder, Repeat},
    imageops::{self, FilterType},
    Delay,
};
use shared::domain::Frame;
use tracing::debug;

use crate::effects::EffectError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GifOptions {
    pub width: u32,
    pub height: u32,
    pub frame_delay: Duration,
    /// Encoder speed, 1 (best quality) to 30 (fastest).
    pub speed: i32,
}

impl Default for GifOptions {
    fn default() -> Self {
        Self {
            width: 400,
            height: 400,
            frame_delay: Duration::from_millis(500),
            speed: 10,
        }
    }
}

/// Builds a looping GIF from `frames`, each resized to the requested size.
pub fn assemble_gif(frames: &[Frame], options: &GifOptions) -> Result<Vec<u8>, EffectError> {
    if frames.is_empty() {
        return Err(EffectError::NoFrames);
    }
    if options.width == 0 || options.height == 0 {
        return Err(EffectError::InvalidSize {
            width: options.width,
            height: options.height,
        });
    }

    let delay = Delay::from_saturating_duration(options.frame_delay);
    let mut animation = Vec::with_capacity(frames.len());
    for frame in frames {
        let decoded = image::load_from_memory(frame.bytes())
            .map_err(EffectError::Decode)?
            .to_rgba8();
        let resized = imageops::resize(&decoded, options.width, options.height, FilterType::Triangle);
        animation.push(image::Frame::from_parts(resized, 0, 0, delay));
    }

    let mut bytes = Vec::new();
    {
        let mut encoder = GifEncoder::new_with_speed(&mut bytes, options.speed.clamp(1, 30));
        encoder
            .set_repeat(Repeat::Infinite)
            .map_err(EffectError::Encode)?;
        encoder
            .encode_frames(animation)
            .map_err(EffectError::Encode)?;
    }

    debug!(
        frames = frames.len(),
        width = options.width,
        height = options.height,
        bytes = bytes.len(),
        "gif assembled"
    );
    Ok(bytes)
}
