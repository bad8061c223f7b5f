use std::sync::Arc;

use render_protocol::GpuResourceId;
use tracing::warn;

const RGBA8_BYTES: usize = 4;

/// Decoded raster overlay image, RGBA8, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OverlayOptions {
    pub generate_mipmaps: bool,
}

/// Worker-thread half of an overlay texture. Not `Clone`: it is consumed
/// by finalization or dropped by release, never both.
#[derive(Debug, PartialEq)]
pub struct StagedOverlayTexture {
    width: u32,
    height: u32,
    levels: Vec<Vec<u8>>,
}

impl StagedOverlayTexture {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn mip_level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn byte_size(&self) -> u64 {
        self.levels.iter().map(|level| level.len() as u64).sum()
    }
}

pub(crate) fn stage_overlay(
    image: OverlayImage,
    options: OverlayOptions,
) -> Option<StagedOverlayTexture> {
    let OverlayImage {
        width,
        height,
        pixels,
    } = image;
    if width == 0 || height == 0 {
        return None;
    }
    let expected = width as usize * height as usize * RGBA8_BYTES;
    if pixels.len() != expected {
        warn!(
            width,
            height,
            found = pixels.len(),
            expected,
            "overlay image size does not match its dimensions"
        );
        return None;
    }

    let mut levels = vec![pixels];
    if options.generate_mipmaps {
        let (mut level_width, mut level_height) = (width, height);
        while level_width > 1 || level_height > 1 {
            let Some(previous) = levels.last() else {
                break;
            };
            let next = downsample(previous, level_width, level_height);
            level_width = (level_width / 2).max(1);
            level_height = (level_height / 2).max(1);
            levels.push(next);
        }
    }

    Some(StagedOverlayTexture {
        width,
        height,
        levels,
    })
}

/// 2x2 box filter. Odd edges clamp to the last texel.
fn downsample(source: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (width, height) = (width as usize, height as usize);
    let next_width = (width / 2).max(1);
    let next_height = (height / 2).max(1);
    let mut out = Vec::with_capacity(next_width * next_height * RGBA8_BYTES);
    for y in 0..next_height {
        for x in 0..next_width {
            let xs = [(x * 2).min(width - 1), (x * 2 + 1).min(width - 1)];
            let ys = [(y * 2).min(height - 1), (y * 2 + 1).min(height - 1)];
            for channel in 0..RGBA8_BYTES {
                let sum: u32 = ys
                    .iter()
                    .flat_map(|sy| xs.iter().map(move |sx| (*sx, *sy)))
                    .map(|(sx, sy)| u32::from(source[(sy * width + sx) * RGBA8_BYTES + channel]))
                    .sum();
                out.push(((sum + 2) / 4) as u8);
            }
        }
    }
    out
}

#[derive(Debug)]
struct OverlayTextureInner {
    resource: GpuResourceId,
    width: u32,
    height: u32,
    mip_levels: usize,
}

/// Owner-thread overlay texture. Cloning shares the GPU texture; it is
/// retired when the last holder lets go through the bridge.
#[derive(Debug, Clone)]
pub struct OverlayTexture(Arc<OverlayTextureInner>);

impl OverlayTexture {
    pub(crate) fn new(resource: GpuResourceId, staged: &StagedOverlayTexture) -> Self {
        Self(Arc::new(OverlayTextureInner {
            resource,
            width: staged.width,
            height: staged.height,
            mip_levels: staged.levels.len(),
        }))
    }

    pub fn resource(&self) -> GpuResourceId {
        self.0.resource
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.0.width, self.0.height)
    }

    pub fn mip_levels(&self) -> usize {
        self.0.mip_levels
    }

    pub fn holder_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// The resource if this is the last holder.
    pub(crate) fn into_last_resource(self) -> Option<GpuResourceId> {
        Arc::into_inner(self.0).map(|inner| inner.resource)
    }
}

impl PartialEq for OverlayTexture {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for OverlayTexture {}
