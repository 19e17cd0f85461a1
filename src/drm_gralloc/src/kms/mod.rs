// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! kms: the mode-setting collaborator the allocator context presents through.

mod drm_kms;
mod headless;

pub use drm_kms::DrmKms;
pub use headless::HeadlessKms;
pub use headless::HeadlessState;

use crate::formats::DrmFormat;
use crate::formats::FramebufferLayout;
use crate::formats::HAL_PIXEL_FORMAT_BGRA_8888;
use crate::gralloc_utils::GrallocResult;
use crate::gralloc_utils::Rect;

/// How a posted buffer reaches the screen.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SwapMode {
    /// Posting does nothing.
    Noop,
    /// Vsync'd page flips.  The first post after a mode change does a full modeset.
    Flip,
    /// The posted buffer is copied into a context-owned front buffer that stays on screen.
    Copy,
    /// Every post does a full modeset.
    SetCrtc,
}

/// Display behaviour chosen by the backend once mode-setting is up.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DisplayConfig {
    /// HAL format of the primary framebuffer.
    pub format: u32,
    /// Framebuffers must be flushed explicitly after they are presented.
    pub vmwgfx_quirk: bool,
    pub swap_mode: SwapMode,
    /// Page flips wait for vblank.
    pub sync_flip: bool,
    pub swap_interval: u32,
    /// Vblank events come from the secondary CRTC.
    pub vblank_secondary: bool,
}

impl Default for DisplayConfig {
    fn default() -> DisplayConfig {
        DisplayConfig {
            format: HAL_PIXEL_FORMAT_BGRA_8888,
            vmwgfx_quirk: false,
            swap_mode: SwapMode::Flip,
            sync_flip: true,
            swap_interval: 1,
            vblank_secondary: false,
        }
    }
}

/// The mode the primary display was brought up with.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    /// HAL format the display prefers.
    pub format: u32,
    /// Refresh rate in Hz, zero when unknown.
    pub refresh: u32,
    /// Physical size in millimetres, zero when unknown.
    pub mm_width: u32,
    pub mm_height: u32,
}

/// Everything the display needs to create a framebuffer.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FramebufferRequest {
    pub width: u32,
    pub height: u32,
    pub layout: FramebufferLayout,
    /// Backend-native buffer handle per plane.
    pub handles: [u32; 4],
}

/// Scanout configuration of an overlay plane.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PlaneConfig {
    pub fb_id: u32,
    pub dst: Rect,
    pub src: Rect,
}

/// Trait that needs to be implemented by a display subsystem.  The allocator context serializes
/// every call.
pub trait Kms: Send {
    /// Brings up the primary display and returns its mode.
    fn init(&mut self) -> GrallocResult<DisplayMode>;

    /// Waits for outstanding flips and releases display state.  Idempotent.
    fn fini(&mut self);

    /// Creates a framebuffer and returns its id.
    fn add_framebuffer(&mut self, request: &FramebufferRequest) -> GrallocResult<u32>;

    fn remove_framebuffer(&mut self, fb_id: u32) -> GrallocResult<()>;

    /// Full modeset of the primary display with `fb_id`.
    fn set_crtc(&mut self, fb_id: u32) -> GrallocResult<()>;

    /// Queues a flip to `fb_id` and returns without waiting for it to complete.
    fn page_flip(&mut self, fb_id: u32, sync: bool) -> GrallocResult<()>;

    /// Implementations must flush the contents of `fb_id` to the screen when the display does
    /// not track writes itself.
    fn flush(&mut self, _fb_id: u32) -> GrallocResult<()> {
        Ok(())
    }

    fn plane_count(&self) -> usize;

    /// Returns true if overlay plane `index` can scan out `format`.
    fn plane_supports(&self, index: usize, format: DrmFormat) -> bool;

    fn set_plane(&mut self, index: usize, config: &PlaneConfig) -> GrallocResult<()>;

    fn disable_plane(&mut self, index: usize) -> GrallocResult<()>;
}

/// Primary display properties as a framebuffer HAL wants them.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct KmsInfo {
    pub width: u32,
    pub height: u32,
    /// Stride in pixels.
    pub stride: u32,
    pub format: u32,
    pub xdpi: f32,
    pub ydpi: f32,
    pub fps: f32,
    pub min_swap_interval: u32,
    pub max_swap_interval: u32,
}

const DEFAULT_DPI: f32 = 160.0;
const DEFAULT_FPS: f32 = 60.0;

fn dpi(pixels: u32, millimetres: u32) -> f32 {
    if pixels == 0 || millimetres == 0 {
        DEFAULT_DPI
    } else {
        pixels as f32 * 25.4 / millimetres as f32
    }
}

impl KmsInfo {
    /// Describes `mode` presented with `config`.  `stride` is the aligned pixel width of the
    /// primary framebuffer.
    pub fn new(mode: &DisplayMode, config: &DisplayConfig, stride: u32) -> KmsInfo {
        let swap_interval = match config.swap_mode {
            SwapMode::Flip => config.swap_interval,
            _ => 0,
        };

        KmsInfo {
            width: mode.width,
            height: mode.height,
            stride,
            format: config.format,
            xdpi: dpi(mode.width, mode.mm_width),
            ydpi: dpi(mode.height, mode.mm_height),
            fps: if mode.refresh == 0 {
                DEFAULT_FPS
            } else {
                mode.refresh as f32
            },
            min_swap_interval: swap_interval,
            max_swap_interval: swap_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::HAL_PIXEL_FORMAT_RGB_565;

    #[test]
    fn kms_info_defaults() {
        let mode = DisplayMode {
            width: 1024,
            height: 768,
            format: HAL_PIXEL_FORMAT_BGRA_8888,
            ..Default::default()
        };

        let info = KmsInfo::new(&mode, &DisplayConfig::default(), 1024);
        assert_eq!(info.xdpi, DEFAULT_DPI);
        assert_eq!(info.ydpi, DEFAULT_DPI);
        assert_eq!(info.fps, DEFAULT_FPS);
        assert_eq!(info.min_swap_interval, 1);
        assert_eq!(info.max_swap_interval, 1);
    }

    #[test]
    fn kms_info_from_panel() {
        let mode = DisplayMode {
            width: 254,
            height: 508,
            format: HAL_PIXEL_FORMAT_RGB_565,
            refresh: 50,
            mm_width: 25,
            mm_height: 50,
        };
        let config = DisplayConfig {
            format: HAL_PIXEL_FORMAT_RGB_565,
            swap_mode: SwapMode::SetCrtc,
            ..Default::default()
        };

        let info = KmsInfo::new(&mode, &config, 256);
        assert!((info.xdpi - 258.06).abs() < 0.01);
        assert!((info.ydpi - 258.06).abs() < 0.01);
        assert_eq!(info.fps, 50.0);
        assert_eq!(info.stride, 256);
        assert_eq!(info.format, HAL_PIXEL_FORMAT_RGB_565);
        assert_eq!(info.max_swap_interval, 0);
    }
}
