// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An in-memory display.  Useful for off-screen composition and for exercising the presentation
//! paths without a KMS driver.

use std::collections::BTreeMap as Map;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use log::debug;
use nix::errno::Errno;

use crate::formats::DrmFormat;
use crate::formats::HAL_PIXEL_FORMAT_BGRA_8888;
use crate::gralloc_utils::*;
use crate::kms::DisplayMode;
use crate::kms::FramebufferRequest;
use crate::kms::Kms;
use crate::kms::PlaneConfig;

const HEADLESS_DEFAULT_WIDTH: u32 = 1280;
const HEADLESS_DEFAULT_HEIGHT: u32 = 1024;

/// Everything the headless display has been asked to do.
#[derive(Debug, Default)]
pub struct HeadlessState {
    pub initialized: bool,
    pub framebuffers: Map<u32, FramebufferRequest>,
    /// Framebuffer currently scanned out by the primary display.
    pub scanout: Option<u32>,
    pub modesets: u32,
    /// Every flip in the order it was queued.
    pub flips: Vec<u32>,
    pub flushes: u32,
    pub planes: Vec<Option<PlaneConfig>>,
    next_fb_id: u32,
}

/// A display that scans out nothing and records every request.
pub struct HeadlessKms {
    mode: DisplayMode,
    pitch_alignment: u32,
    plane_formats: Vec<Vec<DrmFormat>>,
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessKms {
    /// Returns a `width` x `height` BGRA_8888 display without overlay planes.
    pub fn new(width: u32, height: u32) -> HeadlessKms {
        HeadlessKms {
            mode: DisplayMode {
                width,
                height,
                format: HAL_PIXEL_FORMAT_BGRA_8888,
                refresh: 60,
                mm_width: 0,
                mm_height: 0,
            },
            pitch_alignment: 1,
            plane_formats: Vec::new(),
            state: Default::default(),
        }
    }

    /// Framebuffers whose pitches are not a multiple of `alignment` bytes are rejected.
    pub fn set_pitch_alignment(mut self, alignment: u32) -> HeadlessKms {
        self.pitch_alignment = alignment.max(1);
        self
    }

    /// Adds an overlay plane able to scan out `formats`.
    pub fn add_plane(mut self, formats: &[DrmFormat]) -> HeadlessKms {
        self.plane_formats.push(formats.to_vec());
        self
    }

    /// Returns a handle on the recorded state that outlives the display.
    pub fn state(&self) -> Arc<Mutex<HeadlessState>> {
        self.state.clone()
    }

    fn lock_state(&self) -> MutexGuard<HeadlessState> {
        // A poisoned state only means a test panicked while holding it.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check_fb(state: &HeadlessState, fb_id: u32) -> GrallocResult<()> {
        if state.framebuffers.contains_key(&fb_id) {
            Ok(())
        } else {
            Err(GrallocError::NixError(Errno::EINVAL))
        }
    }
}

impl Default for HeadlessKms {
    fn default() -> HeadlessKms {
        HeadlessKms::new(HEADLESS_DEFAULT_WIDTH, HEADLESS_DEFAULT_HEIGHT)
    }
}

impl Kms for HeadlessKms {
    fn init(&mut self) -> GrallocResult<DisplayMode> {
        let plane_count = self.plane_formats.len();
        let mut state = self.lock_state();
        state.initialized = true;
        state.planes = vec![None; plane_count];
        Ok(self.mode)
    }

    fn fini(&mut self) {
        let mut state = self.lock_state();
        state.initialized = false;
        state.scanout = None;
        for plane in state.planes.iter_mut() {
            *plane = None;
        }
    }

    fn add_framebuffer(&mut self, request: &FramebufferRequest) -> GrallocResult<u32> {
        let layout = &request.layout;
        if request.width == 0 || request.height == 0 || layout.num_planes == 0 {
            return Err(GrallocError::NixError(Errno::EINVAL));
        }

        let alignment = self.pitch_alignment;
        if layout.pitches[..layout.num_planes]
            .iter()
            .any(|pitch| *pitch == 0 || pitch % alignment != 0)
        {
            debug!("headless display rejects pitches {:?}", layout.pitches);
            return Err(GrallocError::NixError(Errno::EINVAL));
        }

        let mut state = self.lock_state();
        state.next_fb_id += 1;
        let fb_id = state.next_fb_id;
        state.framebuffers.insert(fb_id, *request);
        Ok(fb_id)
    }

    fn remove_framebuffer(&mut self, fb_id: u32) -> GrallocResult<()> {
        let mut state = self.lock_state();
        if state.framebuffers.remove(&fb_id).is_none() {
            return Err(GrallocError::NixError(Errno::ENOENT));
        }

        if state.scanout == Some(fb_id) {
            state.scanout = None;
        }
        for plane in state.planes.iter_mut() {
            if plane.map_or(false, |p| p.fb_id == fb_id) {
                *plane = None;
            }
        }

        Ok(())
    }

    fn set_crtc(&mut self, fb_id: u32) -> GrallocResult<()> {
        let mut state = self.lock_state();
        HeadlessKms::check_fb(&state, fb_id)?;
        state.scanout = Some(fb_id);
        state.modesets += 1;
        Ok(())
    }

    fn page_flip(&mut self, fb_id: u32, _sync: bool) -> GrallocResult<()> {
        let mut state = self.lock_state();
        HeadlessKms::check_fb(&state, fb_id)?;
        // Flipping requires a mode.
        if state.scanout.is_none() {
            return Err(GrallocError::NixError(Errno::EINVAL));
        }

        state.scanout = Some(fb_id);
        state.flips.push(fb_id);
        Ok(())
    }

    fn flush(&mut self, fb_id: u32) -> GrallocResult<()> {
        let mut state = self.lock_state();
        HeadlessKms::check_fb(&state, fb_id)?;
        state.flushes += 1;
        Ok(())
    }

    fn plane_count(&self) -> usize {
        self.plane_formats.len()
    }

    fn plane_supports(&self, index: usize, format: DrmFormat) -> bool {
        self.plane_formats
            .get(index)
            .map_or(false, |formats| formats.contains(&format))
    }

    fn set_plane(&mut self, index: usize, config: &PlaneConfig) -> GrallocResult<()> {
        let mut state = self.lock_state();
        HeadlessKms::check_fb(&state, config.fb_id)?;
        let plane = state
            .planes
            .get_mut(index)
            .ok_or(GrallocError::NixError(Errno::EINVAL))?;
        *plane = Some(*config);
        Ok(())
    }

    fn disable_plane(&mut self, index: usize) -> GrallocResult<()> {
        let mut state = self.lock_state();
        let plane = state
            .planes
            .get_mut(index)
            .ok_or(GrallocError::NixError(Errno::EINVAL))?;
        *plane = None;
        Ok(())
    }
}
