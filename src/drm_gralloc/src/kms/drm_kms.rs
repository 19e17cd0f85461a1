// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! drm_kms: legacy KMS mode-setting on a DRM primary node.

#![allow(non_camel_case_types)]

use std::os::raw::c_uint;
use std::sync::Arc;

use log::debug;
use log::error;
use log::info;
use log::warn;
use nix::ioctl_readwrite;
use zerocopy::FromBytes;

use crate::drm_device::DrmDevice;
use crate::drm_device::DRM_IOCTL_BASE;
use crate::formats::DrmFormat;
use crate::formats::HAL_PIXEL_FORMAT_BGRA_8888;
use crate::gralloc_os::AsRawDescriptor;
use crate::gralloc_utils::*;
use crate::kms::DisplayMode;
use crate::kms::FramebufferRequest;
use crate::kms::Kms;
use crate::kms::PlaneConfig;

const DRM_IOCTL_MODE_GETRESOURCES: c_uint = 0xA0;
const DRM_IOCTL_MODE_GETCRTC: c_uint = 0xA1;
const DRM_IOCTL_MODE_SETCRTC: c_uint = 0xA2;
const DRM_IOCTL_MODE_GETENCODER: c_uint = 0xA6;
const DRM_IOCTL_MODE_GETCONNECTOR: c_uint = 0xA7;
const DRM_IOCTL_MODE_RMFB: c_uint = 0xAF;
const DRM_IOCTL_MODE_PAGE_FLIP: c_uint = 0xB0;
const DRM_IOCTL_MODE_DIRTYFB: c_uint = 0xB1;
const DRM_IOCTL_MODE_GETPLANERESOURCES: c_uint = 0xB5;
const DRM_IOCTL_MODE_GETPLANE: c_uint = 0xB6;
const DRM_IOCTL_MODE_SETPLANE: c_uint = 0xB7;
const DRM_IOCTL_MODE_ADDFB2: c_uint = 0xB8;

const DRM_MODE_CONNECTED: u32 = 1;
const DRM_MODE_TYPE_PREFERRED: u32 = 1 << 3;
const DRM_MODE_PAGE_FLIP_EVENT: u32 = 0x01;
const DRM_MODE_PAGE_FLIP_ASYNC: u32 = 0x02;
const DRM_EVENT_FLIP_COMPLETE: u32 = 0x02;

/// Header of every event read from the device.
#[repr(C)]
#[derive(Copy, Clone, Default, FromBytes)]
struct drm_event {
    type_: u32,
    length: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_mode_card_res {
    fb_id_ptr: u64,
    crtc_id_ptr: u64,
    connector_id_ptr: u64,
    encoder_id_ptr: u64,
    count_fbs: u32,
    count_crtcs: u32,
    count_connectors: u32,
    count_encoders: u32,
    min_width: u32,
    max_width: u32,
    min_height: u32,
    max_height: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_mode_modeinfo {
    clock: u32,
    hdisplay: u16,
    hsync_start: u16,
    hsync_end: u16,
    htotal: u16,
    hskew: u16,
    vdisplay: u16,
    vsync_start: u16,
    vsync_end: u16,
    vtotal: u16,
    vscan: u16,
    vrefresh: u32,
    flags: u32,
    type_: u32,
    name: [u8; 32],
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_mode_crtc {
    set_connectors_ptr: u64,
    count_connectors: u32,
    crtc_id: u32,
    fb_id: u32,
    x: u32,
    y: u32,
    gamma_size: u32,
    mode_valid: u32,
    mode: drm_mode_modeinfo,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_mode_get_encoder {
    encoder_id: u32,
    encoder_type: u32,
    crtc_id: u32,
    possible_crtcs: u32,
    possible_clones: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_mode_get_connector {
    encoders_ptr: u64,
    modes_ptr: u64,
    props_ptr: u64,
    prop_values_ptr: u64,
    count_modes: u32,
    count_props: u32,
    count_encoders: u32,
    encoder_id: u32,
    connector_id: u32,
    connector_type: u32,
    connector_type_id: u32,
    connection: u32,
    mm_width: u32,
    mm_height: u32,
    subpixel: u32,
    pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_mode_fb_cmd2 {
    fb_id: u32,
    width: u32,
    height: u32,
    pixel_format: u32,
    flags: u32,
    handles: [u32; 4],
    pitches: [u32; 4],
    offsets: [u32; 4],
    modifier: [u64; 4],
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_mode_crtc_page_flip {
    crtc_id: u32,
    fb_id: u32,
    flags: u32,
    reserved: u32,
    user_data: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_mode_fb_dirty_cmd {
    fb_id: u32,
    flags: u32,
    color: u32,
    num_clips: u32,
    clips_ptr: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_mode_get_plane_res {
    plane_id_ptr: u64,
    count_planes: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_mode_get_plane {
    plane_id: u32,
    crtc_id: u32,
    fb_id: u32,
    possible_crtcs: u32,
    gamma_size: u32,
    count_format_types: u32,
    format_type_ptr: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_mode_set_plane {
    plane_id: u32,
    crtc_id: u32,
    fb_id: u32,
    flags: u32,
    crtc_x: i32,
    crtc_y: i32,
    crtc_w: u32,
    crtc_h: u32,
    // Source values are 16.16 fixed point.
    src_x: u32,
    src_y: u32,
    src_h: u32,
    src_w: u32,
}

ioctl_readwrite!(
    drm_mode_getresources,
    DRM_IOCTL_BASE,
    DRM_IOCTL_MODE_GETRESOURCES,
    drm_mode_card_res
);
ioctl_readwrite!(
    drm_mode_getcrtc,
    DRM_IOCTL_BASE,
    DRM_IOCTL_MODE_GETCRTC,
    drm_mode_crtc
);
ioctl_readwrite!(
    drm_mode_setcrtc,
    DRM_IOCTL_BASE,
    DRM_IOCTL_MODE_SETCRTC,
    drm_mode_crtc
);
ioctl_readwrite!(
    drm_mode_getencoder,
    DRM_IOCTL_BASE,
    DRM_IOCTL_MODE_GETENCODER,
    drm_mode_get_encoder
);
ioctl_readwrite!(
    drm_mode_getconnector,
    DRM_IOCTL_BASE,
    DRM_IOCTL_MODE_GETCONNECTOR,
    drm_mode_get_connector
);
ioctl_readwrite!(drm_mode_rmfb, DRM_IOCTL_BASE, DRM_IOCTL_MODE_RMFB, c_uint);
ioctl_readwrite!(
    drm_mode_page_flip,
    DRM_IOCTL_BASE,
    DRM_IOCTL_MODE_PAGE_FLIP,
    drm_mode_crtc_page_flip
);
ioctl_readwrite!(
    drm_mode_dirtyfb,
    DRM_IOCTL_BASE,
    DRM_IOCTL_MODE_DIRTYFB,
    drm_mode_fb_dirty_cmd
);
ioctl_readwrite!(
    drm_mode_getplaneresources,
    DRM_IOCTL_BASE,
    DRM_IOCTL_MODE_GETPLANERESOURCES,
    drm_mode_get_plane_res
);
ioctl_readwrite!(
    drm_mode_getplane,
    DRM_IOCTL_BASE,
    DRM_IOCTL_MODE_GETPLANE,
    drm_mode_get_plane
);
ioctl_readwrite!(
    drm_mode_setplane,
    DRM_IOCTL_BASE,
    DRM_IOCTL_MODE_SETPLANE,
    drm_mode_set_plane
);
ioctl_readwrite!(
    drm_mode_addfb2,
    DRM_IOCTL_BASE,
    DRM_IOCTL_MODE_ADDFB2,
    drm_mode_fb_cmd2
);

struct KmsPlane {
    plane_id: u32,
    formats: Vec<u32>,
}

/// The primary pipe found by `init`.
struct Pipe {
    crtc_id: u32,
    connector_id: u32,
    mode: drm_mode_modeinfo,
    saved_crtc: drm_mode_crtc,
}

/// Mode-setting through the legacy KMS ioctls.  Drives the first connected connector with its
/// preferred mode.
pub struct DrmKms {
    device: Arc<DrmDevice>,
    pipe: Option<Pipe>,
    planes: Vec<KmsPlane>,
    flip_pending: bool,
}

impl DrmKms {
    pub fn new(device: Arc<DrmDevice>) -> DrmKms {
        DrmKms {
            device,
            pipe: None,
            planes: Vec::new(),
            flip_pending: false,
        }
    }

    fn fd(&self) -> i32 {
        self.device.as_raw_descriptor()
    }

    fn pipe(&self) -> GrallocResult<&Pipe> {
        self.pipe.as_ref().ok_or(GrallocError::KmsNotInitialized)
    }

    fn get_resources(&self) -> GrallocResult<(Vec<u32>, Vec<u32>)> {
        let mut res = drm_mode_card_res::default();
        // Safe because all array pointers are null, the kernel only fills in counts.
        unsafe {
            drm_mode_getresources(self.fd(), &mut res)?;
        }

        let mut crtcs = vec![0u32; res.count_crtcs as usize];
        let mut connectors = vec![0u32; res.count_connectors as usize];
        let mut res = drm_mode_card_res {
            crtc_id_ptr: crtcs.as_mut_ptr() as u64,
            count_crtcs: crtcs.len() as u32,
            connector_id_ptr: connectors.as_mut_ptr() as u64,
            count_connectors: connectors.len() as u32,
            ..Default::default()
        };
        // Safe because the kernel writes at most `count_*` entries into each array.
        unsafe {
            drm_mode_getresources(self.fd(), &mut res)?;
        }

        crtcs.truncate(res.count_crtcs as usize);
        connectors.truncate(res.count_connectors as usize);
        Ok((crtcs, connectors))
    }

    fn get_connector(
        &self,
        connector_id: u32,
    ) -> GrallocResult<(drm_mode_get_connector, Vec<drm_mode_modeinfo>, Vec<u32>)> {
        let mut conn = drm_mode_get_connector {
            connector_id,
            ..Default::default()
        };
        // Safe because all array pointers are null.
        unsafe {
            drm_mode_getconnector(self.fd(), &mut conn)?;
        }

        let mut modes = vec![drm_mode_modeinfo::default(); conn.count_modes as usize];
        let mut encoders = vec![0u32; conn.count_encoders as usize];
        let mut conn = drm_mode_get_connector {
            connector_id,
            modes_ptr: modes.as_mut_ptr() as u64,
            count_modes: modes.len() as u32,
            encoders_ptr: encoders.as_mut_ptr() as u64,
            count_encoders: encoders.len() as u32,
            ..Default::default()
        };
        // Safe because the kernel writes at most `count_*` entries into each array.
        unsafe {
            drm_mode_getconnector(self.fd(), &mut conn)?;
        }

        modes.truncate(conn.count_modes as usize);
        encoders.truncate(conn.count_encoders as usize);
        Ok((conn, modes, encoders))
    }

    fn get_encoder(&self, encoder_id: u32) -> GrallocResult<drm_mode_get_encoder> {
        let mut encoder = drm_mode_get_encoder {
            encoder_id,
            ..Default::default()
        };
        // Safe because the kernel writes only within `encoder`.
        unsafe {
            drm_mode_getencoder(self.fd(), &mut encoder)?;
        }
        Ok(encoder)
    }

    /// Returns the (crtc id, crtc index) driving `conn`.
    fn find_crtc(
        &self,
        conn: &drm_mode_get_connector,
        encoders: &[u32],
        crtcs: &[u32],
    ) -> Option<(u32, usize)> {
        if conn.encoder_id != 0 {
            if let Ok(encoder) = self.get_encoder(conn.encoder_id) {
                if let Some(index) = crtcs.iter().position(|c| *c == encoder.crtc_id) {
                    return Some((encoder.crtc_id, index));
                }
            }
        }

        for encoder_id in encoders {
            let encoder = match self.get_encoder(*encoder_id) {
                Ok(encoder) => encoder,
                Err(_) => continue,
            };

            for (index, crtc_id) in crtcs.iter().enumerate() {
                if encoder.possible_crtcs & (1 << index) != 0 {
                    return Some((*crtc_id, index));
                }
            }
        }

        None
    }

    fn get_crtc(&self, crtc_id: u32) -> GrallocResult<drm_mode_crtc> {
        let mut crtc = drm_mode_crtc {
            crtc_id,
            ..Default::default()
        };
        // Safe because set_connectors_ptr is null and the kernel writes only within `crtc`.
        unsafe {
            drm_mode_getcrtc(self.fd(), &mut crtc)?;
        }
        Ok(crtc)
    }

    fn scan_planes(&self, crtc_index: usize) -> GrallocResult<Vec<KmsPlane>> {
        let mut res = drm_mode_get_plane_res::default();
        // Safe because the id pointer is null.
        unsafe {
            drm_mode_getplaneresources(self.fd(), &mut res)?;
        }

        let mut ids = vec![0u32; res.count_planes as usize];
        let mut res = drm_mode_get_plane_res {
            plane_id_ptr: ids.as_mut_ptr() as u64,
            count_planes: ids.len() as u32,
        };
        // Safe because the kernel writes at most `count_planes` ids.
        unsafe {
            drm_mode_getplaneresources(self.fd(), &mut res)?;
        }
        ids.truncate(res.count_planes as usize);

        let mut planes = Vec::new();
        for plane_id in ids {
            let mut plane = drm_mode_get_plane {
                plane_id,
                ..Default::default()
            };
            // Safe because the format pointer is null.
            unsafe {
                drm_mode_getplane(self.fd(), &mut plane)?;
            }

            if plane.possible_crtcs & (1 << crtc_index) == 0 {
                continue;
            }

            let mut formats = vec![0u32; plane.count_format_types as usize];
            let mut plane = drm_mode_get_plane {
                plane_id,
                format_type_ptr: formats.as_mut_ptr() as u64,
                count_format_types: formats.len() as u32,
                ..Default::default()
            };
            // Safe because the kernel writes at most `count_format_types` formats.
            unsafe {
                drm_mode_getplane(self.fd(), &mut plane)?;
            }
            formats.truncate(plane.count_format_types as usize);

            planes.push(KmsPlane { plane_id, formats });
        }

        Ok(planes)
    }

    fn wait_for_flip(&mut self) {
        let mut buf = [0u8; 1024];
        while self.flip_pending {
            let len = match self.device.read_events(&mut buf) {
                Ok(len) => len,
                Err(e) => {
                    error!("failed to read DRM events: {}", e);
                    self.flip_pending = false;
                    return;
                }
            };

            let header_len = std::mem::size_of::<drm_event>();
            let mut offset = 0;
            while let Some(event) = buf[..len]
                .get(offset..offset + header_len)
                .and_then(drm_event::read_from)
            {
                if event.type_ == DRM_EVENT_FLIP_COMPLETE {
                    self.flip_pending = false;
                }
                if (event.length as usize) < header_len {
                    break;
                }
                offset += event.length as usize;
            }
        }
    }

    fn plane(&self, index: usize) -> GrallocResult<&KmsPlane> {
        self.planes
            .get(index)
            .ok_or(GrallocError::PlaneUnavailable)
    }
}

impl Kms for DrmKms {
    fn init(&mut self) -> GrallocResult<DisplayMode> {
        let (crtcs, connectors) = self.get_resources()?;

        for connector_id in connectors {
            let (conn, modes, encoders) = match self.get_connector(connector_id) {
                Ok(connector) => connector,
                Err(e) => {
                    warn!("failed to query connector {}: {}", connector_id, e);
                    continue;
                }
            };

            if conn.connection != DRM_MODE_CONNECTED || modes.is_empty() {
                continue;
            }

            let (crtc_id, crtc_index) = match self.find_crtc(&conn, &encoders, &crtcs) {
                Some(crtc) => crtc,
                None => continue,
            };

            let mode = modes
                .iter()
                .find(|m| m.type_ & DRM_MODE_TYPE_PREFERRED != 0)
                .unwrap_or(&modes[0]);

            let saved_crtc = self.get_crtc(crtc_id)?;
            self.planes = match self.scan_planes(crtc_index) {
                Ok(planes) => planes,
                Err(e) => {
                    debug!("no overlay planes: {}", e);
                    Vec::new()
                }
            };

            let display = DisplayMode {
                width: mode.hdisplay as u32,
                height: mode.vdisplay as u32,
                format: HAL_PIXEL_FORMAT_BGRA_8888,
                refresh: mode.vrefresh,
                mm_width: conn.mm_width,
                mm_height: conn.mm_height,
            };

            info!(
                "using connector {} on crtc {}: {}x{}@{}, {} overlay planes",
                connector_id,
                crtc_id,
                display.width,
                display.height,
                display.refresh,
                self.planes.len()
            );

            self.pipe = Some(Pipe {
                crtc_id,
                connector_id,
                mode: *mode,
                saved_crtc,
            });
            return Ok(display);
        }

        error!("no connected display found");
        Err(GrallocError::NoDevice)
    }

    fn fini(&mut self) {
        self.wait_for_flip();

        for index in 0..self.planes.len() {
            let _ = self.disable_plane(index);
        }
        self.planes.clear();

        if let Some(pipe) = self.pipe.take() {
            // Hand the display back the way we found it.
            let mut connector_id = pipe.connector_id;
            let mut crtc = pipe.saved_crtc;
            crtc.set_connectors_ptr = &mut connector_id as *mut u32 as u64;
            crtc.count_connectors = 1;
            // Safe because the connector array outlives the call.
            if let Err(e) = unsafe { drm_mode_setcrtc(self.fd(), &mut crtc) } {
                warn!("failed to restore crtc {}: {}", pipe.crtc_id, e);
            }
        }
    }

    fn add_framebuffer(&mut self, request: &FramebufferRequest) -> GrallocResult<u32> {
        let layout = &request.layout;
        let mut cmd = drm_mode_fb_cmd2 {
            width: request.width,
            height: request.height,
            pixel_format: layout.drm_format.0,
            ..Default::default()
        };
        for plane in 0..layout.num_planes.min(4) {
            cmd.handles[plane] = request.handles[plane];
            cmd.pitches[plane] = layout.pitches[plane];
            cmd.offsets[plane] = layout.offsets[plane];
        }

        // Safe because the kernel writes only within `cmd`.
        unsafe {
            drm_mode_addfb2(self.fd(), &mut cmd)?;
        }
        Ok(cmd.fb_id)
    }

    fn remove_framebuffer(&mut self, fb_id: u32) -> GrallocResult<()> {
        let mut id: c_uint = fb_id;
        // Safe because the kernel reads a single id.
        unsafe {
            drm_mode_rmfb(self.fd(), &mut id)?;
        }
        Ok(())
    }

    fn set_crtc(&mut self, fb_id: u32) -> GrallocResult<()> {
        self.wait_for_flip();

        let pipe = self.pipe()?;
        let mut connector_id = pipe.connector_id;
        let mut crtc = drm_mode_crtc {
            set_connectors_ptr: &mut connector_id as *mut u32 as u64,
            count_connectors: 1,
            crtc_id: pipe.crtc_id,
            fb_id,
            mode_valid: 1,
            mode: pipe.mode,
            ..Default::default()
        };
        // Safe because the connector array outlives the call.
        unsafe {
            drm_mode_setcrtc(self.fd(), &mut crtc)?;
        }
        Ok(())
    }

    fn page_flip(&mut self, fb_id: u32, sync: bool) -> GrallocResult<()> {
        // The kernel queues a single flip per crtc.
        self.wait_for_flip();

        let mut flags = DRM_MODE_PAGE_FLIP_EVENT;
        if !sync {
            flags |= DRM_MODE_PAGE_FLIP_ASYNC;
        }

        let mut flip = drm_mode_crtc_page_flip {
            crtc_id: self.pipe()?.crtc_id,
            fb_id,
            flags,
            ..Default::default()
        };
        // Safe because the kernel only reads `flip`.
        unsafe {
            drm_mode_page_flip(self.fd(), &mut flip)?;
        }

        self.flip_pending = true;
        Ok(())
    }

    fn flush(&mut self, fb_id: u32) -> GrallocResult<()> {
        let mut dirty = drm_mode_fb_dirty_cmd {
            fb_id,
            ..Default::default()
        };
        // Safe because no clip rectangles are passed.
        unsafe {
            drm_mode_dirtyfb(self.fd(), &mut dirty)?;
        }
        Ok(())
    }

    fn plane_count(&self) -> usize {
        self.planes.len()
    }

    fn plane_supports(&self, index: usize, format: DrmFormat) -> bool {
        self.planes
            .get(index)
            .map_or(false, |plane| plane.formats.contains(&format.0))
    }

    fn set_plane(&mut self, index: usize, config: &PlaneConfig) -> GrallocResult<()> {
        let plane_id = self.plane(index)?.plane_id;
        let mut set = drm_mode_set_plane {
            plane_id,
            crtc_id: self.pipe()?.crtc_id,
            fb_id: config.fb_id,
            crtc_x: config.dst.x as i32,
            crtc_y: config.dst.y as i32,
            crtc_w: config.dst.w,
            crtc_h: config.dst.h,
            src_x: config.src.x << 16,
            src_y: config.src.y << 16,
            src_h: config.src.h << 16,
            src_w: config.src.w << 16,
            ..Default::default()
        };
        // Safe because the kernel only reads `set`.
        unsafe {
            drm_mode_setplane(self.fd(), &mut set)?;
        }
        Ok(())
    }

    fn disable_plane(&mut self, index: usize) -> GrallocResult<()> {
        let mut set = drm_mode_set_plane {
            plane_id: self.plane(index)?.plane_id,
            ..Default::default()
        };
        // Safe because the kernel only reads `set`.
        unsafe {
            drm_mode_setplane(self.fd(), &mut set)?;
        }
        Ok(())
    }
}
