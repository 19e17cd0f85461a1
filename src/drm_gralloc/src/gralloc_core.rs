// Copyright 2020 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! gralloc_core: the allocator context.  Owns the device connection, the backend driver and the
//! display state buffer objects are presented through.

use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use log::debug;
use log::error;
use log::info;
use log::warn;

use crate::buffer::BufferHandle;
use crate::buffer::BufferObject;
use crate::drm_device::DrmDevice;
use crate::formats::align_geometry;
use crate::formats::drm_format;
use crate::gralloc_drv::create_driver;
use crate::gralloc_drv::GrallocBackend;
use crate::gralloc_drv::GrallocDriver;
use crate::gralloc_os::AsRawDescriptor;
use crate::gralloc_os::RawDescriptor;
use crate::gralloc_os::SafeDescriptor;
use crate::gralloc_utils::*;
use crate::kms::DisplayConfig;
use crate::kms::DisplayMode;
use crate::kms::DrmKms;
use crate::kms::FramebufferRequest;
use crate::kms::Kms;
use crate::kms::KmsInfo;
use crate::kms::PlaneConfig;
use crate::kms::SwapMode;

/// An overlay plane bound to a buffer object.
#[derive(Clone, Debug)]
struct PlaneReservation {
    bo: Arc<BufferObject>,
    dst: Rect,
    src: Rect,
}

/// Mode-setting state.  Guarded by the context's display lock.
///
/// Lock order is display, then a buffer object's state.  Buffer objects never wait for the
/// display lock while holding their own.
pub(crate) struct DisplayState {
    pub(crate) kms: Option<Box<dyn Kms>>,
    initialized: bool,
    mode: DisplayMode,
    config: DisplayConfig,
    forced_swap_mode: Option<SwapMode>,
    /// The next post does a full modeset.
    first_post: bool,
    /// Scanout buffer of the copy swap mode.
    front: Option<Arc<BufferObject>>,
    current: Option<Arc<BufferObject>>,
    planes: Vec<Option<PlaneReservation>>,
}

fn present_failed(e: GrallocError) -> GrallocError {
    error!("present failed: {}", e);
    match e {
        GrallocError::PresentFailed(_) => e,
        other => GrallocError::PresentFailed(-other.errno()),
    }
}

impl DisplayState {
    pub(crate) fn initialized_kms(&mut self) -> GrallocResult<&mut Box<dyn Kms>> {
        if !self.initialized {
            return Err(GrallocError::KmsNotInitialized);
        }

        self.kms.as_mut().ok_or(GrallocError::KmsNotInitialized)
    }

    fn attach(&mut self, bo: &BufferObject) -> GrallocResult<u32> {
        bo.attach_framebuffer(self).map_err(present_failed)
    }

    /// The framebuffer a posted buffer was given by `add_framebuffer`.
    fn attached(bo: &BufferObject) -> GrallocResult<u32> {
        match bo.fb_id() {
            0 => {
                error!("posted buffer has no framebuffer");
                Err(GrallocError::PresentFailed(libc::EINVAL))
            }
            fb_id => Ok(fb_id),
        }
    }

    fn modeset(&mut self, fb_id: u32) -> GrallocResult<()> {
        self.initialized_kms()?
            .set_crtc(fb_id)
            .map_err(present_failed)?;
        self.first_post = false;
        Ok(())
    }

    fn present(&mut self, bo: &Arc<BufferObject>) -> GrallocResult<()> {
        if !self.initialized {
            return Err(GrallocError::KmsNotInitialized);
        }

        let fb_id = match self.config.swap_mode {
            SwapMode::Noop => return Ok(()),
            SwapMode::Flip => {
                let fb_id = DisplayState::attached(bo)?;
                if self.first_post {
                    self.modeset(fb_id)?;
                } else {
                    let sync = self.config.sync_flip;
                    self.initialized_kms()?
                        .page_flip(fb_id, sync)
                        .map_err(present_failed)?;
                }
                fb_id
            }
            SwapMode::Copy => {
                let front = self
                    .front
                    .clone()
                    .ok_or(GrallocError::PresentFailed(libc::ENODEV))?;
                if !Arc::ptr_eq(&front, bo) {
                    front.blit_from(bo).map_err(present_failed)?;
                }

                let fb_id = self.attach(&front)?;
                if self.first_post {
                    self.modeset(fb_id)?;
                }
                fb_id
            }
            SwapMode::SetCrtc => {
                let fb_id = DisplayState::attached(bo)?;
                self.modeset(fb_id)?;
                fb_id
            }
        };

        self.apply_planes();

        if self.config.vmwgfx_quirk {
            self.initialized_kms()?
                .flush(fb_id)
                .map_err(present_failed)?;
        }

        Ok(())
    }

    /// Scans out every reserved plane.  Planes that fail are left as they were.
    fn apply_planes(&mut self) {
        for index in 0..self.planes.len() {
            let reservation = match &self.planes[index] {
                Some(reservation) => reservation.clone(),
                None => continue,
            };

            if reservation.bo.is_freed() {
                warn!("plane {} shows a freed buffer object", index);
                continue;
            }

            let fb_id = match reservation.bo.attach_framebuffer(self) {
                Ok(fb_id) => fb_id,
                Err(e) => {
                    warn!("no framebuffer for plane {}: {}", index, e);
                    continue;
                }
            };

            let config = PlaneConfig {
                fb_id,
                dst: reservation.dst,
                src: reservation.src,
            };
            if let Some(kms) = self.kms.as_mut() {
                if let Err(e) = kms.set_plane(index, &config) {
                    warn!("failed to set plane {}: {}", index, e);
                }
            }
        }
    }

    fn disable_planes(&mut self) -> Vec<PlaneReservation> {
        let mut released = Vec::new();
        for index in 0..self.planes.len() {
            if let Some(reservation) = self.planes[index].take() {
                if let Some(kms) = self.kms.as_mut() {
                    if let Err(e) = kms.disable_plane(index) {
                        warn!("failed to disable plane {}: {}", index, e);
                    }
                }
                released.push(reservation);
            }
        }

        released
    }
}

/// State shared between a `GrallocContext` and its buffer objects.
pub(crate) struct ContextInner {
    device: Option<Arc<DrmDevice>>,
    pub(crate) driver: Box<dyn GrallocDriver>,
    pub(crate) display: Mutex<DisplayState>,
    live_buffers: AtomicUsize,
}

impl ContextInner {
    pub(crate) fn lock_display(&self) -> MutexGuard<DisplayState> {
        match self.display.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn buffer_created(&self) {
        self.live_buffers.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn buffer_released(&self) {
        self.live_buffers.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn post(&self, bo: &Arc<BufferObject>) -> GrallocResult<()> {
        let mut display = self.lock_display();
        let result = display.present(bo);
        let previous = match result {
            Ok(()) => display.current.replace(bo.clone()),
            Err(_) => None,
        };

        drop(display);
        drop(previous);
        result
    }
}

/// Identifies the context a buffer object belongs to.
pub(crate) fn context_id(inner: &Arc<ContextInner>) -> usize {
    Arc::as_ptr(inner) as usize
}

/// A buffer allocator bound to one DRM device and one backend.
///
/// Dropping the context shuts mode-setting down.  Buffer objects keep the backend alive until
/// they are gone.
pub struct GrallocContext {
    inner: Arc<ContextInner>,
}

impl GrallocContext {
    /// Returns a context on the default DRM device with the backend matching its driver.
    pub fn create() -> GrallocResult<GrallocContext> {
        GrallocBuilder::new().build()
    }

    pub(crate) fn id(&self) -> usize {
        context_id(&self.inner)
    }

    pub(crate) fn owns(&self, bo: &BufferObject) -> bool {
        Arc::ptr_eq(bo.context(), &self.inner)
    }

    pub fn backend(&self) -> GrallocBackend {
        self.inner.driver.backend()
    }

    fn device(&self) -> GrallocResult<&Arc<DrmDevice>> {
        self.inner.device.as_ref().ok_or(GrallocError::NoDevice)
    }

    /// The DRM device file descriptor.
    pub fn get_fd(&self) -> GrallocResult<RawDescriptor> {
        Ok(self.device()?.as_raw_descriptor())
    }

    pub fn get_magic(&self) -> GrallocResult<u32> {
        self.device()?.get_magic()
    }

    pub fn auth_magic(&self, magic: u32) -> GrallocResult<()> {
        self.device()?.auth_magic(magic)
    }

    pub fn set_master(&self) -> GrallocResult<()> {
        self.device()?.set_master()
    }

    pub fn drop_master(&self) -> GrallocResult<()> {
        self.device()?.drop_master()
    }

    /// Becomes DRM master again after a VT switch.  The next post does a full modeset.
    pub fn enter_vt(&self) -> GrallocResult<()> {
        self.set_master()?;
        self.inner.lock_display().first_post = true;
        Ok(())
    }

    pub fn leave_vt(&self) -> GrallocResult<()> {
        self.drop_master()
    }

    /// Brings up the primary display.  Does nothing when it is already up.
    pub fn init_kms(&self) -> GrallocResult<()> {
        let mut display = self.inner.lock_display();
        if display.initialized {
            return Ok(());
        }

        let kms = display.kms.as_mut().ok_or(GrallocError::NoDevice)?;
        let mode = kms.init().map_err(|e| {
            error!("failed to initialize mode-setting: {}", e);
            e
        })?;
        let plane_count = kms.plane_count();

        let mut config = DisplayConfig {
            format: mode.format,
            ..Default::default()
        };
        self.inner.driver.init_kms_features(&mut config);
        if let Some(swap_mode) = display.forced_swap_mode {
            config.swap_mode = swap_mode;
        }

        let front = if config.swap_mode == SwapMode::Copy {
            let usage = GrallocUsage::empty()
                .use_hw_fb(true)
                .use_sw_read(true)
                .use_sw_write(true);
            let handle = BufferHandle::new(mode.width, mode.height, config.format, usage);
            match BufferObject::new(self.inner.clone(), handle) {
                Ok(front) => Some(front),
                Err(e) => {
                    error!("failed to allocate the front buffer: {}", e);
                    if let Some(kms) = display.kms.as_mut() {
                        kms.fini();
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        info!(
            "display {}x{}@{} format 0x{:x}, {:?} swap, {} overlay planes",
            mode.width, mode.height, mode.refresh, config.format, config.swap_mode, plane_count
        );

        display.mode = mode;
        display.config = config;
        display.first_post = true;
        display.front = front;
        display.planes = vec![None; plane_count];
        display.initialized = true;
        Ok(())
    }

    /// Shuts the primary display down, releasing the front buffer and plane reservations.
    pub fn fini_kms(&self) {
        let (front, current, planes) = {
            let mut display = self.inner.lock_display();
            if !display.initialized {
                return;
            }

            let planes = display.disable_planes();
            let front = display.front.take();
            let current = display.current.take();
            if let Some(kms) = display.kms.as_mut() {
                kms.fini();
            }
            display.planes.clear();
            display.initialized = false;
            (front, current, planes)
        };

        drop(planes);
        drop(current);
        if let Some(front) = front {
            if let Err(e) = front.decref() {
                warn!("failed to release the front buffer: {}", e);
            }
        }
    }

    pub fn is_kms_initialized(&self) -> bool {
        self.inner.lock_display().initialized
    }

    pub fn get_kms_info(&self) -> GrallocResult<KmsInfo> {
        let display = self.inner.lock_display();
        if !display.initialized {
            return Err(GrallocError::KmsNotInitialized);
        }

        let (stride, _) = align_geometry(
            display.config.format,
            display.mode.width,
            display.mode.height,
        )?;
        Ok(KmsInfo::new(&display.mode, &display.config, stride))
    }

    /// Returns true if posting returns before the buffer is on screen.
    pub fn is_kms_pipelined(&self) -> bool {
        self.inner.lock_display().config.swap_mode != SwapMode::SetCrtc
    }

    /// Allocates a new buffer object.
    pub fn bo_create(
        &self,
        width: u32,
        height: u32,
        format: u32,
        usage: GrallocUsage,
    ) -> GrallocResult<Arc<BufferObject>> {
        let handle = BufferHandle::new(width, height, format, usage);
        BufferObject::new(self.inner.clone(), handle).map_err(|e| {
            error!(
                "failed to create {}x{} bo of format 0x{:x}: {}",
                width, height, format, e
            );
            e
        })
    }

    /// Imports the buffer `handle` refers to as a new buffer object.
    pub(crate) fn import(&self, handle: &BufferHandle) -> GrallocResult<Arc<BufferObject>> {
        if !handle.has_transport_ref() {
            return Err(GrallocError::InvalidHandle);
        }

        let mut handle = handle.try_clone()?;
        handle.local = None;
        BufferObject::new(self.inner.clone(), handle).map_err(|e| {
            error!("failed to import handle: {}", e);
            e
        })
    }

    /// Returns the live buffer object `handle` was registered as in this context.
    pub fn bo_from_handle(&self, handle: &BufferHandle) -> GrallocResult<Arc<BufferObject>> {
        handle
            .local_bo()
            .filter(|bo| self.owns(bo))
            .ok_or(GrallocError::InvalidHandle)
    }

    pub fn get_gem_handle(&self, handle: &BufferHandle) -> GrallocResult<u32> {
        self.bo_from_handle(handle)?.gem_handle()
    }

    pub fn get_gem_fd(&self, handle: &BufferHandle) -> GrallocResult<SafeDescriptor> {
        self.bo_from_handle(handle)?.export_descriptor()
    }

    pub fn resolve_format(&self, handle: &BufferHandle) -> GrallocResult<FramebufferRequest> {
        self.bo_from_handle(handle)?.resolve_format()
    }

    /// Returns a mask with bit `n` set when overlay plane `n` can scan out `format`.
    pub fn planes_for_format(&self, format: u32) -> u32 {
        let format = match drm_format(format) {
            Ok(format) => format,
            Err(_) => return 0,
        };

        let display = self.inner.lock_display();
        let kms = match (display.initialized, display.kms.as_ref()) {
            (true, Some(kms)) => kms,
            _ => return 0,
        };

        (0..display.planes.len().min(32))
            .filter(|index| kms.plane_supports(*index, format))
            .fold(0, |mask, index| mask | 1 << index)
    }

    /// Binds overlay plane `plane_id` to the buffer `handle` was registered as.  Takes effect on
    /// the next post.
    pub fn reserve_plane(
        &self,
        handle: &BufferHandle,
        plane_id: u32,
        dst: Rect,
        src: Rect,
    ) -> GrallocResult<()> {
        let bo = self.bo_from_handle(handle)?;
        let format = drm_format(bo.format())?;
        let index = plane_id as usize;

        let previous = {
            let mut display = self.inner.lock_display();
            if index >= display.planes.len() {
                debug!("plane {} out of {}", plane_id, display.planes.len());
                return Err(GrallocError::PlaneUnavailable);
            }

            let supported = display
                .kms
                .as_ref()
                .map_or(false, |kms| kms.plane_supports(index, format));
            if !supported {
                debug!("plane {} can not scan out {:?}", plane_id, format);
                return Err(GrallocError::PlaneUnavailable);
            }

            display.planes[index].replace(PlaneReservation { bo, dst, src })
        };

        drop(previous);
        Ok(())
    }

    /// Stops scanning out from every reserved plane.
    pub fn disable_planes(&self) {
        let released = self.inner.lock_display().disable_planes();
        drop(released);
    }

    /// Swaps the buffer shown on an already reserved plane.
    pub fn set_plane_handle(&self, plane_id: u32, handle: &BufferHandle) -> GrallocResult<()> {
        let bo = self.bo_from_handle(handle)?;

        let previous = {
            let mut display = self.inner.lock_display();
            let reservation = display
                .planes
                .get_mut(plane_id as usize)
                .and_then(Option::as_mut)
                .ok_or(GrallocError::PlaneUnavailable)?;
            std::mem::replace(&mut reservation.bo, bo)
        };

        drop(previous);
        Ok(())
    }

    /// Returns the reserved planes as (plane id, fb id) pairs, the fb id being zero until the
    /// next post.
    pub fn reserved_planes(&self) -> Vec<(u32, u32)> {
        self.inner
            .lock_display()
            .planes
            .iter()
            .enumerate()
            .filter_map(|(index, plane)| {
                plane
                    .as_ref()
                    .map(|reservation| (index as u32, reservation.bo.fb_id()))
            })
            .collect()
    }

    /// Number of buffer objects whose native buffer is still allocated.
    pub fn num_buffers(&self) -> usize {
        self.inner.live_buffers.load(Ordering::Acquire)
    }
}

impl Drop for GrallocContext {
    fn drop(&mut self) {
        self.fini_kms();
    }
}

/// GrallocContext Builder, following the Rust builder pattern.
pub struct GrallocBuilder {
    device_path: Option<PathBuf>,
    backend: Option<GrallocBackend>,
    kms: Option<Box<dyn Kms>>,
    swap_mode: Option<SwapMode>,
}

impl GrallocBuilder {
    /// Create a new GrallocBuilder.  The backend is picked from the DRM driver name unless set.
    pub fn new() -> GrallocBuilder {
        GrallocBuilder {
            device_path: None,
            backend: None,
            kms: None,
            swap_mode: None,
        }
    }

    /// Opens `path` instead of the default device.
    pub fn set_device_path<P: Into<PathBuf>>(mut self, path: P) -> GrallocBuilder {
        self.device_path = Some(path.into());
        self
    }

    /// Forces a backend.  `System` opens no device unless a path is set.
    pub fn set_backend(mut self, backend: GrallocBackend) -> GrallocBuilder {
        self.backend = Some(backend);
        self
    }

    /// Presents through `kms` rather than the device's own mode-setting.
    pub fn set_kms(mut self, kms: Box<dyn Kms>) -> GrallocBuilder {
        self.kms = Some(kms);
        self
    }

    /// Overrides the swap mode the backend picks.
    pub fn set_swap_mode(mut self, swap_mode: SwapMode) -> GrallocBuilder {
        self.swap_mode = Some(swap_mode);
        self
    }

    /// Builds the context.  Failing to open the device is the only unrecoverable error.
    pub fn build(self) -> GrallocResult<GrallocContext> {
        let device = match (self.backend, &self.device_path) {
            (Some(GrallocBackend::System), None) => None,
            (_, Some(path)) => Some(DrmDevice::open(path)),
            (_, None) => Some(DrmDevice::open_default()),
        }
        .transpose()
        .map_err(|e| {
            error!("failed to open a DRM device: {}", e);
            e
        })?
        .map(Arc::new);

        let backend = match (self.backend, &device) {
            (Some(backend), _) => backend,
            (None, Some(device)) => GrallocBackend::for_driver_name(&device.driver_name()?),
            (None, None) => return Err(GrallocError::NoDevice),
        };

        let driver = create_driver(backend, device.clone()).map_err(|e| {
            error!("failed to create the {:?} backend: {}", backend, e);
            e
        })?;

        let kms = match (self.kms, &device) {
            (Some(kms), _) => Some(kms),
            (None, Some(device)) => Some(Box::new(DrmKms::new(device.clone())) as Box<dyn Kms>),
            (None, None) => None,
        };

        Ok(GrallocContext {
            inner: Arc::new(ContextInner {
                device,
                driver,
                display: Mutex::new(DisplayState {
                    kms,
                    initialized: false,
                    mode: Default::default(),
                    config: Default::default(),
                    forced_swap_mode: self.swap_mode,
                    first_post: true,
                    front: None,
                    current: None,
                    planes: Vec::new(),
                }),
                live_buffers: AtomicUsize::new(0),
            }),
        })
    }
}

impl Default for GrallocBuilder {
    fn default() -> GrallocBuilder {
        GrallocBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;
    use crate::formats::DrmFormat;
    use crate::formats::DRM_FORMAT_NV12;
    use crate::formats::DRM_FORMAT_ARGB8888;
    use crate::formats::HAL_PIXEL_FORMAT_BGRA_8888;
    use crate::formats::HAL_PIXEL_FORMAT_DRM_NV12;
    use crate::formats::HAL_PIXEL_FORMAT_RGB_565;
    use crate::kms::HeadlessKms;
    use crate::kms::HeadlessState;

    fn headless(
        kms: HeadlessKms,
        swap_mode: Option<SwapMode>,
    ) -> (GrallocContext, Arc<Mutex<HeadlessState>>) {
        let state = kms.state();
        let mut builder = GrallocBuilder::new()
            .set_backend(GrallocBackend::System)
            .set_kms(Box::new(kms));
        if let Some(swap_mode) = swap_mode {
            builder = builder.set_swap_mode(swap_mode);
        }
        (builder.build().unwrap(), state)
    }

    fn scanout_usage() -> GrallocUsage {
        GrallocUsage::empty().use_hw_fb(true).use_sw_write(true)
    }

    #[test]
    fn system_context_without_device() {
        let ctx = GrallocBuilder::new()
            .set_backend(GrallocBackend::System)
            .build()
            .unwrap();
        assert_eq!(ctx.backend(), GrallocBackend::System);
        assert!(matches!(ctx.get_fd(), Err(GrallocError::NoDevice)));
        assert!(matches!(ctx.get_magic(), Err(GrallocError::NoDevice)));
        assert!(matches!(ctx.enter_vt(), Err(GrallocError::NoDevice)));
        assert!(matches!(ctx.init_kms(), Err(GrallocError::NoDevice)));
        assert!(!ctx.is_kms_initialized());
    }

    #[test]
    fn missing_device_is_fatal() {
        let result = GrallocBuilder::new()
            .set_device_path("/nonexistent/dri/card0")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn kms_lifecycle() {
        let (ctx, state) = headless(HeadlessKms::new(1000, 600), None);
        assert!(matches!(
            ctx.get_kms_info(),
            Err(GrallocError::KmsNotInitialized)
        ));

        ctx.init_kms().unwrap();
        ctx.init_kms().unwrap();
        assert!(ctx.is_kms_initialized());
        assert!(state.lock().unwrap().initialized);
        assert!(ctx.is_kms_pipelined());

        let info = ctx.get_kms_info().unwrap();
        assert_eq!(info.width, 1000);
        assert_eq!(info.height, 600);
        assert_eq!(info.stride, 1000);
        assert_eq!(info.format, HAL_PIXEL_FORMAT_BGRA_8888);
        assert_eq!(info.fps, 60.0);
        assert_eq!(info.min_swap_interval, 1);

        ctx.fini_kms();
        assert!(!ctx.is_kms_initialized());
        assert!(!state.lock().unwrap().initialized);
        ctx.fini_kms();
    }

    #[test]
    fn flip_does_modeset_first() {
        let (ctx, state) = headless(HeadlessKms::default(), None);
        ctx.init_kms().unwrap();

        let first = ctx
            .bo_create(1280, 1024, HAL_PIXEL_FORMAT_BGRA_8888, scanout_usage())
            .unwrap();
        let second = ctx
            .bo_create(1280, 1024, HAL_PIXEL_FORMAT_BGRA_8888, scanout_usage())
            .unwrap();
        first.add_framebuffer().unwrap();
        second.add_framebuffer().unwrap();

        first.post().unwrap();
        second.post().unwrap();
        first.post().unwrap();

        let state = state.lock().unwrap();
        assert_eq!(state.modesets, 1);
        assert_eq!(state.flips, vec![second.fb_id(), first.fb_id()]);
        assert_eq!(state.scanout, Some(first.fb_id()));
        assert_eq!(state.flushes, 0);
    }

    #[test]
    fn setcrtc_is_not_pipelined() {
        let (ctx, state) = headless(HeadlessKms::default(), Some(SwapMode::SetCrtc));
        ctx.init_kms().unwrap();
        assert!(!ctx.is_kms_pipelined());
        assert_eq!(ctx.get_kms_info().unwrap().max_swap_interval, 0);

        let bo = ctx
            .bo_create(1280, 1024, HAL_PIXEL_FORMAT_BGRA_8888, scanout_usage())
            .unwrap();
        bo.add_framebuffer().unwrap();
        bo.post().unwrap();
        bo.post().unwrap();
        assert_eq!(state.lock().unwrap().modesets, 2);
        assert!(state.lock().unwrap().flips.is_empty());
    }

    #[test]
    fn copy_swap_blits_into_front() {
        let (ctx, state) = headless(HeadlessKms::new(64, 64), Some(SwapMode::Copy));
        ctx.init_kms().unwrap();
        // The front buffer.
        assert_eq!(ctx.num_buffers(), 1);

        let bo = ctx
            .bo_create(
                64,
                64,
                HAL_PIXEL_FORMAT_BGRA_8888,
                GrallocUsage::empty().use_sw_write(true),
            )
            .unwrap();
        let mapping = bo.lock(Rect::default(), true).unwrap();
        unsafe { std::ptr::write_bytes(mapping.ptr as *mut u8, 0xa5, mapping.size as usize) };
        bo.unlock();

        bo.post().unwrap();
        bo.post().unwrap();
        assert_eq!(bo.fb_id(), 0);

        let front_fb = {
            let state = state.lock().unwrap();
            assert_eq!(state.modesets, 1);
            assert!(state.flips.is_empty());
            state.scanout.unwrap()
        };
        assert_ne!(front_fb, 0);

        let front = ctx.inner.lock_display().front.clone().unwrap();
        let mapping = front.lock(Rect::default(), false).unwrap();
        let pixels = unsafe { std::slice::from_raw_parts(mapping.ptr as *const u8, 64 * 4) };
        assert!(pixels.iter().all(|b| *b == 0xa5));
        front.unlock();
        drop(front);

        ctx.fini_kms();
        assert_eq!(ctx.num_buffers(), 1);
        assert!(bo.decref().unwrap());
        assert_eq!(ctx.num_buffers(), 0);
    }

    #[test]
    fn copy_swap_of_locked_buffer() {
        let (ctx, _) = headless(HeadlessKms::new(32, 32), Some(SwapMode::Copy));
        ctx.init_kms().unwrap();
        let bo = ctx
            .bo_create(32, 32, HAL_PIXEL_FORMAT_BGRA_8888, scanout_usage())
            .unwrap();
        bo.lock(Rect::default(), true).unwrap();
        assert!(matches!(
            bo.post(),
            Err(GrallocError::PresentFailed(libc::EBUSY))
        ));
        bo.unlock();
        bo.post().unwrap();
    }

    #[test]
    fn present_failures() {
        let (ctx, _) = headless(HeadlessKms::default().set_pitch_alignment(256), None);
        let bo = ctx
            .bo_create(100, 100, HAL_PIXEL_FORMAT_RGB_565, scanout_usage())
            .unwrap();
        assert!(matches!(bo.post(), Err(GrallocError::KmsNotInitialized)));

        ctx.init_kms().unwrap();
        // 200 byte rows are rejected by the display.
        assert!(matches!(
            bo.add_framebuffer(),
            Err(GrallocError::FramebufferAttachFailed(libc::EINVAL))
        ));
        assert!(matches!(
            bo.post(),
            Err(GrallocError::PresentFailed(libc::EINVAL))
        ));
        assert!(bo.needs_framebuffer());
    }

    #[test]
    fn noop_swap() {
        let (ctx, state) = headless(HeadlessKms::default(), Some(SwapMode::Noop));
        ctx.init_kms().unwrap();
        let bo = ctx
            .bo_create(16, 16, HAL_PIXEL_FORMAT_BGRA_8888, GrallocUsage::empty())
            .unwrap();
        bo.post().unwrap();
        assert!(state.lock().unwrap().framebuffers.is_empty());
    }

    #[test]
    fn planes() {
        let kms = HeadlessKms::default()
            .add_plane(&[DrmFormat::from_bytes(DRM_FORMAT_NV12)])
            .add_plane(&[
                DrmFormat::from_bytes(DRM_FORMAT_NV12),
                DrmFormat::from_bytes(DRM_FORMAT_ARGB8888),
            ]);
        let (ctx, state) = headless(kms, None);
        let video = ctx
            .bo_create(
                320,
                240,
                HAL_PIXEL_FORMAT_DRM_NV12,
                GrallocUsage::empty().use_hw_composer(true),
            )
            .unwrap();
        let dst = Rect::new(0, 0, 640, 480);
        let src = Rect::new(0, 0, 320, 240);

        // Nothing is reservable before mode-setting is up.
        assert_eq!(ctx.planes_for_format(HAL_PIXEL_FORMAT_DRM_NV12), 0);
        assert!(matches!(
            ctx.reserve_plane(video.handle(), 0, dst, src),
            Err(GrallocError::PlaneUnavailable)
        ));

        ctx.init_kms().unwrap();
        assert_eq!(ctx.planes_for_format(HAL_PIXEL_FORMAT_DRM_NV12), 0b11);
        assert_eq!(ctx.planes_for_format(HAL_PIXEL_FORMAT_BGRA_8888), 0b10);
        assert_eq!(ctx.planes_for_format(0x7f), 0);

        ctx.reserve_plane(video.handle(), 1, dst, src).unwrap();
        assert!(matches!(
            ctx.reserve_plane(video.handle(), 2, dst, src),
            Err(GrallocError::PlaneUnavailable)
        ));
        assert_eq!(ctx.reserved_planes(), vec![(1, 0)]);

        let primary = ctx
            .bo_create(1280, 1024, HAL_PIXEL_FORMAT_BGRA_8888, scanout_usage())
            .unwrap();
        primary.add_framebuffer().unwrap();
        primary.post().unwrap();
        let video_fb = video.fb_id();
        assert_ne!(video_fb, 0);
        assert_eq!(
            state.lock().unwrap().planes[1],
            Some(PlaneConfig {
                fb_id: video_fb,
                dst,
                src
            })
        );

        ctx.disable_planes();
        assert!(ctx.reserved_planes().is_empty());
        assert_eq!(state.lock().unwrap().planes[1], None);
        ctx.disable_planes();
    }

    #[test]
    fn set_plane_handle_needs_reservation() {
        let kms = HeadlessKms::default().add_plane(&[DrmFormat::from_bytes(DRM_FORMAT_ARGB8888)]);
        let (ctx, _) = headless(kms, None);
        ctx.init_kms().unwrap();

        let first = ctx
            .bo_create(64, 64, HAL_PIXEL_FORMAT_BGRA_8888, GrallocUsage::empty())
            .unwrap();
        let second = ctx
            .bo_create(64, 64, HAL_PIXEL_FORMAT_BGRA_8888, GrallocUsage::empty())
            .unwrap();

        assert!(matches!(
            ctx.set_plane_handle(0, second.handle()),
            Err(GrallocError::PlaneUnavailable)
        ));

        let rect = Rect::new(0, 0, 64, 64);
        ctx.reserve_plane(first.handle(), 0, rect, rect).unwrap();
        ctx.set_plane_handle(0, second.handle()).unwrap();

        let shown = ctx.inner.lock_display().planes[0].clone().unwrap().bo;
        assert!(Arc::ptr_eq(&shown, &second));
    }

    #[test]
    fn foreign_handles() {
        let (first, _) = headless(HeadlessKms::default(), None);
        let (second, _) = headless(HeadlessKms::default(), None);
        let bo = first
            .bo_create(16, 16, HAL_PIXEL_FORMAT_BGRA_8888, GrallocUsage::empty())
            .unwrap();

        assert!(first.bo_from_handle(bo.handle()).is_ok());
        assert!(matches!(
            second.bo_from_handle(bo.handle()),
            Err(GrallocError::InvalidHandle)
        ));
        assert!(first.get_gem_handle(bo.handle()).unwrap() != 0);
        assert!(first.get_gem_fd(bo.handle()).is_ok());

        let request = first.resolve_format(bo.handle()).unwrap();
        assert_eq!(request.layout.num_planes, 1);
        assert_eq!(request.layout.pitches[0], 64);

        let fresh = BufferHandle::new(16, 16, HAL_PIXEL_FORMAT_BGRA_8888, GrallocUsage::empty());
        assert!(matches!(
            first.bo_from_handle(&fresh),
            Err(GrallocError::InvalidHandle)
        ));
    }

    #[test]
    fn vmwgfx_quirk_flushes() {
        let (ctx, state) = headless(HeadlessKms::new(32, 32), None);
        ctx.init_kms().unwrap();
        ctx.inner.lock_display().config.vmwgfx_quirk = true;

        let bo = ctx
            .bo_create(32, 32, HAL_PIXEL_FORMAT_BGRA_8888, scanout_usage())
            .unwrap();
        bo.add_framebuffer().unwrap();
        bo.post().unwrap();
        bo.post().unwrap();
        assert_eq!(state.lock().unwrap().flushes, 2);
    }

    #[test]
    fn post_needs_framebuffer() {
        let (ctx, state) = headless(HeadlessKms::new(64, 64), None);
        ctx.init_kms().unwrap();

        let scanout = ctx
            .bo_create(64, 64, HAL_PIXEL_FORMAT_BGRA_8888, scanout_usage())
            .unwrap();
        assert!(matches!(
            scanout.post(),
            Err(GrallocError::PresentFailed(libc::EINVAL))
        ));
        assert_eq!(scanout.fb_id(), 0);

        let texture = ctx
            .bo_create(
                64,
                64,
                HAL_PIXEL_FORMAT_BGRA_8888,
                GrallocUsage::empty().use_hw_texture(true),
            )
            .unwrap();
        assert!(matches!(
            texture.post(),
            Err(GrallocError::PresentFailed(libc::EINVAL))
        ));
        assert!(!texture.needs_framebuffer());
        assert_eq!(texture.fb_id(), 0);

        {
            let state = state.lock().unwrap();
            assert!(state.framebuffers.is_empty());
            assert_eq!(state.scanout, None);
            assert_eq!(state.modesets, 0);
        }

        scanout.add_framebuffer().unwrap();
        scanout.post().unwrap();
        assert_eq!(state.lock().unwrap().scanout, Some(scanout.fb_id()));
    }

    #[test]
    fn copy_swap_rejects_other_formats() {
        let (ctx, state) = headless(HeadlessKms::new(32, 32), Some(SwapMode::Copy));
        ctx.init_kms().unwrap();

        let bo = ctx
            .bo_create(32, 32, HAL_PIXEL_FORMAT_RGB_565, GrallocUsage::empty())
            .unwrap();
        assert!(matches!(
            bo.post(),
            Err(GrallocError::PresentFailed(libc::EINVAL))
        ));
        assert_eq!(state.lock().unwrap().scanout, None);
        assert!(!bo.is_locked());
    }
}
