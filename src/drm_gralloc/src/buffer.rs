// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! buffer: buffer handles, their wire form, and the buffer objects they re-hydrate into.

use std::mem::size_of;
use std::ptr::copy_nonoverlapping;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;

use log::debug;
use log::error;
use log::warn;
use zerocopy::AsBytes;
use zerocopy::FromBytes;

use crate::formats::framebuffer_layout;
use crate::gralloc_core::ContextInner;
use crate::gralloc_core::DisplayState;
use crate::gralloc_drv::DriverBuffer;
use crate::gralloc_drv::NativeBuffer;
use crate::gralloc_os::SafeDescriptor;
use crate::gralloc_utils::*;
use crate::kms::FramebufferRequest;

/// "GRDM", marks the wire form of a handle produced by this crate.
const HANDLE_MAGIC: u32 = 0x4d44_5247;

/// The value fields of a `BufferHandle`, as they cross a process boundary.  The descriptor
/// travels out of band, `has_fd` says whether one accompanies the bytes.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
struct HandleWire {
    magic: u32,
    width: u32,
    height: u32,
    format: u32,
    usage: u32,
    name: u32,
    stride: u32,
    has_fd: u32,
}

/// The cross-process description of a buffer.
///
/// A fresh handle carries only the requested geometry.  Once a backend allocated or imported
/// the buffer it also carries a transport reference (a descriptor, a global name or both) and
/// the stride, which is everything another process needs to import it.
#[derive(Debug)]
pub struct BufferHandle {
    pub width: u32,
    pub height: u32,
    /// HAL pixel format.
    pub format: u32,
    pub usage: GrallocUsage,
    /// Bytes per row of the luma/first plane.
    pub stride: u32,
    /// Global GEM name, zero when the buffer has none.
    pub name: u32,
    pub descriptor: Option<SafeDescriptor>,
    /// Buffer object this handle was re-hydrated into in this process.  Never serialized.
    pub(crate) local: Option<Weak<BufferObject>>,
}

impl BufferHandle {
    /// Returns a handle requesting a new `width` x `height` buffer.
    pub fn new(width: u32, height: u32, format: u32, usage: GrallocUsage) -> BufferHandle {
        BufferHandle {
            width,
            height,
            format,
            usage,
            stride: 0,
            name: 0,
            descriptor: None,
            local: None,
        }
    }

    /// Duplicates the handle, including its descriptor and its process-local back-reference.
    pub fn try_clone(&self) -> GrallocResult<BufferHandle> {
        let descriptor = match &self.descriptor {
            Some(descriptor) => Some(descriptor.try_clone()?),
            None => None,
        };

        Ok(BufferHandle {
            width: self.width,
            height: self.height,
            format: self.format,
            usage: self.usage,
            stride: self.stride,
            name: self.name,
            descriptor,
            local: self.local.clone(),
        })
    }

    /// Returns true if the handle refers to an existing buffer rather than requesting one.
    pub fn has_transport_ref(&self) -> bool {
        self.descriptor.is_some() || self.name != 0
    }

    /// Serializes the value fields.  The returned descriptor, if any, must be sent alongside the
    /// bytes (e.g. as `SCM_RIGHTS`).
    pub fn to_wire(&self) -> GrallocResult<(Vec<u8>, Option<SafeDescriptor>)> {
        let descriptor = match &self.descriptor {
            Some(descriptor) => Some(descriptor.try_clone()?),
            None => None,
        };

        let wire = HandleWire {
            magic: HANDLE_MAGIC,
            width: self.width,
            height: self.height,
            format: self.format,
            usage: self.usage.0,
            name: self.name,
            stride: self.stride,
            has_fd: descriptor.is_some() as u32,
        };

        Ok((wire.as_bytes().to_vec(), descriptor))
    }

    /// Rebuilds a handle received from another process.  The back-reference is left empty until
    /// the handle is registered.
    pub fn from_wire(
        bytes: &[u8],
        descriptor: Option<SafeDescriptor>,
    ) -> GrallocResult<BufferHandle> {
        if bytes.len() != size_of::<HandleWire>() {
            error!(
                "handle of {} bytes, expected {}",
                bytes.len(),
                size_of::<HandleWire>()
            );
            return Err(GrallocError::InvalidHandle);
        }

        let wire = HandleWire::read_from(bytes).ok_or(GrallocError::InvalidHandle)?;
        if wire.magic != HANDLE_MAGIC {
            error!("invalid handle magic 0x{:x}", wire.magic);
            return Err(GrallocError::InvalidHandle);
        }

        if (wire.has_fd != 0) != descriptor.is_some() {
            error!("handle descriptor mismatch (has_fd = {})", wire.has_fd);
            return Err(GrallocError::InvalidHandle);
        }

        Ok(BufferHandle {
            width: wire.width,
            height: wire.height,
            format: wire.format,
            usage: GrallocUsage::new(wire.usage),
            stride: wire.stride,
            name: wire.name,
            descriptor,
            local: None,
        })
    }

    /// Returns the buffer object this handle was re-hydrated into, if it is still alive.
    pub fn local_bo(&self) -> Option<Arc<BufferObject>> {
        self.local
            .as_ref()
            .and_then(Weak::upgrade)
            .filter(|bo| !bo.is_freed())
    }
}

#[derive(Copy, Clone, Debug)]
enum LockState {
    Unlocked,
    Locked { rect: Rect, write: bool },
}

struct BoState {
    native: Option<NativeBuffer>,
    lock: LockState,
}

/// A buffer allocated or imported by a context's backend.
///
/// The reference count is separate from the `Arc`: it counts registrations and owners as the
/// gralloc protocol defines them, and the native buffer is freed when it reaches zero even if
/// `Arc`s are still around.  Every operation on a freed buffer object fails with
/// `InvalidBufferObject`.
pub struct BufferObject {
    ctx: Arc<ContextInner>,
    handle: BufferHandle,
    fb_handle: u32,
    fb_id: AtomicU32,
    refcount: AtomicU32,
    state: Mutex<BoState>,
}

impl BufferObject {
    /// Allocates or imports the buffer `handle` describes through the context's backend.
    pub(crate) fn new(
        ctx: Arc<ContextInner>,
        mut handle: BufferHandle,
    ) -> GrallocResult<Arc<BufferObject>> {
        let DriverBuffer { native, fb_handle } = ctx.driver.allocate_buffer(&mut handle)?;
        ctx.buffer_created();

        debug!(
            "new {:?} bo: {}x{} format 0x{:x} stride {}",
            native.backend(),
            handle.width,
            handle.height,
            handle.format,
            handle.stride
        );

        Ok(Arc::new_cyclic(|weak| {
            handle.local = Some(weak.clone());
            BufferObject {
                ctx,
                handle,
                fb_handle,
                fb_id: AtomicU32::new(0),
                refcount: AtomicU32::new(1),
                state: Mutex::new(BoState {
                    native: Some(native),
                    lock: LockState::Unlocked,
                }),
            }
        }))
    }

    fn lock_state(&self) -> MutexGuard<BoState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn context(&self) -> &Arc<ContextInner> {
        &self.ctx
    }

    /// The handle as completed by the backend.
    pub fn handle(&self) -> &BufferHandle {
        &self.handle
    }

    pub fn width(&self) -> u32 {
        self.handle.width
    }

    pub fn height(&self) -> u32 {
        self.handle.height
    }

    pub fn format(&self) -> u32 {
        self.handle.format
    }

    pub fn usage(&self) -> GrallocUsage {
        self.handle.usage
    }

    pub fn stride(&self) -> u32 {
        self.handle.stride
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn is_freed(&self) -> bool {
        self.refcount() == 0
    }

    /// Returns a transportable copy of the handle and its stride.
    pub fn get_handle(&self) -> GrallocResult<(BufferHandle, u32)> {
        Ok((self.handle.try_clone()?, self.handle.stride))
    }

    /// Takes a reference unless the buffer object was already freed.
    pub(crate) fn try_incref(&self) -> bool {
        self.refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count == 0 {
                    None
                } else {
                    count.checked_add(1)
                }
            })
            .is_ok()
    }

    pub fn incref(&self) -> GrallocResult<()> {
        if self.try_incref() {
            Ok(())
        } else {
            Err(GrallocError::InvalidBufferObject)
        }
    }

    /// Drops a reference and frees the native buffer when it was the last one.  Returns true if
    /// the buffer was freed.
    pub fn decref(&self) -> GrallocResult<bool> {
        let previous = self
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .map_err(|_| GrallocError::InvalidBufferObject)?;

        if previous > 1 {
            return Ok(false);
        }

        self.remove_framebuffer();
        self.release();
        Ok(true)
    }

    fn release(&self) {
        let native = {
            let mut state = self.lock_state();
            if let LockState::Locked { .. } = state.lock {
                warn!("freeing a locked buffer object");
                if let Some(native) = state.native.as_mut() {
                    self.ctx.driver.unmap(native);
                }
                state.lock = LockState::Unlocked;
            }
            state.native.take()
        };

        if let Some(native) = native {
            self.ctx.driver.free(native);
            self.ctx.buffer_released();
        }
    }

    /// Maps the buffer for CPU access and returns the mapping.  An empty `rect` locks the whole
    /// buffer.  Locking is not re-entrant.
    pub fn lock(&self, rect: Rect, write: bool) -> GrallocResult<GrallocMapping> {
        let rect = if rect.is_empty() {
            Rect::new(0, 0, self.handle.width, self.handle.height)
        } else {
            let (x, y, w, h) = (rect.x, rect.y, rect.w, rect.h);
            let (width, height) = (self.handle.width, self.handle.height);
            let right = checked_arithmetic!(x + w)?;
            let bottom = checked_arithmetic!(y + h)?;
            checked_range!(right <= width)?;
            checked_range!(bottom <= height)?;
            rect
        };

        let mut state = self.lock_state();
        if let LockState::Locked { .. } = state.lock {
            return Err(GrallocError::AlreadyLocked);
        }

        let native = state
            .native
            .as_mut()
            .ok_or(GrallocError::InvalidBufferObject)?;
        let mapping = self.ctx.driver.map(native, rect, write).map_err(|e| {
            error!("failed to map buffer object: {}", e);
            match e {
                GrallocError::MapFailed(_) => e,
                other => GrallocError::MapFailed(-other.errno()),
            }
        })?;

        // Rows are addressed from the start of the buffer, whatever the rect.
        if mapping.size < native.size() {
            error!(
                "mapping of {} bytes is short of the {} byte buffer",
                mapping.size,
                native.size()
            );
            self.ctx.driver.unmap(native);
            return Err(GrallocError::MapFailed(libc::EFAULT));
        }

        state.lock = LockState::Locked { rect, write };
        Ok(mapping)
    }

    /// Ends CPU access started by `lock`.  The mapping must not be used afterwards.
    pub fn unlock(&self) {
        let mut state = self.lock_state();
        let state = &mut *state;
        match state.lock {
            LockState::Unlocked => warn!("unlocking a buffer object that is not locked"),
            LockState::Locked { rect, write, .. } => {
                debug!("unlock {:?} (write = {})", rect, write);
                if let Some(native) = state.native.as_mut() {
                    self.ctx.driver.unmap(native);
                }
                state.lock = LockState::Unlocked;
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self.lock_state().lock, LockState::Locked { .. })
    }

    /// The backend-native handle of the buffer, the GEM handle for DRM backends.
    pub fn gem_handle(&self) -> GrallocResult<u32> {
        self.lock_state()
            .native
            .as_ref()
            .map(NativeBuffer::handle)
            .ok_or(GrallocError::InvalidBufferObject)
    }

    /// Exports a new descriptor for the buffer.
    pub fn export_descriptor(&self) -> GrallocResult<SafeDescriptor> {
        self.lock_state()
            .native
            .as_ref()
            .ok_or(GrallocError::InvalidBufferObject)?
            .export_descriptor()
    }

    /// Per-plane pitches, offsets and handles the display needs to scan the buffer out.
    pub fn resolve_format(&self) -> GrallocResult<FramebufferRequest> {
        let handle = match self.fb_handle {
            0 => self.gem_handle()?,
            fb_handle => fb_handle,
        };
        if self.is_freed() {
            return Err(GrallocError::InvalidBufferObject);
        }

        let layout = framebuffer_layout(self.handle.format, self.handle.stride, self.handle.height)?;
        let mut handles = [0; 4];
        for plane_handle in handles.iter_mut().take(layout.num_planes) {
            *plane_handle = handle;
        }

        Ok(FramebufferRequest {
            width: self.handle.width,
            height: self.handle.height,
            layout,
            handles,
        })
    }

    /// The attached framebuffer, zero when there is none.
    pub fn fb_id(&self) -> u32 {
        self.fb_id.load(Ordering::Acquire)
    }

    /// Returns true if the buffer is meant for the primary display and has no framebuffer yet.
    pub fn needs_framebuffer(&self) -> bool {
        self.handle.usage.uses_hw_fb() && self.fb_id() == 0
    }

    /// Attaches the buffer to the display.  Does nothing for buffers not allocated for the
    /// primary display.
    pub fn add_framebuffer(&self) -> GrallocResult<()> {
        if !self.handle.usage.uses_hw_fb() {
            return Ok(());
        }

        let mut display = self.ctx.lock_display();
        self.attach_framebuffer(&mut display).map(|_| ())
    }

    /// Attaches the buffer regardless of its usage and returns the framebuffer id.  Used for the
    /// copy swap front buffer and for overlay planes.  The caller holds the display lock.
    pub(crate) fn attach_framebuffer(&self, display: &mut DisplayState) -> GrallocResult<u32> {
        let fb_id = self.fb_id();
        if fb_id != 0 {
            return Ok(fb_id);
        }

        let request = self.resolve_format()?;
        let kms = display.initialized_kms()?;
        let fb_id = kms.add_framebuffer(&request).map_err(|e| {
            error!(
                "failed to attach framebuffer: {:?}, pitches {:?}: {}",
                request.layout.drm_format, request.layout.pitches, e
            );
            GrallocError::FramebufferAttachFailed(-e.errno())
        })?;

        if let Err(existing) =
            self.fb_id
                .compare_exchange(0, fb_id, Ordering::AcqRel, Ordering::Acquire)
        {
            let _ = kms.remove_framebuffer(fb_id);
            return Ok(existing);
        }

        Ok(fb_id)
    }

    /// Detaches the framebuffer, if any.
    pub fn remove_framebuffer(&self) {
        if self.fb_id() == 0 {
            return;
        }

        let mut display = self.ctx.lock_display();
        self.detach_framebuffer(&mut display);
    }

    pub(crate) fn detach_framebuffer(&self, display: &mut DisplayState) {
        let fb_id = self.fb_id.swap(0, Ordering::AcqRel);
        if fb_id == 0 {
            return;
        }

        match display.kms.as_mut() {
            Some(kms) => {
                if let Err(e) = kms.remove_framebuffer(fb_id) {
                    warn!("failed to remove framebuffer {}: {}", fb_id, e);
                }
            }
            None => warn!("framebuffer {} outlived the display", fb_id),
        }
    }

    /// Presents the buffer on the primary display.  Flips return once queued.
    pub fn post(self: &Arc<Self>) -> GrallocResult<()> {
        if self.is_freed() {
            return Err(GrallocError::InvalidBufferObject);
        }

        self.ctx.post(self)
    }

    /// Copies the pixels of `src` into this buffer, row by row.  Both are locked meanwhile.
    /// The formats must match, no conversion is done.
    pub(crate) fn blit_from(&self, src: &BufferObject) -> GrallocResult<()> {
        if src.format() != self.format() {
            error!(
                "can not copy format 0x{:x} into a 0x{:x} front buffer",
                src.format(),
                self.format()
            );
            return Err(GrallocError::PresentFailed(libc::EINVAL));
        }

        let dst_map = self.lock(Rect::default(), true)?;
        let src_map = match src.lock(Rect::default(), false) {
            Ok(mapping) => mapping,
            Err(e) => {
                self.unlock();
                return Err(e);
            }
        };

        let row_bytes = self.stride().min(src.stride()) as u64;
        let rows = self.height().min(src.height()) as u64;
        for row in 0..rows {
            let dst_offset = row * self.stride() as u64;
            let src_offset = row * src.stride() as u64;
            if dst_offset + row_bytes > dst_map.size || src_offset + row_bytes > src_map.size {
                break;
            }

            // Safe because both ranges were bounds checked against their live mappings, and two
            // distinct buffer objects never share a mapping.
            unsafe {
                copy_nonoverlapping(
                    (src_map.ptr + src_offset) as *const u8,
                    (dst_map.ptr + dst_offset) as *mut u8,
                    row_bytes as usize,
                );
            }
        }

        src.unlock();
        self.unlock();
        Ok(())
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        let fb_id = self.fb_id.swap(0, Ordering::AcqRel);
        if fb_id != 0 {
            // The display lock may be held by whoever dropped the last reference.
            match self.ctx.display.try_lock() {
                Ok(mut display) => {
                    if let Some(kms) = display.kms.as_mut() {
                        let _ = kms.remove_framebuffer(fb_id);
                    }
                }
                Err(_) => warn!("leaking framebuffer {}", fb_id),
            }
        }

        if !self.is_freed() {
            debug!("dropping a buffer object with {} references", self.refcount());
        }
        self.release();
    }
}

impl std::fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferObject")
            .field("width", &self.handle.width)
            .field("height", &self.handle.height)
            .field("format", &self.handle.format)
            .field("stride", &self.handle.stride)
            .field("fb_id", &self.fb_id())
            .field("refcount", &self.refcount())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::HAL_PIXEL_FORMAT_BGRA_8888;
    use crate::formats::HAL_PIXEL_FORMAT_RGB_565;
    use crate::gralloc_core::GrallocBuilder;
    use crate::gralloc_core::GrallocContext;
    use crate::gralloc_drv::GrallocBackend;
    use crate::gralloc_os::round_up_to_page_size;
    use crate::gralloc_os::AsRawDescriptor;
    use crate::kms::HeadlessKms;

    fn context() -> GrallocContext {
        GrallocBuilder::new()
            .set_backend(GrallocBackend::System)
            .set_kms(Box::new(HeadlessKms::new(640, 480)))
            .build()
            .unwrap()
    }

    #[test]
    fn wire_round_trip() {
        let ctx = context();
        let bo = ctx
            .bo_create(
                64,
                32,
                HAL_PIXEL_FORMAT_RGB_565,
                GrallocUsage::empty().use_sw_read(true),
            )
            .unwrap();

        let (handle, stride) = bo.get_handle().unwrap();
        assert_eq!(stride, 128);

        let (bytes, descriptor) = handle.to_wire().unwrap();
        assert_eq!(bytes.len(), size_of::<HandleWire>());
        let received = BufferHandle::from_wire(&bytes, descriptor).unwrap();
        assert_eq!(received.width, 64);
        assert_eq!(received.height, 32);
        assert_eq!(received.format, HAL_PIXEL_FORMAT_RGB_565);
        assert_eq!(received.stride, 128);
        assert_eq!(received.usage, handle.usage);
        assert!(received.local.is_none());
        assert_eq!(
            received.descriptor.as_ref().unwrap().object_id().unwrap(),
            handle.descriptor.as_ref().unwrap().object_id().unwrap()
        );
    }

    #[test]
    fn garbled_handles() {
        let handle = BufferHandle::new(8, 8, HAL_PIXEL_FORMAT_BGRA_8888, GrallocUsage::empty());
        let (mut bytes, descriptor) = handle.to_wire().unwrap();
        assert!(descriptor.is_none());

        assert!(matches!(
            BufferHandle::from_wire(&bytes[1..], None),
            Err(GrallocError::InvalidHandle)
        ));

        bytes[0] ^= 0xff;
        assert!(matches!(
            BufferHandle::from_wire(&bytes, None),
            Err(GrallocError::InvalidHandle)
        ));
    }

    #[test]
    fn descriptor_must_match_wire() {
        let ctx = context();
        let bo = ctx
            .bo_create(8, 8, HAL_PIXEL_FORMAT_BGRA_8888, GrallocUsage::empty())
            .unwrap();
        let (bytes, descriptor) = bo.handle().to_wire().unwrap();
        assert!(descriptor.is_some());
        assert!(matches!(
            BufferHandle::from_wire(&bytes, None),
            Err(GrallocError::InvalidHandle)
        ));
    }

    #[test]
    fn lock_is_not_reentrant() {
        let ctx = context();
        let bo = ctx
            .bo_create(
                16,
                16,
                HAL_PIXEL_FORMAT_BGRA_8888,
                GrallocUsage::empty().use_sw_write(true),
            )
            .unwrap();

        let mapping = bo.lock(Rect::new(0, 0, 16, 16), true).unwrap();
        assert_ne!(mapping.ptr, 0);
        assert!(bo.is_locked());
        assert!(matches!(
            bo.lock(Rect::new(0, 0, 4, 4), false),
            Err(GrallocError::AlreadyLocked)
        ));

        bo.unlock();
        assert!(!bo.is_locked());
        bo.lock(Rect::new(4, 4, 4, 4), false).unwrap();
        bo.unlock();
    }

    #[test]
    fn lock_outside_buffer() {
        let ctx = context();
        let bo = ctx
            .bo_create(16, 16, HAL_PIXEL_FORMAT_BGRA_8888, GrallocUsage::empty())
            .unwrap();
        assert!(matches!(
            bo.lock(Rect::new(8, 0, 16, 16), true),
            Err(GrallocError::CheckedRange { .. })
        ));
        assert!(!bo.is_locked());
    }

    #[test]
    fn rect_locks_map_whole_buffer() {
        let ctx = context();
        let bo = ctx
            .bo_create(16, 16, HAL_PIXEL_FORMAT_BGRA_8888, GrallocUsage::empty())
            .unwrap();
        let mapping = bo.lock(Rect::new(4, 4, 4, 4), false).unwrap();
        assert_eq!(
            mapping.size,
            round_up_to_page_size(16 * 16 * 4).unwrap()
        );
        bo.unlock();
    }

    #[test]
    fn refcounting() {
        let ctx = context();
        let bo = ctx
            .bo_create(16, 16, HAL_PIXEL_FORMAT_BGRA_8888, GrallocUsage::empty())
            .unwrap();
        assert_eq!(bo.refcount(), 1);
        assert_eq!(ctx.num_buffers(), 1);

        bo.incref().unwrap();
        assert!(!bo.decref().unwrap());
        assert_eq!(ctx.num_buffers(), 1);
        assert!(bo.decref().unwrap());
        assert_eq!(ctx.num_buffers(), 0);

        assert!(bo.is_freed());
        assert!(matches!(bo.decref(), Err(GrallocError::InvalidBufferObject)));
        assert!(matches!(bo.incref(), Err(GrallocError::InvalidBufferObject)));
        assert!(matches!(
            bo.lock(Rect::default(), false),
            Err(GrallocError::InvalidBufferObject)
        ));
        assert!(bo.handle().local_bo().is_none());
    }

    #[test]
    fn dropping_frees() {
        let ctx = context();
        let bo = ctx
            .bo_create(16, 16, HAL_PIXEL_FORMAT_BGRA_8888, GrallocUsage::empty())
            .unwrap();
        assert_eq!(ctx.num_buffers(), 1);
        drop(bo);
        assert_eq!(ctx.num_buffers(), 0);
    }

    #[test]
    fn exported_descriptors_are_fresh() {
        let ctx = context();
        let bo = ctx
            .bo_create(16, 16, HAL_PIXEL_FORMAT_BGRA_8888, GrallocUsage::empty())
            .unwrap();
        let exported = bo.export_descriptor().unwrap();
        let original = bo.handle().descriptor.as_ref().unwrap();
        assert_ne!(exported.as_raw_descriptor(), original.as_raw_descriptor());
        assert_eq!(exported.object_id().unwrap(), original.object_id().unwrap());
    }

    #[test]
    fn framebuffer_needs_hw_fb() {
        let ctx = context();
        ctx.init_kms().unwrap();

        let texture = ctx
            .bo_create(
                64,
                64,
                HAL_PIXEL_FORMAT_BGRA_8888,
                GrallocUsage::empty().use_hw_texture(true),
            )
            .unwrap();
        assert!(!texture.needs_framebuffer());
        texture.add_framebuffer().unwrap();
        assert_eq!(texture.fb_id(), 0);

        let scanout = ctx
            .bo_create(
                64,
                64,
                HAL_PIXEL_FORMAT_BGRA_8888,
                GrallocUsage::empty().use_hw_fb(true),
            )
            .unwrap();
        assert!(scanout.needs_framebuffer());
        scanout.add_framebuffer().unwrap();
        assert_ne!(scanout.fb_id(), 0);
        assert!(!scanout.needs_framebuffer());

        scanout.remove_framebuffer();
        assert_eq!(scanout.fb_id(), 0);
        scanout.remove_framebuffer();
        assert!(scanout.decref().unwrap());
    }

    #[test]
    fn framebuffer_needs_display() {
        let ctx = context();
        let bo = ctx
            .bo_create(
                64,
                64,
                HAL_PIXEL_FORMAT_BGRA_8888,
                GrallocUsage::empty().use_hw_fb(true),
            )
            .unwrap();
        assert!(matches!(
            bo.add_framebuffer(),
            Err(GrallocError::KmsNotInitialized)
        ));
    }
}
