// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! freedreno: implements buffer allocation for Adreno GPUs using libdrm_freedreno.
//!
//! External code found at <https://gitlab.freedesktop.org/mesa/drm/-/tree/main/freedreno>.

#![cfg(feature = "freedreno")]

use std::fmt;
use std::io::Error;
use std::ptr::null_mut;
use std::sync::Arc;

use log::debug;
use log::error;

use crate::buffer::BufferHandle;
use crate::drm_device::DrmDevice;
use crate::formats::BufferGeometry;
use crate::gralloc_drv::default_kms_features;
use crate::gralloc_drv::freedreno_bindings::*;
use crate::gralloc_drv::GrallocBackend;
use crate::gralloc_drv::GrallocDriver;
use crate::gralloc_drv::NativeBuffer;
use crate::gralloc_os::AsRawDescriptor;
use crate::gralloc_os::FromRawDescriptor;
use crate::gralloc_os::SafeDescriptor;
use crate::gralloc_utils::*;
use crate::kms::DisplayConfig;

struct FreedrenoDeviceInner {
    _device: Arc<DrmDevice>,
    dev: *mut fd_device,
}

// Safe because libdrm_freedreno serializes access to its device table internally.
unsafe impl Send for FreedrenoDeviceInner {}
unsafe impl Sync for FreedrenoDeviceInner {}

impl Drop for FreedrenoDeviceInner {
    fn drop(&mut self) {
        // Safe because FreedrenoDeviceInner is only constructed with a valid fd_device.
        unsafe {
            fd_device_del(self.dev);
        }
    }
}

/// A device capable of allocating `FreedrenoBuffer`.
pub struct FreedrenoGralloc {
    device: Arc<FreedrenoDeviceInner>,
}

impl FreedrenoGralloc {
    /// Returns a new `FreedrenoGralloc` on `device` if libdrm_freedreno accepts it.
    pub fn init(device: Arc<DrmDevice>) -> GrallocResult<Box<dyn GrallocDriver>> {
        // fd_device_new is safe to call with a valid fd, and we check that a valid one is
        // returned.  The DrmDevice outlives the fd_device since both live in the inner struct.
        let dev = unsafe { fd_device_new(device.as_raw_descriptor()) };
        if dev.is_null() {
            error!("failed to create freedreno device");
            return Err(GrallocError::IoError(Error::last_os_error()));
        }

        Ok(Box::new(FreedrenoGralloc {
            device: Arc::new(FreedrenoDeviceInner {
                _device: device,
                dev,
            }),
        }))
    }

    fn wrap(&self, bo: *mut fd_bo) -> GrallocResult<FreedrenoBuffer> {
        if bo.is_null() {
            return Err(GrallocError::ImportFailed);
        }

        Ok(FreedrenoBuffer {
            bo,
            _device: self.device.clone(),
        })
    }
}

impl GrallocDriver for FreedrenoGralloc {
    fn backend(&self) -> GrallocBackend {
        GrallocBackend::Freedreno
    }

    fn allocate(&self, handle: &mut BufferHandle) -> GrallocResult<NativeBuffer> {
        let buffer = if let Some(descriptor) = &handle.descriptor {
            debug!("import: fd = {}", descriptor.as_raw_descriptor());
            // Safe because the descriptor stays valid for the call, libdrm_freedreno dups it.
            let bo = unsafe { fd_bo_from_dmabuf(self.device.dev, descriptor.as_raw_descriptor()) };
            self.wrap(bo).map_err(|e| {
                error!("fd_bo_from_dmabuf() failed");
                e
            })?
        } else if handle.name != 0 {
            debug!("import: name = {}", handle.name);
            // Safe because the device is valid and the result is checked.
            let bo = unsafe { fd_bo_from_name(self.device.dev, handle.name) };
            let buffer = self.wrap(bo).map_err(|e| {
                error!("fd_bo_from_name() failed");
                e
            })?;
            handle.descriptor = Some(buffer.export()?);
            buffer
        } else {
            let geometry = BufferGeometry::new(handle.format, handle.width, handle.height)
                .map_err(|e| {
                    error!("unrecognized format 0x{:x}: {}", handle.format, e);
                    e
                })?;
            let size: u32 = geometry.size.try_into()?;

            // Safe because the device is valid and the result is checked.
            let bo = unsafe { fd_bo_new(self.device.dev, size, 0) };
            if bo.is_null() {
                error!("fd_bo_new() failed");
                return Err(GrallocError::IoError(Error::last_os_error()));
            }

            let buffer = self.wrap(bo)?;
            handle.descriptor = Some(buffer.export()?);
            handle.stride = geometry.stride;

            debug!("create: handle = {}, size = {}", buffer.gem_handle(), size);
            buffer
        };

        Ok(NativeBuffer::Freedreno(buffer))
    }

    fn free(&self, native: NativeBuffer) {
        match native {
            // fd_bo_del runs on drop.
            NativeBuffer::Freedreno(buffer) => drop(buffer),
            other => error!("freedreno asked to free a {:?} buffer", other.backend()),
        }
    }

    fn map(
        &self,
        native: &mut NativeBuffer,
        _rect: Rect,
        write: bool,
    ) -> GrallocResult<GrallocMapping> {
        let buffer = match native {
            NativeBuffer::Freedreno(buffer) => buffer,
            _ => return Err(GrallocError::InvalidGrallocBackend),
        };

        let mut op = DRM_FREEDRENO_PREP_READ;
        if write {
            op |= DRM_FREEDRENO_PREP_WRITE;
        }

        // This is always safe to call with a valid fd_bo pointer.  The mapping is owned by the
        // bo and released by fd_bo_del.
        let map = unsafe { fd_bo_map(buffer.bo) };
        if map.is_null() {
            return Err(GrallocError::MapFailed(libc::EFAULT));
        }

        // Safe because the bo is valid and no pipe is passed.
        let ret = unsafe { fd_bo_cpu_prep(buffer.bo, null_mut(), op) };
        if ret != 0 {
            return Err(GrallocError::MapFailed(ret.abs()));
        }

        Ok(GrallocMapping {
            ptr: map as u64,
            size: buffer.size(),
        })
    }

    fn unmap(&self, native: &mut NativeBuffer) {
        if let NativeBuffer::Freedreno(buffer) = native {
            // This is always safe to call with a valid fd_bo pointer.
            unsafe { fd_bo_cpu_fini(buffer.bo) };
        }
    }

    fn init_kms_features(&self, config: &mut DisplayConfig) {
        default_kms_features(config);
    }
}

/// An allocation from a `FreedrenoGralloc`.
pub struct FreedrenoBuffer {
    bo: *mut fd_bo,
    _device: Arc<FreedrenoDeviceInner>,
}

impl fmt::Debug for FreedrenoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreedrenoBuffer")
            .field("handle", &self.gem_handle())
            .field("size", &self.size())
            .finish()
    }
}

// Safe because libdrm_freedreno bos are reference counted under the device lock.
unsafe impl Send for FreedrenoBuffer {}
unsafe impl Sync for FreedrenoBuffer {}

impl FreedrenoBuffer {
    pub fn gem_handle(&self) -> u32 {
        // This is always safe to call with a valid fd_bo pointer.
        unsafe { fd_bo_handle(self.bo) }
    }

    pub fn size(&self) -> u64 {
        // This is always safe to call with a valid fd_bo pointer.
        unsafe { fd_bo_size(self.bo) as u64 }
    }

    /// Exports a new dmabuf/prime file descriptor.
    pub fn export(&self) -> GrallocResult<SafeDescriptor> {
        // This is always safe to call with a valid fd_bo pointer.
        match unsafe { fd_bo_dmabuf(self.bo) } {
            fd if fd >= 0 => {
                let dmabuf = unsafe { SafeDescriptor::from_raw_descriptor(fd) };
                Ok(dmabuf)
            }
            ret => Err(GrallocError::ComponentError(ret)),
        }
    }
}

impl Drop for FreedrenoBuffer {
    fn drop(&mut self) {
        // This is always safe to call with a valid fd_bo pointer.
        unsafe { fd_bo_del(self.bo) }
    }
}
