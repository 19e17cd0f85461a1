// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! dumb: allocation through KMS dumb buffers.  Works on every KMS driver, at the price of
//! linear, CPU-allocated memory.  Buffers are shared as dma-bufs, global names are produced
//! when the device allows it.

#![allow(non_camel_case_types)]

use std::os::raw::c_uint;
use std::sync::Arc;

use log::debug;
use log::error;
use log::warn;
use nix::ioctl_readwrite;
use nix::ioctl_write_ptr;

use crate::buffer::BufferHandle;
use crate::drm_device::DrmDevice;
use crate::drm_device::DRM_IOCTL_BASE;
use crate::formats::BufferGeometry;
use crate::gralloc_drv::default_kms_features;
use crate::gralloc_drv::GrallocBackend;
use crate::gralloc_drv::GrallocDriver;
use crate::gralloc_drv::NativeBuffer;
use crate::gralloc_os::AsRawDescriptor;
use crate::gralloc_os::MemoryMapping;
use crate::gralloc_os::SafeDescriptor;
use crate::gralloc_utils::*;
use crate::kms::DisplayConfig;
use crate::kms::SwapMode;

const DRM_IOCTL_MODE_CREATE_DUMB: c_uint = 0xB2;
const DRM_IOCTL_MODE_MAP_DUMB: c_uint = 0xB3;

const DMA_BUF_BASE: u8 = b'b';
const DMA_BUF_IOCTL_SYNC: u8 = 0;
const DMA_BUF_SYNC_READ: u64 = 1;
const DMA_BUF_SYNC_WRITE: u64 = 2;
const DMA_BUF_SYNC_START: u64 = 0;
const DMA_BUF_SYNC_END: u64 = 4;

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_mode_create_dumb {
    height: u32,
    width: u32,
    bpp: u32,
    flags: u32,
    handle: u32,
    pitch: u32,
    size: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_mode_map_dumb {
    handle: u32,
    pad: u32,
    offset: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct dma_buf_sync {
    flags: u64,
}

ioctl_readwrite!(
    drm_mode_create_dumb_ioctl,
    DRM_IOCTL_BASE,
    DRM_IOCTL_MODE_CREATE_DUMB,
    drm_mode_create_dumb
);
ioctl_readwrite!(
    drm_mode_map_dumb_ioctl,
    DRM_IOCTL_BASE,
    DRM_IOCTL_MODE_MAP_DUMB,
    drm_mode_map_dumb
);
ioctl_write_ptr!(
    dma_buf_ioctl_sync,
    DMA_BUF_BASE,
    DMA_BUF_IOCTL_SYNC,
    dma_buf_sync
);

/// A GEM object on the context's device, along with the dma-buf it is shared through.
#[derive(Debug)]
pub struct DumbBuffer {
    gem_handle: u32,
    size: u64,
    dmabuf: SafeDescriptor,
    mapping: Option<MemoryMapping>,
    sync_flags: u64,
}

impl DumbBuffer {
    pub fn gem_handle(&self) -> u32 {
        self.gem_handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn export(&self) -> GrallocResult<SafeDescriptor> {
        self.dmabuf.try_clone()
    }

    fn sync(&self, flags: u64) -> GrallocResult<()> {
        let sync = dma_buf_sync { flags };
        // Safe because the kernel only reads `sync`.
        unsafe {
            dma_buf_ioctl_sync(self.dmabuf.as_raw_descriptor(), &sync)?;
        }
        Ok(())
    }
}

/// A device capable of allocating `DumbBuffer`.
pub struct DumbGralloc {
    device: Arc<DrmDevice>,
    driver_name: String,
}

impl DumbGralloc {
    /// Returns a new `DumbGralloc` on `device`.
    pub fn init(device: Arc<DrmDevice>) -> GrallocResult<Box<dyn GrallocDriver>> {
        let driver_name = device.driver_name()?;
        Ok(Box::new(DumbGralloc {
            device,
            driver_name,
        }))
    }

    fn import_descriptor(&self, descriptor: &SafeDescriptor) -> GrallocResult<DumbBuffer> {
        let gem_handle = self.device.prime_fd_to_handle(descriptor)?;
        let size = match descriptor.seek_size() {
            Ok(size) => size,
            Err(e) => {
                let _ = self.device.gem_close(gem_handle);
                return Err(e);
            }
        };

        Ok(DumbBuffer {
            gem_handle,
            size,
            dmabuf: descriptor.try_clone()?,
            mapping: None,
            sync_flags: 0,
        })
    }

    fn import_name(&self, name: u32) -> GrallocResult<DumbBuffer> {
        let (gem_handle, size) = self.device.gem_open(name)?;
        match self.device.prime_handle_to_fd(gem_handle) {
            Ok(dmabuf) => Ok(DumbBuffer {
                gem_handle,
                size,
                dmabuf,
                mapping: None,
                sync_flags: 0,
            }),
            Err(e) => {
                let _ = self.device.gem_close(gem_handle);
                Err(e)
            }
        }
    }

    fn create(&self, handle: &mut BufferHandle) -> GrallocResult<DumbBuffer> {
        let geometry =
            BufferGeometry::new(handle.format, handle.width, handle.height).map_err(|e| {
                error!("unrecognized format 0x{:x}: {}", handle.format, e);
                e
            })?;

        let mut create = drm_mode_create_dumb {
            width: geometry.width,
            height: geometry.height,
            bpp: geometry.bytes_per_pixel * 8,
            ..Default::default()
        };
        // Safe because the kernel writes only within `create`.
        unsafe {
            drm_mode_create_dumb_ioctl(self.device.as_raw_descriptor(), &mut create)?;
        }

        let dmabuf = match self.device.prime_handle_to_fd(create.handle) {
            Ok(dmabuf) => dmabuf,
            Err(e) => {
                let _ = self.device.gem_close(create.handle);
                return Err(e);
            }
        };

        // Names need an authenticated client, descriptors are enough to share the buffer.
        let name = self.device.gem_flink(create.handle).unwrap_or_else(|e| {
            debug!("no global name for handle {}: {}", create.handle, e);
            0
        });

        handle.descriptor = Some(dmabuf.try_clone()?);
        handle.name = name;
        // The driver may pad rows beyond width * bpp.
        handle.stride = create.pitch;

        debug!(
            "created dumb buffer: handle = {}, pitch = {}, size = {}",
            create.handle, create.pitch, create.size
        );

        Ok(DumbBuffer {
            gem_handle: create.handle,
            size: create.size,
            dmabuf,
            mapping: None,
            sync_flags: 0,
        })
    }
}

impl GrallocDriver for DumbGralloc {
    fn backend(&self) -> GrallocBackend {
        GrallocBackend::Dumb
    }

    fn allocate(&self, handle: &mut BufferHandle) -> GrallocResult<NativeBuffer> {
        let buffer = if let Some(descriptor) = &handle.descriptor {
            self.import_descriptor(descriptor).map_err(|e| {
                error!("failed to import dma-buf: {}", e);
                GrallocError::ImportFailed
            })?
        } else if handle.name != 0 {
            let buffer = self.import_name(handle.name).map_err(|e| {
                error!("failed to import name {}: {}", handle.name, e);
                GrallocError::ImportFailed
            })?;
            handle.descriptor = Some(buffer.export()?);
            buffer
        } else {
            self.create(handle)?
        };

        Ok(NativeBuffer::Dumb(buffer))
    }

    fn free(&self, native: NativeBuffer) {
        match native {
            NativeBuffer::Dumb(mut buffer) => {
                buffer.mapping = None;
                if let Err(e) = self.device.gem_close(buffer.gem_handle) {
                    warn!("failed to close GEM handle {}: {}", buffer.gem_handle, e);
                }
            }
            other => error!("dumb gralloc asked to free a {:?} buffer", other.backend()),
        }
    }

    fn map(
        &self,
        native: &mut NativeBuffer,
        _rect: Rect,
        write: bool,
    ) -> GrallocResult<GrallocMapping> {
        let buffer = match native {
            NativeBuffer::Dumb(buffer) => buffer,
            _ => return Err(GrallocError::InvalidGrallocBackend),
        };

        if buffer.mapping.is_none() {
            let mut map = drm_mode_map_dumb {
                handle: buffer.gem_handle,
                ..Default::default()
            };
            // Safe because the kernel writes only within `map`.
            unsafe {
                drm_mode_map_dumb_ioctl(self.device.as_raw_descriptor(), &mut map)
                    .map_err(|e| GrallocError::MapFailed(e as i32))?;
            }

            let size: usize = buffer.size().try_into()?;
            let mapping =
                MemoryMapping::from_descriptor(self.device.as_ref(), map.offset, size, true)
                    .map_err(|e| GrallocError::MapFailed(-e.errno()))?;
            buffer.mapping = Some(mapping);
        }

        let mut flags = DMA_BUF_SYNC_READ;
        if write {
            flags |= DMA_BUF_SYNC_WRITE;
        }
        buffer
            .sync(DMA_BUF_SYNC_START | flags)
            .map_err(|e| GrallocError::MapFailed(-e.errno()))?;
        buffer.sync_flags = flags;

        buffer
            .mapping
            .as_ref()
            .map(MemoryMapping::as_gralloc_mapping)
            .ok_or(GrallocError::MapFailed(libc::EFAULT))
    }

    fn unmap(&self, native: &mut NativeBuffer) {
        if let NativeBuffer::Dumb(buffer) = native {
            if buffer.sync_flags == 0 {
                return;
            }

            if let Err(e) = buffer.sync(DMA_BUF_SYNC_END | buffer.sync_flags) {
                warn!("failed to end CPU access: {}", e);
            }
            buffer.sync_flags = 0;
        }
    }

    fn init_kms_features(&self, config: &mut DisplayConfig) {
        default_kms_features(config);

        // vmwgfx can not flip and only updates the screen on explicit dirty flushes.
        if self.driver_name == "vmwgfx" {
            config.vmwgfx_quirk = true;
            config.swap_mode = SwapMode::Copy;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::mem::size_of;

    use super::*;
    use crate::formats::HAL_PIXEL_FORMAT_BGRA_8888;

    #[test]
    fn uapi_layouts() {
        assert_eq!(size_of::<drm_mode_create_dumb>(), 32);
        assert_eq!(size_of::<drm_mode_map_dumb>(), 16);
        assert_eq!(size_of::<dma_buf_sync>(), 8);
    }

    #[test]
    fn allocate_when_available() {
        let device = match DrmDevice::open_default() {
            Ok(device) => Arc::new(device),
            // No DRM hardware on this machine.
            Err(_) => return,
        };
        let gralloc = match DumbGralloc::init(device) {
            Ok(gralloc) => gralloc,
            Err(_) => return,
        };

        let mut handle = BufferHandle::new(
            64,
            64,
            HAL_PIXEL_FORMAT_BGRA_8888,
            GrallocUsage::empty().use_sw_write(true),
        );
        let mut native = match gralloc.allocate(&mut handle) {
            Ok(native) => native,
            // Render-only devices have no dumb buffers.
            Err(_) => return,
        };

        assert!(handle.stride >= 64 * 4);
        assert!(handle.descriptor.is_some());
        assert!(native.size() >= (handle.stride * 64) as u64);

        let mapping = gralloc
            .map(&mut native, Rect::new(0, 0, 64, 64), true)
            .unwrap();
        assert_ne!(mapping.ptr, 0);
        gralloc.unmap(&mut native);
        gralloc.free(native);
    }
}
