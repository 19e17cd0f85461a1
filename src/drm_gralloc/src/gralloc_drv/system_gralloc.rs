// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility file for allocating exportable system memory.  On Linux systems,
//! this is is often done with memfd.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use log::error;

use crate::buffer::BufferHandle;
use crate::formats::BufferGeometry;
use crate::gralloc_drv::default_kms_features;
use crate::gralloc_drv::GrallocBackend;
use crate::gralloc_drv::GrallocDriver;
use crate::gralloc_drv::NativeBuffer;
use crate::gralloc_os::round_up_to_page_size;
use crate::gralloc_os::MemoryMapping;
use crate::gralloc_os::SafeDescriptor;
use crate::gralloc_os::SharedMemory;
use crate::gralloc_utils::*;
use crate::kms::DisplayConfig;

/// A memfd allocation.
#[derive(Debug)]
pub struct SystemBuffer {
    descriptor: SafeDescriptor,
    size: u64,
    id: u32,
    mapping: Option<MemoryMapping>,
}

impl SystemBuffer {
    /// Process-unique id standing in for a GEM handle.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn export(&self) -> GrallocResult<SafeDescriptor> {
        self.descriptor.try_clone()
    }
}

/// A gralloc implementation capable of allocation from system memory.
pub struct SystemGralloc {
    next_id: AtomicU32,
}

impl SystemGralloc {
    fn new() -> Self {
        SystemGralloc {
            next_id: AtomicU32::new(1),
        }
    }

    /// Returns a new `SystemGralloc` instance.
    pub fn init() -> GrallocResult<Box<dyn GrallocDriver>> {
        Ok(Box::new(SystemGralloc::new()))
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn import(&self, descriptor: &SafeDescriptor) -> GrallocResult<SystemBuffer> {
        let descriptor = descriptor.try_clone()?;
        let size = descriptor.seek_size()?;
        if size == 0 {
            return Err(GrallocError::ImportFailed);
        }

        Ok(SystemBuffer {
            descriptor,
            size,
            id: self.next_id(),
            mapping: None,
        })
    }
}

impl GrallocDriver for SystemGralloc {
    fn backend(&self) -> GrallocBackend {
        GrallocBackend::System
    }

    fn allocate(&self, handle: &mut BufferHandle) -> GrallocResult<NativeBuffer> {
        if let Some(descriptor) = &handle.descriptor {
            let buffer = self.import(descriptor).map_err(|e| {
                error!("failed to import memfd: {}", e);
                GrallocError::ImportFailed
            })?;
            return Ok(NativeBuffer::System(buffer));
        }

        if handle.name != 0 {
            // Global names only exist for GEM objects.
            error!("can not import name {} from system memory", handle.name);
            return Err(GrallocError::ImportFailed);
        }

        let geometry =
            BufferGeometry::new(handle.format, handle.width, handle.height).map_err(|e| {
                error!("unrecognized format 0x{:x}: {}", handle.format, e);
                e
            })?;

        let size = round_up_to_page_size(geometry.size)?;
        let descriptor: SafeDescriptor = SharedMemory::new("drm_gralloc", size)?.into();

        handle.descriptor = Some(descriptor.try_clone()?);
        handle.stride = geometry.stride;

        Ok(NativeBuffer::System(SystemBuffer {
            descriptor,
            size,
            id: self.next_id(),
            mapping: None,
        }))
    }

    fn free(&self, native: NativeBuffer) {
        match native {
            // Unmaps, then closes the memfd.
            NativeBuffer::System(buffer) => drop(buffer),
            other => error!("system gralloc asked to free a {:?} buffer", other.backend()),
        }
    }

    fn map(
        &self,
        native: &mut NativeBuffer,
        _rect: Rect,
        _write: bool,
    ) -> GrallocResult<GrallocMapping> {
        let buffer = match native {
            NativeBuffer::System(buffer) => buffer,
            _ => return Err(GrallocError::InvalidGrallocBackend),
        };

        if buffer.mapping.is_none() {
            let size: usize = buffer.size().try_into()?;
            let mapping = MemoryMapping::from_descriptor(&buffer.descriptor, 0, size, true)
                .map_err(|e| {
                    error!("failed to map memfd: {}", e);
                    GrallocError::MapFailed(-e.errno())
                })?;
            buffer.mapping = Some(mapping);
        }

        buffer
            .mapping
            .as_ref()
            .map(MemoryMapping::as_gralloc_mapping)
            .ok_or(GrallocError::MapFailed(libc::EFAULT))
    }

    fn unmap(&self, _native: &mut NativeBuffer) {
        // Shared memory is always coherent.
    }

    fn init_kms_features(&self, config: &mut DisplayConfig) {
        default_kms_features(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::HAL_PIXEL_FORMAT_DRM_NV12;
    use crate::formats::HAL_PIXEL_FORMAT_RGBA_8888;
    use crate::gralloc_os::AsRawDescriptor;

    #[test]
    fn allocate_writes_back() {
        let gralloc = SystemGralloc::new();
        let mut handle = BufferHandle::new(
            100,
            100,
            HAL_PIXEL_FORMAT_DRM_NV12,
            GrallocUsage::empty().use_sw_write(true),
        );

        let native = gralloc.allocate(&mut handle).unwrap();
        assert_eq!(handle.stride, 128);
        assert!(handle.descriptor.is_some());
        assert_eq!(native.size(), round_up_to_page_size(128 * 150).unwrap());
        gralloc.free(native);
    }

    #[test]
    fn unsupported_format() {
        let gralloc = SystemGralloc::new();
        let mut handle = BufferHandle::new(16, 16, 0x7f, GrallocUsage::empty());
        assert!(matches!(
            gralloc.allocate(&mut handle),
            Err(GrallocError::UnsupportedFormat(0x7f))
        ));
        assert!(handle.descriptor.is_none());
    }

    #[test]
    fn import_shares_memory() {
        let gralloc = SystemGralloc::new();
        let mut handle = BufferHandle::new(
            16,
            16,
            HAL_PIXEL_FORMAT_RGBA_8888,
            GrallocUsage::empty().use_sw_write(true),
        );
        let mut native = gralloc.allocate(&mut handle).unwrap();

        let mut imported_handle = handle.try_clone().unwrap();
        let mut imported = gralloc.allocate(&mut imported_handle).unwrap();
        assert_ne!(native.handle(), imported.handle());
        assert_eq!(native.size(), imported.size());

        let rect = Rect::new(0, 0, 16, 16);
        let mapping = gralloc.map(&mut native, rect, true).unwrap();
        unsafe { std::ptr::write_bytes(mapping.ptr as *mut u8, 0x5a, 64) };
        gralloc.unmap(&mut native);

        let mapping = gralloc.map(&mut imported, rect, false).unwrap();
        let contents = unsafe { std::slice::from_raw_parts(mapping.ptr as *const u8, 64) };
        assert!(contents.iter().all(|b| *b == 0x5a));
        gralloc.unmap(&mut imported);

        let exported = imported.export_descriptor().unwrap();
        assert_ne!(
            exported.as_raw_descriptor(),
            handle.descriptor.as_ref().unwrap().as_raw_descriptor()
        );

        gralloc.free(native);
        gralloc.free(imported);
    }

    #[test]
    fn names_are_not_importable() {
        let gralloc = SystemGralloc::new();
        let mut handle = BufferHandle::new(16, 16, HAL_PIXEL_FORMAT_RGBA_8888, Default::default());
        handle.name = 7;
        assert!(matches!(
            gralloc.allocate(&mut handle),
            Err(GrallocError::ImportFailed)
        ));
    }
}
