// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! gralloc_drv: the backend drivers buffer objects are allocated, imported and mapped through.

mod dumb;
#[cfg(feature = "freedreno")]
mod freedreno;
#[cfg(feature = "freedreno")]
mod freedreno_bindings;
mod system_gralloc;

use std::sync::Arc;

use log::info;

use crate::buffer::BufferHandle;
use crate::drm_device::DrmDevice;
use crate::formats::HAL_PIXEL_FORMAT_BGRA_8888;
use crate::formats::HAL_PIXEL_FORMAT_RGB_565;
use crate::gralloc_os::SafeDescriptor;
use crate::gralloc_utils::*;
use crate::kms::DisplayConfig;
use crate::kms::SwapMode;

pub use dumb::DumbBuffer;
pub use dumb::DumbGralloc;
#[cfg(feature = "freedreno")]
pub use freedreno::FreedrenoBuffer;
#[cfg(feature = "freedreno")]
pub use freedreno::FreedrenoGralloc;
pub use system_gralloc::SystemBuffer;
pub use system_gralloc::SystemGralloc;

/// Enumeration of possible allocation backends.
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum GrallocBackend {
    /// Anonymous shared memory.  Needs no device and can not be scanned out by real hardware.
    System,
    /// Driver-agnostic KMS dumb buffers.
    Dumb,
    /// Adreno buffers through libdrm_freedreno.
    Freedreno,
}

impl GrallocBackend {
    /// Picks the backend serving a device whose kernel driver is `driver_name`.
    pub fn for_driver_name(driver_name: &str) -> GrallocBackend {
        match driver_name {
            "msm" | "kgsl" | "openfimg" if cfg!(feature = "freedreno") => GrallocBackend::Freedreno,
            _ => GrallocBackend::Dumb,
        }
    }
}

/// The backend-specific half of a buffer object.
#[derive(Debug)]
pub enum NativeBuffer {
    System(SystemBuffer),
    Dumb(DumbBuffer),
    #[cfg(feature = "freedreno")]
    Freedreno(FreedrenoBuffer),
}

impl NativeBuffer {
    pub fn backend(&self) -> GrallocBackend {
        match self {
            NativeBuffer::System(_) => GrallocBackend::System,
            NativeBuffer::Dumb(_) => GrallocBackend::Dumb,
            #[cfg(feature = "freedreno")]
            NativeBuffer::Freedreno(_) => GrallocBackend::Freedreno,
        }
    }

    /// The handle the display subsystem knows this buffer by.  For GEM based backends this is
    /// the GEM handle on the context's device.
    pub fn handle(&self) -> u32 {
        match self {
            NativeBuffer::System(buffer) => buffer.id(),
            NativeBuffer::Dumb(buffer) => buffer.gem_handle(),
            #[cfg(feature = "freedreno")]
            NativeBuffer::Freedreno(buffer) => buffer.gem_handle(),
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            NativeBuffer::System(buffer) => buffer.size(),
            NativeBuffer::Dumb(buffer) => buffer.size(),
            #[cfg(feature = "freedreno")]
            NativeBuffer::Freedreno(buffer) => buffer.size(),
        }
    }

    /// Exports a new descriptor other processes can import the buffer from.
    pub fn export_descriptor(&self) -> GrallocResult<SafeDescriptor> {
        match self {
            NativeBuffer::System(buffer) => buffer.export(),
            NativeBuffer::Dumb(buffer) => buffer.export(),
            #[cfg(feature = "freedreno")]
            NativeBuffer::Freedreno(buffer) => buffer.export(),
        }
    }
}

/// A freshly allocated or imported native buffer.
#[derive(Debug)]
pub struct DriverBuffer {
    pub native: NativeBuffer,
    /// Backend handle recorded for framebuffer creation, zero when the usage never scans out.
    pub fb_handle: u32,
}

/// Trait that needs to be implemented by every allocation backend.  A context owns exactly one
/// instance; releasing the device connection happens when it is dropped.
pub trait GrallocDriver: Send + Sync {
    fn backend(&self) -> GrallocBackend;

    /// Implementations must import the buffer `handle` refers to when it carries a transport
    /// reference, checking the descriptor before the name.  Otherwise they allocate a new buffer
    /// of `handle`'s aligned geometry and write the transport reference and stride back into
    /// `handle`.
    fn allocate(&self, handle: &mut BufferHandle) -> GrallocResult<NativeBuffer>;

    /// Releases `native`.  Called exactly once per successful `allocate`.
    fn free(&self, native: NativeBuffer);

    /// Maps `native` for CPU access and begins a cache-coherent access window.  The whole
    /// buffer is mapped when `rect` can not be mapped on its own.
    fn map(
        &self,
        native: &mut NativeBuffer,
        rect: Rect,
        write: bool,
    ) -> GrallocResult<GrallocMapping>;

    /// Ends the access window opened by `map`.
    fn unmap(&self, native: &mut NativeBuffer);

    /// Adjusts the display behaviour to what this backend can scan out.
    fn init_kms_features(&self, config: &mut DisplayConfig);

    /// Allocates or imports, then records the framebuffer handle when `handle` asks for scanout.
    fn allocate_buffer(&self, handle: &mut BufferHandle) -> GrallocResult<DriverBuffer> {
        let native = self.allocate(handle)?;
        let fb_handle = if handle.usage.scanout() {
            native.handle()
        } else {
            0
        };

        Ok(DriverBuffer { native, fb_handle })
    }
}

/// Display features shared by backends without special scanout constraints.
pub(crate) fn default_kms_features(config: &mut DisplayConfig) {
    match config.format {
        HAL_PIXEL_FORMAT_BGRA_8888 | HAL_PIXEL_FORMAT_RGB_565 => (),
        _ => config.format = HAL_PIXEL_FORMAT_BGRA_8888,
    }

    config.vmwgfx_quirk = false;
    config.swap_mode = SwapMode::Flip;
    config.sync_flip = true;
    config.swap_interval = 1;
    config.vblank_secondary = false;
}

/// Creates the `backend` driver.  Every backend but `System` needs `device`.
pub fn create_driver(
    backend: GrallocBackend,
    device: Option<Arc<DrmDevice>>,
) -> GrallocResult<Box<dyn GrallocDriver>> {
    let driver: Box<dyn GrallocDriver> = match (backend, device) {
        (GrallocBackend::System, _) => SystemGralloc::init()?,
        (GrallocBackend::Dumb, Some(device)) => DumbGralloc::init(device)?,
        #[cfg(feature = "freedreno")]
        (GrallocBackend::Freedreno, Some(device)) => FreedrenoGralloc::init(device)?,
        #[cfg(not(feature = "freedreno"))]
        (GrallocBackend::Freedreno, Some(_)) => return Err(GrallocError::InvalidGrallocBackend),
        (_, None) => return Err(GrallocError::NoDevice),
    };

    info!("using {:?} gralloc backend", backend);
    Ok(driver)
}
