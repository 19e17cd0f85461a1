// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A crate for allocating, sharing, mapping and presenting graphics buffers on DRM devices,
//! behind one allocator interface for every backend.

cfg_if::cfg_if! {
    if #[cfg(not(any(target_os = "linux", target_os = "android")))] {
        compile_error!("drm_gralloc needs DRM, only Linux and Android are supported");
    }
}

#[macro_use]
mod macros;

mod buffer;
mod drm_device;
mod formats;
mod gralloc_core;
mod gralloc_drv;
mod gralloc_os;
mod gralloc_utils;
mod kms;
mod registry;

pub use crate::buffer::BufferHandle;
pub use crate::buffer::BufferObject;
pub use crate::drm_device::default_device_path;
pub use crate::drm_device::DrmDevice;
pub use crate::drm_device::DEFAULT_DRM_DEVICE;
pub use crate::drm_device::GRALLOC_DRM_DEVICE_ENV;
pub use crate::formats::*;
pub use crate::gralloc_core::GrallocBuilder;
pub use crate::gralloc_core::GrallocContext;
pub use crate::gralloc_drv::GrallocBackend;
pub use crate::gralloc_os::AsRawDescriptor;
pub use crate::gralloc_os::FromRawDescriptor as GrallocFromRawDescriptor;
pub use crate::gralloc_os::IntoRawDescriptor as GrallocIntoRawDescriptor;
pub use crate::gralloc_os::SafeDescriptor as GrallocDescriptor;
pub use crate::gralloc_utils::*;
pub use crate::kms::DisplayConfig;
pub use crate::kms::DisplayMode;
pub use crate::kms::DrmKms;
pub use crate::kms::FramebufferRequest;
pub use crate::kms::HeadlessKms;
pub use crate::kms::HeadlessState;
pub use crate::kms::Kms;
pub use crate::kms::KmsInfo;
pub use crate::kms::PlaneConfig;
pub use crate::kms::SwapMode;
pub use crate::registry::HandleRegistry;
