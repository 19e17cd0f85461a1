// Copyright 2020 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! gralloc_utils: Utility enums, structs, and implementations needed by the rest of the crate.

use std::ffi::NulError;
use std::io::Error as IoError;
use std::num::TryFromIntError;

use nix::Error as NixError;
use remain::sorted;
use thiserror::Error;

/// Android gralloc usage bits understood by the allocator.  Values match
/// `hardware/gralloc.h` so handles produced by other gralloc implementations stay meaningful.
pub const GRALLOC_USAGE_SW_READ_OFTEN: u32 = 0x0000_0003;
pub const GRALLOC_USAGE_SW_READ_MASK: u32 = 0x0000_000f;
pub const GRALLOC_USAGE_SW_WRITE_OFTEN: u32 = 0x0000_0030;
pub const GRALLOC_USAGE_SW_WRITE_MASK: u32 = 0x0000_00f0;
pub const GRALLOC_USAGE_HW_TEXTURE: u32 = 0x0000_0100;
pub const GRALLOC_USAGE_HW_RENDER: u32 = 0x0000_0200;
pub const GRALLOC_USAGE_HW_2D: u32 = 0x0000_0400;
pub const GRALLOC_USAGE_HW_COMPOSER: u32 = 0x0000_0800;
pub const GRALLOC_USAGE_HW_FB: u32 = 0x0000_1000;
pub const GRALLOC_USAGE_PROTECTED: u32 = 0x0000_4000;
pub const GRALLOC_USAGE_CURSOR: u32 = 0x0000_8000;
pub const GRALLOC_USAGE_HW_VIDEO_ENCODER: u32 = 0x0001_0000;
pub const GRALLOC_USAGE_HW_CAMERA_WRITE: u32 = 0x0002_0000;
pub const GRALLOC_USAGE_HW_CAMERA_READ: u32 = 0x0004_0000;

/// Usage flags for constructing a buffer object.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct GrallocUsage(pub u32);

impl GrallocUsage {
    /// Returns empty set of flags.
    #[inline(always)]
    pub fn empty() -> GrallocUsage {
        GrallocUsage(0)
    }

    /// Wraps the given raw `GRALLOC_USAGE` bits.
    #[inline(always)]
    pub fn new(raw: u32) -> GrallocUsage {
        GrallocUsage(raw)
    }

    fn set_flag(self, bitmask: u32, set: bool) -> GrallocUsage {
        if set {
            GrallocUsage(self.0 | bitmask)
        } else {
            GrallocUsage(self.0 & !bitmask)
        }
    }

    /// Sets the frequent software read bits.
    pub fn use_sw_read(self, v: bool) -> GrallocUsage {
        self.set_flag(GRALLOC_USAGE_SW_READ_OFTEN, v)
    }

    /// Sets the frequent software write bits.
    pub fn use_sw_write(self, v: bool) -> GrallocUsage {
        self.set_flag(GRALLOC_USAGE_SW_WRITE_OFTEN, v)
    }

    /// Buffer will be sampled by the GPU.
    pub fn use_hw_texture(self, v: bool) -> GrallocUsage {
        self.set_flag(GRALLOC_USAGE_HW_TEXTURE, v)
    }

    /// Buffer will be rendered to by the GPU.
    pub fn use_hw_render(self, v: bool) -> GrallocUsage {
        self.set_flag(GRALLOC_USAGE_HW_RENDER, v)
    }

    /// Buffer may be scanned out from an overlay plane.
    pub fn use_hw_composer(self, v: bool) -> GrallocUsage {
        self.set_flag(GRALLOC_USAGE_HW_COMPOSER, v)
    }

    /// Buffer will be scanned out by the primary display.
    pub fn use_hw_fb(self, v: bool) -> GrallocUsage {
        self.set_flag(GRALLOC_USAGE_HW_FB, v)
    }

    #[inline(always)]
    pub fn uses_hw_fb(self) -> bool {
        self.0 & GRALLOC_USAGE_HW_FB != 0
    }

    #[inline(always)]
    pub fn uses_hw_composer(self) -> bool {
        self.0 & GRALLOC_USAGE_HW_COMPOSER != 0
    }

    /// Returns true if the display engine may read the buffer, either as the primary
    /// framebuffer or through an overlay plane.
    #[inline(always)]
    pub fn scanout(self) -> bool {
        self.uses_hw_fb() || self.uses_hw_composer()
    }

    #[inline(always)]
    pub fn sw_read(self) -> bool {
        self.0 & GRALLOC_USAGE_SW_READ_MASK != 0
    }

    #[inline(always)]
    pub fn sw_write(self) -> bool {
        self.0 & GRALLOC_USAGE_SW_WRITE_MASK != 0
    }
}

impl From<u32> for GrallocUsage {
    fn from(raw: u32) -> GrallocUsage {
        GrallocUsage(raw)
    }
}

/// An axis aligned rectangle in pixels.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Rect {
        Rect { x, y, w, h }
    }

    /// Returns true if this rectangle covers no pixels.
    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }
}

/// A CPU mapping of a locked buffer object.  `ptr` stays valid until the matching unlock.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct GrallocMapping {
    pub ptr: u64,
    pub size: u64,
}

/// An error generated while using this crate.
#[sorted]
#[derive(Error, Debug)]
pub enum GrallocError {
    /// The buffer object is already locked for CPU access.
    #[error("buffer object is already locked")]
    AlreadyLocked,
    /// Checked Arithmetic error
    #[error("arithmetic failed: {}({}) {op} {}({})", .field1.0, .field1.1, .field2.0, .field2.1)]
    CheckedArithmetic {
        field1: (&'static str, usize),
        field2: (&'static str, usize),
        op: &'static str,
    },
    /// Checked Range error
    #[error("range check failed: {}({}) vs {}({})", .field1.0, .field1.1, .field2.0, .field2.1)]
    CheckedRange {
        field1: (&'static str, usize),
        field2: (&'static str, usize),
    },
    /// A backend library call failed with the given return code.
    #[error("backend library failed with error {0}")]
    ComponentError(i32),
    /// The display subsystem rejected the framebuffer.
    #[error("framebuffer attach failed with errno {0}")]
    FramebufferAttachFailed(i32),
    /// The transport reference of a handle could not be resolved to a native buffer.
    #[error("failed to import buffer from handle")]
    ImportFailed,
    /// The buffer object has already been freed.
    #[error("buffer object was already freed")]
    InvalidBufferObject,
    /// No backend is able to service the request.
    #[error("invalid gralloc backend")]
    InvalidGrallocBackend,
    /// The handle is malformed or does not belong to this allocator.
    #[error("invalid buffer handle")]
    InvalidHandle,
    /// An input/output error occured.
    #[error("an input/output error occur: {0}")]
    IoError(IoError),
    /// Mode-setting was used before `init_kms`.
    #[error("mode-setting is not initialized")]
    KmsNotInitialized,
    /// The mapping or the cache synchronization failed.
    #[error("mapping failed with errno {0}")]
    MapFailed(i32),
    /// Nix crate error.
    #[error("The errno is {0}")]
    NixError(NixError),
    /// The context was built without a DRM device.
    #[error("no DRM device is attached to the context")]
    NoDevice,
    /// The handle was never registered with this registry.
    #[error("handle is not registered")]
    NotFound,
    #[error("Nul Error occured {0}")]
    NulError(NulError),
    /// The plane id is out of range or overlays are unsupported.
    #[error("overlay plane unavailable")]
    PlaneUnavailable,
    /// The display subsystem refused to present the buffer.
    #[error("present failed with errno {0}")]
    PresentFailed(i32),
    /// A caller broke the buffer object protocol.
    #[error("violation of the gralloc protocol: {0}")]
    ProtocolViolation(&'static str),
    /// An attempted integer conversion failed.
    #[error("int conversion failed: {0}")]
    TryFromIntError(TryFromIntError),
    /// The command is unsupported.
    #[error("the requested function is not implemented")]
    Unsupported,
    /// The pixel format has no known layout.
    #[error("unsupported pixel format 0x{0:x}")]
    UnsupportedFormat(u32),
}

impl GrallocError {
    /// Returns the negative errno equivalent of this error, for callers that speak status
    /// codes.
    pub fn errno(&self) -> i32 {
        let errno = match self {
            GrallocError::AlreadyLocked => libc::EBUSY,
            GrallocError::CheckedArithmetic { .. } | GrallocError::CheckedRange { .. } => {
                libc::EINVAL
            }
            GrallocError::ComponentError(ret) => {
                if *ret < 0 {
                    return *ret;
                }
                libc::EIO
            }
            GrallocError::FramebufferAttachFailed(e)
            | GrallocError::MapFailed(e)
            | GrallocError::PresentFailed(e) => *e,
            GrallocError::ImportFailed
            | GrallocError::InvalidBufferObject
            | GrallocError::InvalidHandle
            | GrallocError::KmsNotInitialized
            | GrallocError::NulError(_)
            | GrallocError::PlaneUnavailable
            | GrallocError::ProtocolViolation(_)
            | GrallocError::TryFromIntError(_)
            | GrallocError::UnsupportedFormat(_) => libc::EINVAL,
            GrallocError::InvalidGrallocBackend | GrallocError::NoDevice => libc::ENODEV,
            GrallocError::IoError(e) => e.raw_os_error().unwrap_or(libc::EIO),
            GrallocError::NixError(e) => *e as i32,
            GrallocError::NotFound => libc::ENOENT,
            GrallocError::Unsupported => libc::ENOSYS,
        };

        -errno.abs()
    }
}

impl From<NixError> for GrallocError {
    fn from(e: NixError) -> GrallocError {
        GrallocError::NixError(e)
    }
}

impl From<NulError> for GrallocError {
    fn from(e: NulError) -> GrallocError {
        GrallocError::NulError(e)
    }
}

impl From<IoError> for GrallocError {
    fn from(e: IoError) -> GrallocError {
        GrallocError::IoError(e)
    }
}

impl From<TryFromIntError> for GrallocError {
    fn from(e: TryFromIntError) -> GrallocError {
        GrallocError::TryFromIntError(e)
    }
}

/// The result of an operation in this crate.
pub type GrallocResult<T> = std::result::Result<T, GrallocError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_flags() {
        let usage = GrallocUsage::empty().use_hw_fb(true).use_sw_write(true);
        assert!(usage.uses_hw_fb());
        assert!(usage.scanout());
        assert!(usage.sw_write());
        assert!(!usage.sw_read());
        assert!(!usage.uses_hw_composer());

        let usage = usage.use_hw_fb(false).use_hw_composer(true);
        assert!(!usage.uses_hw_fb());
        assert!(usage.scanout());
        assert_eq!(usage.0, GRALLOC_USAGE_SW_WRITE_OFTEN | GRALLOC_USAGE_HW_COMPOSER);
    }

    #[test]
    fn errors_are_negative() {
        assert_eq!(GrallocError::NotFound.errno(), -libc::ENOENT);
        assert_eq!(GrallocError::UnsupportedFormat(0x7f).errno(), -libc::EINVAL);
        assert_eq!(GrallocError::PresentFailed(libc::EBUSY).errno(), -libc::EBUSY);
        assert_eq!(GrallocError::ComponentError(-5).errno(), -5);
        assert_eq!(
            GrallocError::NixError(nix::errno::Errno::EACCES).errno(),
            -libc::EACCES
        );
    }
}
