// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! drm_device: the kernel DRM device connection and its authentication ioctls.

use std::env;
use std::ffi::CString;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::os::raw::c_char;
use std::os::raw::c_int;
use std::os::raw::c_uint;
#[cfg(target_pointer_width = "64")]
use std::os::raw::c_ulong;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsFd;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::BorrowedFd;
use std::path::Path;
use std::path::PathBuf;
use std::ptr::null_mut;

use log::debug;
use nix::ioctl_none;
use nix::ioctl_read;
use nix::ioctl_readwrite;
use nix::ioctl_write_ptr;

use crate::gralloc_os::AsRawDescriptor;
use crate::gralloc_os::FromRawDescriptor;
use crate::gralloc_os::RawDescriptor;
use crate::gralloc_os::SafeDescriptor;
use crate::gralloc_utils::GrallocError;
use crate::gralloc_utils::GrallocResult;

/// Environment variable naming the device node to open instead of the default.
pub const GRALLOC_DRM_DEVICE_ENV: &str = "GRALLOC_DRM_DEVICE";
pub const DEFAULT_DRM_DEVICE: &str = "/dev/dri/card0";

// Consistent with __kernel_size_t in include/uapi/asm-generic/posix_types.h.
#[cfg(not(target_pointer_width = "64"))]
#[allow(non_camel_case_types)]
type __kernel_size_t = c_uint;
#[cfg(target_pointer_width = "64")]
#[allow(non_camel_case_types)]
type __kernel_size_t = c_ulong;

pub(crate) const DRM_IOCTL_BASE: c_uint = 0x64;
const DRM_IOCTL_VERSION: c_uint = 0x00;
const DRM_IOCTL_GET_MAGIC: c_uint = 0x02;
const DRM_IOCTL_AUTH_MAGIC: c_uint = 0x11;
const DRM_IOCTL_SET_MASTER: c_uint = 0x1e;
const DRM_IOCTL_DROP_MASTER: c_uint = 0x1f;
const DRM_IOCTL_GEM_CLOSE: c_uint = 0x09;
const DRM_IOCTL_GEM_FLINK: c_uint = 0x0a;
const DRM_IOCTL_GEM_OPEN: c_uint = 0x0b;
const DRM_IOCTL_PRIME_HANDLE_TO_FD: c_uint = 0x2d;
const DRM_IOCTL_PRIME_FD_TO_HANDLE: c_uint = 0x2e;

const DRM_CLOEXEC: u32 = libc::O_CLOEXEC as u32;
const DRM_RDWR: u32 = libc::O_RDWR as u32;

#[repr(C)]
#[derive(Copy, Clone)]
pub struct drm_version {
    version_major: c_int,
    version_minor: c_int,
    version_patchlevel: c_int,
    name_len: __kernel_size_t,
    name: *mut c_char,
    date_len: __kernel_size_t,
    date: *mut c_char,
    desc_len: __kernel_size_t,
    desc: *mut c_char,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_auth {
    magic: c_uint,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_gem_close {
    handle: u32,
    pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_gem_flink {
    handle: u32,
    name: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_gem_open {
    name: u32,
    handle: u32,
    size: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_prime_handle {
    handle: u32,
    flags: u32,
    fd: i32,
}

ioctl_readwrite!(
    drm_get_version,
    DRM_IOCTL_BASE,
    DRM_IOCTL_VERSION,
    drm_version
);
ioctl_read!(drm_get_magic, DRM_IOCTL_BASE, DRM_IOCTL_GET_MAGIC, drm_auth);
ioctl_write_ptr!(drm_auth_magic, DRM_IOCTL_BASE, DRM_IOCTL_AUTH_MAGIC, drm_auth);
ioctl_none!(drm_set_master, DRM_IOCTL_BASE, DRM_IOCTL_SET_MASTER);
ioctl_none!(drm_drop_master, DRM_IOCTL_BASE, DRM_IOCTL_DROP_MASTER);
ioctl_write_ptr!(drm_gem_close_ioctl, DRM_IOCTL_BASE, DRM_IOCTL_GEM_CLOSE, drm_gem_close);
ioctl_readwrite!(drm_gem_flink_ioctl, DRM_IOCTL_BASE, DRM_IOCTL_GEM_FLINK, drm_gem_flink);
ioctl_readwrite!(drm_gem_open_ioctl, DRM_IOCTL_BASE, DRM_IOCTL_GEM_OPEN, drm_gem_open);
ioctl_readwrite!(
    drm_prime_handle_to_fd,
    DRM_IOCTL_BASE,
    DRM_IOCTL_PRIME_HANDLE_TO_FD,
    drm_prime_handle
);
ioctl_readwrite!(
    drm_prime_fd_to_handle,
    DRM_IOCTL_BASE,
    DRM_IOCTL_PRIME_FD_TO_HANDLE,
    drm_prime_handle
);

impl drm_version {
    fn empty() -> drm_version {
        drm_version {
            version_major: 0,
            version_minor: 0,
            version_patchlevel: 0,
            name_len: 0,
            name: null_mut(),
            date_len: 0,
            date: null_mut(),
            desc_len: 0,
            desc: null_mut(),
        }
    }
}

fn get_drm_device_name(fd: &File) -> GrallocResult<String> {
    let mut version = drm_version::empty();

    // Get the length of the device name.
    unsafe {
        drm_get_version(fd.as_raw_fd(), &mut version)?;
    }

    // Enough bytes to hold the device name and terminating null character.
    let mut name_bytes: Vec<u8> = vec![0; (version.name_len + 1) as usize];
    let mut version = drm_version {
        name_len: name_bytes.len() as __kernel_size_t,
        name: name_bytes.as_mut_ptr() as *mut c_char,
        ..drm_version::empty()
    };

    // Safe as no more than name_len + 1 bytes will be written to name.
    unsafe {
        drm_get_version(fd.as_raw_fd(), &mut version)?;
    }

    CString::new(&name_bytes[..(version.name_len as usize)])?
        .into_string()
        .map_err(|_| GrallocError::ProtocolViolation("couldn't convert string"))
}

/// Returns the device node to open: `GRALLOC_DRM_DEVICE` when set, `/dev/dri/card0` otherwise.
pub fn default_device_path() -> PathBuf {
    match env::var_os(GRALLOC_DRM_DEVICE_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_DRM_DEVICE),
    }
}

/// An open connection to a DRM device node.
#[derive(Debug)]
pub struct DrmDevice {
    file: File,
    path: PathBuf,
}

impl DrmDevice {
    /// Opens the device node at `path` for reading and writing.
    pub fn open<P: AsRef<Path>>(path: P) -> GrallocResult<DrmDevice> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&path)?;

        debug!("opened DRM device {}", path.display());
        Ok(DrmDevice { file, path })
    }

    /// Opens the configured device node, falling back to the first primary node that answers
    /// the version query.
    pub fn open_default() -> GrallocResult<DrmDevice> {
        const DRM_DIR_NAME: &str = "/dev/dri";
        const DRM_MAX_MINOR: u32 = 15;

        let configured = default_device_path();
        if let Ok(device) = DrmDevice::open(&configured) {
            return Ok(device);
        }

        for n in 0..=DRM_MAX_MINOR {
            let path = Path::new(DRM_DIR_NAME).join(format!("card{}", n));
            if path == configured {
                continue;
            }

            if let Ok(device) = DrmDevice::open(&path) {
                if device.driver_name().is_ok() {
                    return Ok(device);
                }
            }
        }

        Err(GrallocError::NoDevice)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the name of the kernel driver behind this node, such as "msm" or "i915".
    pub fn driver_name(&self) -> GrallocResult<String> {
        get_drm_device_name(&self.file)
    }

    /// Returns this client's authentication token.
    pub fn get_magic(&self) -> GrallocResult<u32> {
        let mut auth = drm_auth::default();
        // Safe because the kernel writes only within `auth`.
        unsafe {
            drm_get_magic(self.file.as_raw_fd(), &mut auth)?;
        }
        Ok(auth.magic)
    }

    /// Authenticates the client owning `magic`.  Only valid on the DRM master.
    pub fn auth_magic(&self, magic: u32) -> GrallocResult<()> {
        let auth = drm_auth { magic };
        // Safe because the kernel only reads `auth`.
        unsafe {
            drm_auth_magic(self.file.as_raw_fd(), &auth)?;
        }
        Ok(())
    }

    pub fn set_master(&self) -> GrallocResult<()> {
        // Safe because the ioctl takes no argument.
        unsafe {
            drm_set_master(self.file.as_raw_fd())?;
        }
        Ok(())
    }

    pub fn drop_master(&self) -> GrallocResult<()> {
        // Safe because the ioctl takes no argument.
        unsafe {
            drm_drop_master(self.file.as_raw_fd())?;
        }
        Ok(())
    }

    /// Exports GEM `handle` as a dma-buf.
    pub fn prime_handle_to_fd(&self, handle: u32) -> GrallocResult<SafeDescriptor> {
        let mut args = drm_prime_handle {
            handle,
            flags: DRM_CLOEXEC | DRM_RDWR,
            fd: -1,
        };
        // Safe because the kernel writes only within `args`, and on success `args.fd` is a new
        // descriptor owned by nobody else.
        unsafe {
            drm_prime_handle_to_fd(self.file.as_raw_fd(), &mut args)?;
            Ok(SafeDescriptor::from_raw_descriptor(args.fd))
        }
    }

    /// Returns the GEM handle of the dma-buf `descriptor` on this device.  Importing the same
    /// dma-buf twice yields the same handle.
    pub fn prime_fd_to_handle(&self, descriptor: &SafeDescriptor) -> GrallocResult<u32> {
        let mut args = drm_prime_handle {
            fd: descriptor.as_raw_descriptor(),
            ..Default::default()
        };
        // Safe because the kernel writes only within `args`.
        unsafe {
            drm_prime_fd_to_handle(self.file.as_raw_fd(), &mut args)?;
        }
        Ok(args.handle)
    }

    /// Returns a global name for GEM `handle`.
    pub fn gem_flink(&self, handle: u32) -> GrallocResult<u32> {
        let mut args = drm_gem_flink { handle, name: 0 };
        // Safe because the kernel writes only within `args`.
        unsafe {
            drm_gem_flink_ioctl(self.file.as_raw_fd(), &mut args)?;
        }
        Ok(args.name)
    }

    /// Opens the object with global `name`, returning its handle and size.
    pub fn gem_open(&self, name: u32) -> GrallocResult<(u32, u64)> {
        let mut args = drm_gem_open {
            name,
            ..Default::default()
        };
        // Safe because the kernel writes only within `args`.
        unsafe {
            drm_gem_open_ioctl(self.file.as_raw_fd(), &mut args)?;
        }
        Ok((args.handle, args.size))
    }

    pub fn gem_close(&self, handle: u32) -> GrallocResult<()> {
        let args = drm_gem_close { handle, pad: 0 };
        // Safe because the kernel only reads `args`.
        unsafe {
            drm_gem_close_ioctl(self.file.as_raw_fd(), &args)?;
        }
        Ok(())
    }

    /// Reads pending events (vblank, flip completion) from the device.  Blocks until at least
    /// one arrives.
    pub(crate) fn read_events(&self, buf: &mut [u8]) -> GrallocResult<usize> {
        Ok((&self.file).read(buf)?)
    }
}

impl AsRawDescriptor for DrmDevice {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.file.as_raw_fd()
    }
}

impl AsFd for DrmDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}
