// Copyright 2017 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::convert::TryInto;
use std::ffi::CString;
use std::os::unix::io::OwnedFd;

use libc::off_t;
use nix::sys::memfd::memfd_create;
use nix::sys::memfd::MemFdCreateFlag;
use nix::unistd::ftruncate;
use nix::unistd::sysconf;
use nix::unistd::SysconfVar;
use vmm_sys_util::align_upwards;

use crate::gralloc_os::descriptor::AsRawDescriptor;
use crate::gralloc_os::descriptor::IntoRawDescriptor;
use crate::gralloc_os::RawDescriptor;
use crate::gralloc_os::SafeDescriptor;
use crate::gralloc_utils::GrallocError;
use crate::gralloc_utils::GrallocResult;

/// Anonymous, sealable shared memory backed by a memfd.
pub struct SharedMemory {
    fd: OwnedFd,
    size: u64,
}

impl SharedMemory {
    /// Creates a new shared memory object of the given size.
    ///
    /// |debug_name| appears in `/proc/self/fd/<shm fd>` for the purposes of debugging. It does
    /// not need to be unique.
    pub fn new<T: Into<Vec<u8>>>(debug_name: T, size: u64) -> GrallocResult<SharedMemory> {
        let debug_name = CString::new(debug_name)?;
        let fd = memfd_create(
            debug_name.as_c_str(),
            MemFdCreateFlag::MFD_CLOEXEC | MemFdCreateFlag::MFD_ALLOW_SEALING,
        )?;

        let size_off_t: off_t = size.try_into()?;
        ftruncate(&fd, size_off_t)?;

        Ok(SharedMemory { fd, size })
    }

    /// Gets the size in bytes of the shared memory.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl AsRawDescriptor for SharedMemory {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.fd.as_raw_descriptor()
    }
}

impl IntoRawDescriptor for SharedMemory {
    fn into_raw_descriptor(self) -> RawDescriptor {
        self.fd.into_raw_descriptor()
    }
}

impl From<SharedMemory> for SafeDescriptor {
    fn from(sm: SharedMemory) -> SafeDescriptor {
        sm.fd.into()
    }
}

/// Uses the system's page size in bytes to round the given value up to the nearest page boundary.
pub fn round_up_to_page_size(v: u64) -> GrallocResult<u64> {
    let page_size_opt = sysconf(SysconfVar::PAGE_SIZE)?;
    if let Some(page_size) = page_size_opt {
        let aligned_size = align_upwards!(v, page_size as u64);
        Ok(aligned_size)
    } else {
        Err(GrallocError::ProtocolViolation("no page size"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        let page = round_up_to_page_size(1).unwrap();
        assert!(page.is_power_of_two());
        assert_eq!(round_up_to_page_size(page).unwrap(), page);
        assert_eq!(round_up_to_page_size(page + 1).unwrap(), 2 * page);
        assert_eq!(round_up_to_page_size(0).unwrap(), 0);
    }

    #[test]
    fn shm_size() {
        let shm = SharedMemory::new("shm_test", 12345).unwrap();
        assert_eq!(shm.size(), 12345);
        let descriptor: SafeDescriptor = shm.into();
        assert_eq!(descriptor.seek_size().unwrap(), 12345);
    }
}
