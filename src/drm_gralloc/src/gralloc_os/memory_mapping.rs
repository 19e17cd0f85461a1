// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::num::NonZeroUsize;
use std::os::unix::io::AsFd;
use std::ptr::NonNull;

use libc::c_void;
use log::error;
use nix::sys::mman::mmap;
use nix::sys::mman::munmap;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;

use crate::gralloc_utils::GrallocError;
use crate::gralloc_utils::GrallocMapping;
use crate::gralloc_utils::GrallocResult;

/// Wraps a shared memory mapping in the current process. Provides RAII semantics including
/// munmap when no longer needed.
#[derive(Debug)]
pub struct MemoryMapping {
    addr: NonNull<c_void>,
    size: usize,
}

// Safe because the mapping is owned exclusively by this struct and only handed out as raw
// addresses; synchronization of the contents is the caller's business.
unsafe impl Send for MemoryMapping {}
unsafe impl Sync for MemoryMapping {}

impl Drop for MemoryMapping {
    fn drop(&mut self) {
        // This is safe because we mmap the area at addr ourselves, and nobody
        // else is holding a reference to it.
        if let Err(e) = unsafe { munmap(self.addr, self.size) } {
            error!("munmap of {} bytes failed: {}", self.size, e);
        }
    }
}

impl MemoryMapping {
    /// Maps `size` bytes of `descriptor` starting at `offset` as shared memory.
    pub fn from_descriptor<F: AsFd>(
        descriptor: F,
        offset: u64,
        size: usize,
        writable: bool,
    ) -> GrallocResult<MemoryMapping> {
        let non_zero_size =
            NonZeroUsize::new(size).ok_or(GrallocError::ProtocolViolation("zero size mapping"))?;
        let prot = if writable {
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
        } else {
            ProtFlags::PROT_READ
        };

        let addr = unsafe {
            mmap(
                None,
                non_zero_size,
                prot,
                MapFlags::MAP_SHARED,
                descriptor,
                offset.try_into()?,
            )?
        };

        Ok(MemoryMapping { addr, size })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr() as *mut u8
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_gralloc_mapping(&self) -> GrallocMapping {
        GrallocMapping {
            ptr: self.as_ptr() as u64,
            size: self.size() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gralloc_os::SafeDescriptor;
    use crate::gralloc_os::SharedMemory;

    #[test]
    fn write_then_remap() {
        let descriptor: SafeDescriptor = SharedMemory::new("mapping_test", 4096).unwrap().into();

        let mapping = MemoryMapping::from_descriptor(&descriptor, 0, 4096, true).unwrap();
        unsafe { std::ptr::write_bytes(mapping.as_ptr(), 0xab, mapping.size()) };
        drop(mapping);

        let mapping = MemoryMapping::from_descriptor(&descriptor, 0, 4096, false).unwrap();
        let contents = unsafe { std::slice::from_raw_parts(mapping.as_ptr(), mapping.size()) };
        assert!(contents.iter().all(|b| *b == 0xab));
        assert_eq!(mapping.as_gralloc_mapping().size, 4096);
    }

    #[test]
    fn zero_size_rejected() {
        let descriptor: SafeDescriptor = SharedMemory::new("mapping_test", 4096).unwrap().into();
        assert!(MemoryMapping::from_descriptor(&descriptor, 0, 0, false).is_err());
    }
}
