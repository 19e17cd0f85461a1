// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs::File;
use std::io::Seek;
use std::io::SeekFrom;
use std::mem::ManuallyDrop;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsFd;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::BorrowedFd;
use std::os::unix::io::FromRawFd;
use std::os::unix::io::IntoRawFd;
use std::os::unix::io::OwnedFd;
use std::os::unix::io::RawFd;

use crate::gralloc_utils::GrallocError;
use crate::gralloc_utils::GrallocResult;

pub type RawDescriptor = RawFd;

/// Wraps a RawDescriptor and safely closes it when self falls out of scope.
#[derive(Debug)]
pub struct SafeDescriptor {
    descriptor: OwnedFd,
}

/// Trait for forfeiting ownership of the current raw descriptor, and returning the raw descriptor
pub trait IntoRawDescriptor {
    fn into_raw_descriptor(self) -> RawDescriptor;
}

/// Trait for returning the underlying raw descriptor, without giving up ownership of the
/// descriptor.
pub trait AsRawDescriptor {
    /// Returns the underlying raw descriptor.
    ///
    /// Since the descriptor is still owned by the provider, callers should not assume that it will
    /// remain open for longer than the immediate call of this method.
    fn as_raw_descriptor(&self) -> RawDescriptor;
}

pub trait FromRawDescriptor {
    /// # Safety
    /// Safe only if the caller ensures nothing has access to the descriptor after passing it to
    /// `from_raw_descriptor`
    unsafe fn from_raw_descriptor(descriptor: RawDescriptor) -> Self;
}

impl SafeDescriptor {
    /// Duplicates the descriptor.  Both copies refer to the same open file description.
    pub fn try_clone(&self) -> GrallocResult<SafeDescriptor> {
        let descriptor = self.descriptor.try_clone()?;
        Ok(SafeDescriptor { descriptor })
    }

    /// Returns the (device, inode) pair naming the kernel object behind the descriptor.  Two
    /// descriptors received from different processes for the same dma-buf or memfd share it.
    pub fn object_id(&self) -> GrallocResult<(u64, u64)> {
        // The File never closes the descriptor: it is wrapped in ManuallyDrop.
        let file = ManuallyDrop::new(unsafe { File::from_raw_fd(self.as_raw_descriptor()) });
        let metadata = file.metadata()?;
        Ok((metadata.dev(), metadata.ino()))
    }

    /// Returns the size of the object by seeking to its end.  dma-bufs report their size only
    /// this way.
    pub fn seek_size(&self) -> GrallocResult<u64> {
        let mut file = File::from(self.descriptor.try_clone()?);
        let size = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;
        Ok(size)
    }
}

impl AsRawDescriptor for SafeDescriptor {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.descriptor.as_raw_fd()
    }
}

impl AsRawDescriptor for File {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.as_raw_fd()
    }
}

impl AsRawDescriptor for OwnedFd {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.as_raw_fd()
    }
}

impl AsFd for SafeDescriptor {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.descriptor.as_fd()
    }
}

impl IntoRawDescriptor for SafeDescriptor {
    fn into_raw_descriptor(self) -> RawDescriptor {
        self.descriptor.into_raw_fd()
    }
}

impl IntoRawDescriptor for OwnedFd {
    fn into_raw_descriptor(self) -> RawDescriptor {
        self.into_raw_fd()
    }
}

impl FromRawDescriptor for SafeDescriptor {
    unsafe fn from_raw_descriptor(descriptor: RawDescriptor) -> Self {
        SafeDescriptor {
            descriptor: OwnedFd::from_raw_fd(descriptor),
        }
    }
}

impl FromRawDescriptor for File {
    unsafe fn from_raw_descriptor(descriptor: RawDescriptor) -> Self {
        File::from_raw_fd(descriptor)
    }
}

impl From<File> for SafeDescriptor {
    fn from(f: File) -> SafeDescriptor {
        SafeDescriptor {
            descriptor: f.into(),
        }
    }
}

impl From<OwnedFd> for SafeDescriptor {
    fn from(descriptor: OwnedFd) -> SafeDescriptor {
        SafeDescriptor { descriptor }
    }
}

impl TryFrom<&dyn AsRawDescriptor> for SafeDescriptor {
    type Error = GrallocError;

    /// Clones the underlying descriptor, internally creating a new descriptor.
    fn try_from(rd: &dyn AsRawDescriptor) -> Result<Self, Self::Error> {
        // Safe because the underlying raw descriptor is guaranteed valid by rd's existence, and
        // the borrow does not outlive this call.
        let borrowed = unsafe { BorrowedFd::borrow_raw(rd.as_raw_descriptor()) };
        let descriptor = borrowed.try_clone_to_owned()?;
        Ok(SafeDescriptor { descriptor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gralloc_os::SharedMemory;

    #[test]
    fn clones_share_object() {
        let shm = SharedMemory::new("descriptor_test", 4096).unwrap();
        let descriptor: SafeDescriptor = shm.into();
        let clone = descriptor.try_clone().unwrap();

        assert_ne!(descriptor.as_raw_descriptor(), clone.as_raw_descriptor());
        assert_eq!(descriptor.object_id().unwrap(), clone.object_id().unwrap());
        assert_eq!(clone.seek_size().unwrap(), 4096);
    }

    #[test]
    fn distinct_objects_differ() {
        let a: SafeDescriptor = SharedMemory::new("a", 4096).unwrap().into();
        let b: SafeDescriptor = SharedMemory::new("b", 4096).unwrap().into();
        assert_ne!(a.object_id().unwrap(), b.object_id().unwrap());
    }
}
