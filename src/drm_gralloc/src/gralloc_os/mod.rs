// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! OS primitives: owned descriptors, anonymous shared memory and memory mappings.

mod descriptor;
mod memory_mapping;
mod shm;

pub use descriptor::AsRawDescriptor;
pub use descriptor::FromRawDescriptor;
pub use descriptor::IntoRawDescriptor;
pub use descriptor::RawDescriptor;
pub use descriptor::SafeDescriptor;
pub use memory_mapping::MemoryMapping;
pub use shm::round_up_to_page_size;
pub use shm::SharedMemory;
