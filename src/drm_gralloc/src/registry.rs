// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! registry: re-hydrates handles received from other processes into buffer objects, sharing one
//! buffer object between every registration of the same buffer.

use std::collections::BTreeMap as Map;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;

use log::debug;
use log::warn;

use crate::buffer::BufferHandle;
use crate::buffer::BufferObject;
use crate::gralloc_core::context_id;
use crate::gralloc_core::GrallocContext;
use crate::gralloc_utils::*;

/// What identifies a buffer across processes.  Descriptors received for the same dma-buf or
/// memfd all point at the same inode.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
enum TransportKey {
    Object { dev: u64, ino: u64 },
    Name(u32),
}

impl TransportKey {
    fn of(handle: &BufferHandle) -> GrallocResult<TransportKey> {
        if let Some(descriptor) = &handle.descriptor {
            let (dev, ino) = descriptor.object_id()?;
            return Ok(TransportKey::Object { dev, ino });
        }

        match handle.name {
            0 => Err(GrallocError::InvalidHandle),
            name => Ok(TransportKey::Name(name)),
        }
    }
}

struct Registration {
    bo: Arc<BufferObject>,
    count: u32,
}

/// Process-local table of registered handles.
///
/// Each registration takes a reference on the buffer object and each unregistration drops
/// one.  Registering a buffer that is already known, by any handle carrying the same transport
/// reference, reuses its buffer object.
#[derive(Default)]
pub struct HandleRegistry {
    entries: Mutex<Map<(usize, TransportKey), Registration>>,
}

impl HandleRegistry {
    pub fn new() -> HandleRegistry {
        Default::default()
    }

    fn lock_entries(&self) -> MutexGuard<Map<(usize, TransportKey), Registration>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers `handle` with `ctx`, importing the buffer through the context's backend unless
    /// it is already known.  Binds the handle to the buffer object on success.
    pub fn register(
        &self,
        handle: &mut BufferHandle,
        ctx: &GrallocContext,
    ) -> GrallocResult<Arc<BufferObject>> {
        let key = (ctx.id(), TransportKey::of(handle)?);

        // Imports happen under the lock so that two threads never import the same buffer.
        let mut entries = self.lock_entries();
        if let Some(entry) = entries.get_mut(&key) {
            if entry.bo.try_incref() {
                entry.count += 1;
                handle.local = Some(Arc::downgrade(&entry.bo));
                return Ok(entry.bo.clone());
            }
        }

        if entries.remove(&key).is_some() {
            debug!("registered buffer object was freed behind the registry");
        }

        let bo = match handle.local_bo().filter(|bo| ctx.owns(bo)) {
            Some(bo) if bo.try_incref() => bo,
            _ => ctx.import(handle)?,
        };

        handle.local = Some(Arc::downgrade(&bo));
        entries.insert(
            key,
            Registration {
                bo: bo.clone(),
                count: 1,
            },
        );
        Ok(bo)
    }

    /// Drops the reference a previous `register` of `handle` took.  The buffer is freed with the
    /// last reference.
    pub fn unregister(&self, handle: &BufferHandle) -> GrallocResult<()> {
        let transport = TransportKey::of(handle)?;
        let owner = handle
            .local
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|bo| context_id(bo.context()));

        let mut entries = self.lock_entries();
        let key = entries
            .keys()
            .find(|(ctx_id, key)| *key == transport && owner.map_or(true, |id| id == *ctx_id))
            .copied()
            .ok_or(GrallocError::NotFound)?;

        let (result, remove) = match entries.get_mut(&key) {
            Some(entry) => {
                entry.count -= 1;
                let result = entry.bo.decref();
                (result, entry.count == 0 || entry.bo.is_freed())
            }
            None => return Err(GrallocError::NotFound),
        };

        let removed = if remove { entries.remove(&key) } else { None };
        drop(entries);
        drop(removed);

        match result {
            Ok(freed) => {
                if freed {
                    debug!("last registration freed the buffer object");
                }
                Ok(())
            }
            Err(e) => {
                warn!("registered buffer object was already freed: {}", e);
                Ok(())
            }
        }
    }

    /// Number of distinct buffers registered.
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::HAL_PIXEL_FORMAT_BGRA_8888;
    use crate::gralloc_core::GrallocBuilder;
    use crate::gralloc_drv::GrallocBackend;

    fn context() -> GrallocContext {
        GrallocBuilder::new()
            .set_backend(GrallocBackend::System)
            .build()
            .unwrap()
    }

    fn transported(bo: &BufferObject) -> BufferHandle {
        let (bytes, descriptor) = bo.handle().to_wire().unwrap();
        BufferHandle::from_wire(&bytes, descriptor).unwrap()
    }

    #[test]
    fn unknown_handles() {
        let registry = HandleRegistry::new();
        let fresh = BufferHandle::new(4, 4, HAL_PIXEL_FORMAT_BGRA_8888, GrallocUsage::empty());
        assert!(matches!(
            registry.unregister(&fresh),
            Err(GrallocError::InvalidHandle)
        ));

        let mut named = BufferHandle::new(4, 4, HAL_PIXEL_FORMAT_BGRA_8888, GrallocUsage::empty());
        named.name = 3;
        assert!(matches!(
            registry.unregister(&named),
            Err(GrallocError::NotFound)
        ));
    }

    #[test]
    fn local_registration_reuses_bo() {
        let ctx = context();
        let registry = HandleRegistry::new();
        let bo = ctx
            .bo_create(8, 8, HAL_PIXEL_FORMAT_BGRA_8888, GrallocUsage::empty())
            .unwrap();

        let (mut handle, _) = bo.get_handle().unwrap();
        let registered = registry.register(&mut handle, &ctx).unwrap();
        assert!(Arc::ptr_eq(&registered, &bo));
        assert_eq!(bo.refcount(), 2);
        assert_eq!(ctx.num_buffers(), 1);

        registry.unregister(&handle).unwrap();
        assert_eq!(bo.refcount(), 1);
        assert!(registry.is_empty());
        assert!(matches!(
            registry.unregister(&handle),
            Err(GrallocError::NotFound)
        ));
    }

    #[test]
    fn transported_registration_dedups() {
        let producer = context();
        let consumer = context();
        let registry = HandleRegistry::new();
        let bo = producer
            .bo_create(8, 8, HAL_PIXEL_FORMAT_BGRA_8888, GrallocUsage::empty())
            .unwrap();

        let mut first = transported(&bo);
        let mut second = transported(&bo);
        let imported = registry.register(&mut first, &consumer).unwrap();
        assert!(!Arc::ptr_eq(&imported, &bo));
        assert_eq!(imported.refcount(), 1);

        let again = registry.register(&mut second, &consumer).unwrap();
        assert!(Arc::ptr_eq(&imported, &again));
        assert_eq!(imported.refcount(), 2);
        assert_eq!(consumer.num_buffers(), 1);
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(
            &consumer.bo_from_handle(&second).unwrap(),
            &imported
        ));

        registry.unregister(&first).unwrap();
        assert_eq!(consumer.num_buffers(), 1);
        registry.unregister(&second).unwrap();
        assert_eq!(consumer.num_buffers(), 0);
        assert!(imported.is_freed());
        assert_eq!(producer.num_buffers(), 1);
    }

    #[test]
    fn freed_behind_the_registry() {
        let ctx = context();
        let registry = HandleRegistry::new();
        let bo = ctx
            .bo_create(8, 8, HAL_PIXEL_FORMAT_BGRA_8888, GrallocUsage::empty())
            .unwrap();

        let mut handle = transported(&bo);
        let imported = registry.register(&mut handle, &ctx).unwrap();
        assert!(imported.decref().unwrap());

        let mut again = transported(&bo);
        let reimported = registry.register(&mut again, &ctx).unwrap();
        assert!(!Arc::ptr_eq(&imported, &reimported));
        assert_eq!(reimported.refcount(), 1);
        registry.unregister(&again).unwrap();
        assert!(registry.is_empty());
    }
}
