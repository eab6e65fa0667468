// Copyright (c) 2022 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use std::marker::PhantomData;

use crate::{NsHandle, Result};

/// Pins a namespace-switching sequence to the calling thread.
///
/// The guard records the network namespace of the calling thread when it is
/// created and switches the thread back to it when dropped, on every exit path.
/// It is neither `Send` nor `Sync`: the namespace it restores belongs to one OS
/// thread, and the guard must be dropped on that thread.
#[derive(Debug)]
pub struct NsGuard {
    original: NsHandle,
    restored: bool,
    _not_send: PhantomData<*const ()>,
}

impl NsGuard {
    /// Records the network namespace of the calling thread.
    pub fn new() -> Result<Self> {
        Ok(Self {
            original: NsHandle::current()?,
            restored: false,
            _not_send: PhantomData,
        })
    }

    /// Records the network namespace of the calling thread, then enters `target`.
    ///
    /// Requires elevated privileges.
    pub fn enter(target: &NsHandle) -> Result<Self> {
        let guard = Self::new()?;
        target.set()?;
        Ok(guard)
    }

    /// The namespace that will be restored.
    pub fn original(&self) -> &NsHandle {
        &self.original
    }

    /// Switches back to the recorded namespace now, reporting any failure.
    pub fn restore(mut self) -> Result<()> {
        self.restored = true;
        self.original.set()
    }
}

impl Drop for NsGuard {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        if let Err(e) = self.original.set() {
            tracing::warn!(
                error = %e,
                original = %self.original,
                "failed to restore network namespace"
            );
        }
    }
}
