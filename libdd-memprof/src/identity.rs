// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// Opaque token the host uses to name a live allocation. It is only ever
/// compared and hashed, never dereferenced, and it changes when a moving
/// collector relocates the object.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AllocationIdentity(u64);

impl AllocationIdentity {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for AllocationIdentity {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for AllocationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AllocationIdentity({:#x})", self.0)
    }
}
