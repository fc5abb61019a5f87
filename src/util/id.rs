//! Utilities for process unique identifiers.

use std::fmt::{Debug, Formatter};
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// A process unique 64bit id.
///
/// Ids are generated from a monotonic counter and are never reused for the lifetime of the
/// process.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UUID(NonZeroU64);

static NEXT_UUID: AtomicU64 = AtomicU64::new(1);

impl UUID {
    pub fn new() -> Self {
        let id = NEXT_UUID.fetch_add(1, Ordering::Relaxed);
        Self(NonZeroU64::new(id).unwrap())
    }

    pub const fn from_raw(id: u64) -> Self {
        if id == 0u64 {
            panic!("Zero id")
        }
        Self(unsafe { NonZeroU64::new_unchecked(id) })
    }

    pub const fn get_raw(&self) -> u64 {
        self.0.get()
    }
}

impl Debug for UUID {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("UUID({:#016X})", self.get_raw()))
    }
}

#[macro_export]
macro_rules! define_uuid_type {
    ($vis:vis, $name:ident) => {
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
        $vis struct $name($crate::util::id::UUID);

        impl $name {
            $vis fn new() -> Self {
                Self($crate::util::id::UUID::new())
            }

            $vis fn from_uuid(raw: $crate::util::id::UUID) -> Self {
                Self(raw)
            }

            $vis fn as_uuid(&self) -> $crate::util::id::UUID {
                self.0
            }
        }

        impl From<$name> for $crate::util::id::UUID {
            fn from(id: $name) -> Self {
                id.as_uuid()
            }
        }
    }
}

pub use define_uuid_type;
