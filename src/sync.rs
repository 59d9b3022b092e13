// Unified synchronization primitive shim.
//
// Under `cfg(loom)`, re-exports from the `loom` crate so the model checker
// can explore interleavings. Otherwise, re-exports from `std`.
//
// **Every** file in the crate must import sync primitives through this
// module. A single direct `use std::sync::atomic::*` would bypass loom's
// scheduler and silently break exhaustive testing.
#![allow(unused_imports, unused_macros)]

// ---------------------------------------------------------------------------
// atomic
// ---------------------------------------------------------------------------
pub(crate) mod atomic {
    #[cfg(loom)]
    pub(crate) use loom::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

    #[cfg(not(loom))]
    pub(crate) use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
}

// ---------------------------------------------------------------------------
// sync (Mutex, Condvar, Arc, RwLock)
// ---------------------------------------------------------------------------
#[cfg(loom)]
pub(crate) use loom::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};

#[cfg(not(loom))]
pub(crate) use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};

// ---------------------------------------------------------------------------
// hint
// ---------------------------------------------------------------------------
pub(crate) mod hint {
    #[cfg(loom)]
    pub(crate) use loom::hint::spin_loop;

    #[cfg(not(loom))]
    pub(crate) use std::hint::spin_loop;
}

// ---------------------------------------------------------------------------
// thread
// ---------------------------------------------------------------------------
pub(crate) mod thread {
    #[cfg(loom)]
    pub(crate) use loom::thread::{current, spawn, yield_now, JoinHandle};

    #[cfg(not(loom))]
    pub(crate) use std::thread::{current, spawn, yield_now, JoinHandle};
}

// ---------------------------------------------------------------------------
// OnceLock shim
//
// loom does not provide OnceLock.  Under cfg(loom) we use a std Mutex<Option<T>>
// (not a loom Mutex) because OnceLock is used in `static` items and loom's
// Mutex::new() is not const.  Since OnceLock is init-once, the inner Mutex is
// not a synchronization point that loom needs to explore — it only serialises
// the one-shot initialisation.
// ---------------------------------------------------------------------------
#[cfg(not(loom))]
pub(crate) use std::sync::OnceLock;

#[cfg(loom)]
pub(crate) struct OnceLock<T> {
    inner: std::sync::Mutex<Option<T>>,
}

#[cfg(loom)]
impl<T> OnceLock<T> {
    pub(crate) const fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(None),
        }
    }

    pub(crate) fn get(&self) -> Option<&T> {
        let guard = self.inner.lock().unwrap();
        if guard.is_some() {
            let ptr: *const T = guard.as_ref().unwrap();
            // Safety: the value is never moved or dropped while &self is live.
            Some(unsafe { &*ptr })
        } else {
            None
        }
    }

    pub(crate) fn get_or_init<F: FnOnce() -> T>(&self, f: F) -> &T {
        let mut guard = self.inner.lock().unwrap();
        if guard.is_none() {
            *guard = Some(f());
        }
        let ptr: *const T = guard.as_ref().unwrap();
        // Safety: same as above — value lives as long as &self.
        unsafe { &*ptr }
    }
}

#[cfg(loom)]
// Safety: access is serialised by the inner Mutex.
unsafe impl<T: Send> Sync for OnceLock<T> {}

// ---------------------------------------------------------------------------
// Static initialisation helpers
//
// loom atomics/Mutex/RwLock are not const-constructible.  These macros
// create statics that work under both loom and std.
// ---------------------------------------------------------------------------

/// Declare a `static` atomic.  Under std, uses `const` init.  Under loom,
/// uses `loom::lazy_static!` so the value is re-created for each model run.
///
/// Usage: `static_atomic! { [pub] static NAME: Type = init_expr; }`
#[allow(unused_macro_rules)]
macro_rules! static_atomic {
    (pub static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        pub static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            pub static ref $NAME: $Ty = $init;
        }
    };
    (static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            static ref $NAME: $Ty = $init;
        }
    };
}
pub(crate) use static_atomic;

/// Declare a `static` `RwLock`.  Under std, uses `const` init.  Under loom,
/// uses `loom::lazy_static!`.
#[allow(unused_macro_rules)]
macro_rules! static_rwlock {
    (pub static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        pub static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            pub static ref $NAME: $Ty = $init;
        }
    };
    (static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            static ref $NAME: $Ty = $init;
        }
    };
}
pub(crate) use static_rwlock;
