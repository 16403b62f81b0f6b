//! CPU Lock and the cell holding the kernel-global state
//!
//! Every kernel service enters CPU Lock through [`lock_cpu`] and gets a
//! [`CpuLockGuard`]. The guard owns the one and only [`CpuLockToken`] for its
//! kernel trait type, and [`CpuLockCell`] hands out the state it protects only
//! in exchange for a borrow of that token. Leaving CPU Lock is tied to the
//! guard's drop.
use core::{fmt, ops};
use tokenlock::UnsyncTokenLock;

use crate::{error::BadContextError, PortThreading};

pub(crate) struct CpuLockTag<Traits>(Traits);

/// Proof of being in CPU Lock. At most one exists per kernel trait type.
pub(crate) type CpuLockToken<Traits> = tokenlock::UnsyncSingletonToken<CpuLockTag<Traits>>;

type CpuLockKeyhole<Traits> = tokenlock::SingletonTokenId<CpuLockTag<Traits>>;

/// Borrowed [`CpuLockToken`]. Unlike `&mut CpuLockGuard`, this isn't
/// reborrowed implicitly; call `borrow_mut` to pass it down and keep using it.
pub(crate) type CpuLockTokenRefMut<'a, Traits> =
    tokenlock::UnsyncSingletonTokenRefMut<'a, CpuLockTag<Traits>>;

/// Holds data that can only be touched while CPU Lock is active.
pub(crate) struct CpuLockCell<Traits, T: ?Sized>(UnsyncTokenLock<T, CpuLockKeyhole<Traits>>);

impl<Traits, T> CpuLockCell<Traits, T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(CpuLockKeyhole::new(), x))
    }
}

impl<Traits, T: ?Sized> CpuLockCell<Traits, T> {
    #[inline]
    pub(crate) fn read<'a>(&'a self, token: &'a CpuLockToken<Traits>) -> &'a T {
        self.0.read(token)
    }

    #[inline]
    pub(crate) fn write<'a>(&'a self, token: &'a mut CpuLockToken<Traits>) -> &'a mut T {
        self.0.write(token)
    }
}

impl<Traits: PortThreading, T: fmt::Debug + ?Sized> fmt::Debug for CpuLockCell<Traits, T> {
    /// Prints the contents if CPU Lock can be entered here, which isn't the
    /// case when formatting from inside a kernel service.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match lock_cpu::<Traits>() {
            Ok(lock) => f.debug_tuple("CpuLockCell").field(&self.read(&lock)).finish(),
            Err(_) => f.write_str("CpuLockCell(< locked >)"),
        }
    }
}

/// Enter CPU Lock. Fails with `BadContext` if it's already active, which
/// includes being called from a kernel service or a timer callback running
/// with CPU Lock held.
pub(crate) fn lock_cpu<Traits: PortThreading>() -> Result<CpuLockGuard<Traits>, BadContextError> {
    // Safety: Only the kernel calls this
    if unsafe { Traits::try_enter_cpu_lock() } {
        // Safety: We've just entered CPU Lock, so no guard exists yet
        Ok(unsafe { assume_cpu_lock() })
    } else {
        Err(BadContextError::BadContext)
    }
}

/// Wrap an already-active CPU Lock in a guard. Used by the port-facing entry
/// points, which are called with CPU Lock active.
///
/// # Safety
///
/// CPU Lock must be active and no other `CpuLockGuard` may exist.
pub(crate) unsafe fn assume_cpu_lock<Traits: PortThreading>() -> CpuLockGuard<Traits> {
    debug_assert!(Traits::is_cpu_lock_active());

    CpuLockGuard {
        // Safety: The token is unique; the caller guarantees there's no guard
        token: unsafe { CpuLockToken::new_unchecked() },
    }
}

/// Leaves CPU Lock when dropped.
pub(crate) struct CpuLockGuard<Traits: PortThreading> {
    token: CpuLockToken<Traits>,
}

impl<Traits: PortThreading> CpuLockGuard<Traits> {
    pub(crate) fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_, Traits> {
        self.token.borrow_mut()
    }
}

impl<Traits: PortThreading> Drop for CpuLockGuard<Traits> {
    fn drop(&mut self) {
        // Safety: We hold CPU Lock
        unsafe { Traits::leave_cpu_lock() };
    }
}

impl<Traits: PortThreading> ops::Deref for CpuLockGuard<Traits> {
    type Target = CpuLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: PortThreading> ops::DerefMut for CpuLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}
