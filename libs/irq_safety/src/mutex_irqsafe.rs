use core::ops::{Deref, DerefMut};
use core::fmt;
use core::mem::ManuallyDrop;

use spin::{Mutex, MutexGuard};
use crate::held_interrupts::{HeldInterrupts, hold_interrupts};

/// This type provides interrupt-safe MUTual EXclusion based on [spin::Mutex].
///
/// # Description
///
/// Locking a `MutexIrqSafe` first disables local interrupts and only then acquires the inner spinlock.
/// Unlocking releases the spinlock first and only then restores the previous interrupt state.
/// As such, an interrupt handler on this core can never try to acquire a lock 
/// that was already held by the code it interrupted.
///
/// Device state that is touched from an interrupt handler *and* from regular task context
/// (deferred work, polling, administrative calls) must be protected by this lock, not a plain spinlock.
///
/// There is no lock poisoning. When a panic occurs while the lock is held, no guarantees are made.
pub struct MutexIrqSafe<T: ?Sized> {
    lock: Mutex<T>,
}

/// A guard through which the protected data can be accessed.
///
/// When the guard falls out of scope it will release the lock,
/// and then restore the interrupt state that was in effect before locking.
pub struct MutexGuardIrqSafe<'a, T: ?Sized + 'a> {
    held_irq: ManuallyDrop<HeldInterrupts>,
    guard: ManuallyDrop<MutexGuard<'a, T>>,
}

// Same unsafe impls as `spin::Mutex`
unsafe impl<T: ?Sized + Send> Sync for MutexIrqSafe<T> {}
unsafe impl<T: ?Sized + Send> Send for MutexIrqSafe<T> {}

impl<T> MutexIrqSafe<T> {
    /// Creates a new lock wrapping the supplied data.
    pub const fn new(user_data: T) -> MutexIrqSafe<T> {
        MutexIrqSafe {
            lock: Mutex::new(user_data),
        }
    }

    /// Consumes this MutexIrqSafe, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.lock.into_inner()
    }
}

impl<T: ?Sized> MutexIrqSafe<T> {
    /// Disables interrupts, locks the spinlock, and returns a guard.
    ///
    /// The returned value may be dereferenced for data access
    /// and the lock will be dropped when the guard falls out of scope.
    pub fn lock(&self) -> MutexGuardIrqSafe<T> {
        MutexGuardIrqSafe {
            held_irq: ManuallyDrop::new(hold_interrupts()),
            guard: ManuallyDrop::new(self.lock.lock()),
        }
    }

    /// Tries to lock the MutexIrqSafe. If it is already locked, it will return None. 
    /// Otherwise it returns a guard within Some.
    ///
    /// Interrupts are only left disabled if the lock was actually acquired.
    pub fn try_lock(&self) -> Option<MutexGuardIrqSafe<T>> {
        let held_irq = hold_interrupts();
        self.lock.try_lock().map(|guard| MutexGuardIrqSafe {
            held_irq: ManuallyDrop::new(held_irq),
            guard: ManuallyDrop::new(guard),
        })
    }

    /// Returns `true` if the lock is currently held.
    ///
    /// This is only a snapshot, it may change immediately after returning.
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// No locking is needed, since the mutable borrow statically guarantees exclusive access.
    pub fn get_mut(&mut self) -> &mut T {
        self.lock.get_mut()
    }

    /// Force unlock the spinlock.
    ///
    /// This is *extremely* unsafe if the lock is not held by the current
    /// thread. The interrupt state is not restored by this function.
    ///
    /// If the lock isn't held, this is a no-op.
    pub unsafe fn force_unlock(&self) {
        self.lock.force_unlock()
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexIrqSafe<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.lock.try_lock() {
            Some(guard) => write!(f, "MutexIrqSafe {{ data: {:?} }}", &*guard),
            None => write!(f, "MutexIrqSafe {{ <locked> }}"),
        }
    }
}

impl<T: Default> Default for MutexIrqSafe<T> {
    fn default() -> MutexIrqSafe<T> {
        MutexIrqSafe::new(Default::default())
    }
}

impl<'a, T: ?Sized> Deref for MutexGuardIrqSafe<'a, T> {
    type Target = T;

    fn deref(&self) -> &T { 
        &self.guard
    }
}

impl<'a, T: ?Sized> DerefMut for MutexGuardIrqSafe<'a, T> {
    fn deref_mut(&mut self) -> &mut T { 
        &mut self.guard
    }
}

// NOTE: we need explicit calls to .drop() to ensure that HeldInterrupts are not released 
//       until the inner lock is also released.
impl<'a, T: ?Sized> Drop for MutexGuardIrqSafe<'a, T> {
    /// The dropping of the MutexGuardIrqSafe will release the lock it was created from.
    fn drop(&mut self) {
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
            ManuallyDrop::drop(&mut self.held_irq);
        }
    }
}
