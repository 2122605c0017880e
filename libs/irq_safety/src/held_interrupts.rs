//! Saving, disabling and restoring the local interrupt state.

/// A handle for frozen interrupts.
///
/// While this exists, local interrupts stay disabled.
/// Dropping it restores the interrupt state that was in effect when it was created,
/// which allows holds to nest safely.
#[derive(Default)]
pub struct HeldInterrupts(bool);

/// Prevent interrupts from firing until the return value is dropped (goes out of scope). 
/// After it is dropped, the interrupts are returned to their prior state, not blindly re-enabled.
pub fn hold_interrupts() -> HeldInterrupts {
    let enabled = interrupts_enabled();
    let retval = HeldInterrupts(enabled);
    disable_interrupts();
    retval
}

impl HeldInterrupts {
    /// Returns whether interrupts were enabled when this hold was taken.
    pub fn were_enabled(&self) -> bool {
        self.0
    }
}

impl Drop for HeldInterrupts {
    fn drop(&mut self) {
        if self.0 {
            enable_interrupts();
        }
    }
}

/// Unconditionally enables local interrupts.
#[inline(always)]
pub fn enable_interrupts() {
    arch::enable();
}

/// Unconditionally disables local interrupts.
#[inline(always)]
pub fn disable_interrupts() {
    arch::disable();
}

/// Returns `true` if local interrupts are currently enabled.
#[inline(always)]
pub fn interrupts_enabled() -> bool {
    arch::enabled()
}


#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    pub use x86_64::instructions::interrupts::{disable, enable};

    #[inline(always)]
    pub fn enabled() -> bool {
        x86_64::instructions::interrupts::are_enabled()
    }
}

/// Hosted builds have no interrupt flag to toggle.
/// A single software gate models it, shared by every thread of the host process.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod arch {
    use core::sync::atomic::{AtomicBool, Ordering};

    static SOFT_INTERRUPT_FLAG: AtomicBool = AtomicBool::new(true);

    #[inline(always)]
    pub fn enable() {
        SOFT_INTERRUPT_FLAG.store(true, Ordering::Release);
    }

    #[inline(always)]
    pub fn disable() {
        SOFT_INTERRUPT_FLAG.store(false, Ordering::Release);
    }

    #[inline(always)]
    pub fn enabled() -> bool {
        SOFT_INTERRUPT_FLAG.load(Ordering::Acquire)
    }
}
