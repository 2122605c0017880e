//! Interrupt-safe locking, and holding local interrupts disabled for a scope.
//!
//! On bare-metal x86_64 targets, holding interrupts toggles the real interrupt flag.
//! Everywhere else (hosted builds, unit tests, simulated devices) a software interrupt gate
//! stands in for it, so that code written against these types behaves identically.

#![no_std]


extern crate spin;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
extern crate x86_64;

pub use mutex_irqsafe::*;
pub use held_interrupts::*;

mod mutex_irqsafe;
mod held_interrupts;
