//! Host-memory stand-ins for the platform services, for exercising drivers without hardware.
//!
//! * [`SimDma`] is an identity-free IOMMU: it hands out fake bus addresses for host memory,
//!   remembers every live mapping, and lets a simulated device read and write through them.
//!   It also records unbalanced unmaps and can be told to fail upcoming mappings.
//! * [`ManualClock`] only advances when told to (or when a driver busy-waits on it).
//! * [`ManualWorkQueue`] holds deferred work until the test runs it.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::{DeviceAddress, DmaDirection, DmaError, DmaMapper, MonotonicClock, Work, WorkScheduler};

/// The first fake bus address handed out; above 4 GiB so that both halves of 64-bit address registers matter.
const SIM_DMA_BASE: u64 = 0x1_0000_0000;
/// Every mapping starts on this boundary, which also satisfies descriptor ring alignment.
const SIM_DMA_ALIGN: u64 = 256;

#[derive(Clone, Copy, Debug)]
struct Mapping {
    host: usize,
    len: usize,
    direction: DmaDirection,
}

#[derive(Default)]
struct SimDmaState {
    next: u64,
    mappings: BTreeMap<u64, Mapping>,
    maps: u64,
    unmaps: u64,
    bad_unmaps: u64,
    /// Number of successful maps still allowed before injected failures begin.
    fail_after: Option<usize>,
    /// Number of injected failures remaining once `fail_after` reaches zero.
    failures: usize,
}

/// A simulated DMA mapper backed by host memory.
pub struct SimDma {
    state: Mutex<SimDmaState>,
}

impl Default for SimDma {
    fn default() -> Self {
        SimDma::new()
    }
}

impl SimDma {
    pub fn new() -> SimDma {
        SimDma {
            state: Mutex::new(SimDmaState { next: SIM_DMA_BASE, ..Default::default() }),
        }
    }

    /// Makes the next `failures` calls to `map` fail with [`DmaError::MappingFailed`].
    pub fn fail_next_maps(&self, failures: usize) {
        self.fail_maps_after(0, failures);
    }

    /// Lets `successes` more maps succeed, then fails the following `failures` maps.
    pub fn fail_maps_after(&self, successes: usize, failures: usize) {
        let mut state = self.state.lock();
        state.fail_after = Some(successes);
        state.failures = failures;
    }

    /// The number of mappings currently live.
    pub fn live_mappings(&self) -> usize {
        self.state.lock().mappings.len()
    }

    /// The total number of successful `map` calls.
    pub fn total_maps(&self) -> u64 {
        self.state.lock().maps
    }

    /// The total number of `unmap` calls that matched a live mapping.
    pub fn total_unmaps(&self) -> u64 {
        self.state.lock().unmaps
    }

    /// The number of `unmap` calls that did not match a live mapping exactly,
    /// i.e., double releases or releases of foreign addresses.
    pub fn bad_unmaps(&self) -> u64 {
        self.state.lock().bad_unmaps
    }

    /// Returns `true` if `address` starts a live mapping.
    pub fn is_mapping_start(&self, address: u64) -> bool {
        self.state.lock().mappings.contains_key(&address)
    }

    /// Translates a device-visible range into a host pointer, 
    /// if the whole range lies within one live mapping.
    pub fn translate(&self, address: u64, len: usize) -> Option<NonNull<u8>> {
        let state = self.state.lock();
        let (start, mapping) = state.mappings.range(..=address).next_back()?;
        let offset = (address - start) as usize;
        if offset.checked_add(len)? > mapping.len {
            return None;
        }
        NonNull::new((mapping.host + offset) as *mut u8)
    }

    /// Performs a device read of `len` bytes at `address`.
    pub fn device_read(&self, address: u64, len: usize) -> Option<Vec<u8>> {
        let ptr = self.translate(address, len)?;
        let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr() as *const u8, len) };
        Some(bytes.to_vec())
    }

    /// Performs a device write of `data` at `address`. 
    /// Returns `false` if the range is not mapped or is not writable by the device.
    pub fn device_write(&self, address: u64, data: &[u8]) -> bool {
        {
            let state = self.state.lock();
            let writable = state.mappings.range(..=address).next_back()
                .map_or(false, |(_, m)| m.direction != DmaDirection::ToDevice);
            if !writable {
                return false;
            }
        }
        match self.translate(address, data.len()) {
            Some(ptr) => {
                unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len()) };
                true
            }
            None => false,
        }
    }
}

impl DmaMapper for SimDma {
    fn map(&self, host: NonNull<u8>, len: usize, direction: DmaDirection) -> Result<DeviceAddress, DmaError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.fail_after {
            Some(0) if state.failures > 0 => {
                state.failures -= 1;
                return Err(DmaError::MappingFailed);
            }
            Some(ref mut n) if *n > 0 => *n -= 1,
            _ => { }
        }
        let address = state.next;
        let span = (len.max(1) as u64 + SIM_DMA_ALIGN - 1) & !(SIM_DMA_ALIGN - 1);
        // leave a guard gap so that overruns never land in a neighboring mapping
        state.next += span + SIM_DMA_ALIGN;
        state.mappings.insert(address, Mapping { host: host.as_ptr() as usize, len, direction });
        state.maps += 1;
        Ok(unsafe { DeviceAddress::new(address) })
    }

    fn unmap(&self, address: DeviceAddress, len: usize, direction: DmaDirection) {
        let mut state = self.state.lock();
        let matches = state.mappings.get(&address.value())
            .map_or(false, |m| m.len == len && m.direction == direction);
        if matches {
            state.mappings.remove(&address.value());
            state.unmaps += 1;
        } else {
            error!("SimDma::unmap(): no live mapping of {} bytes at {:?} ({:?})", len, address, direction);
            state.bad_unmaps += 1;
        }
    }
}

/// A clock that only moves when advanced or busy-waited on.
#[derive(Default)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    pub fn new() -> ManualClock {
        ManualClock::default()
    }

    pub fn advance_ms(&self, ms: u64) {
        self.micros.fetch_add(ms * 1000, Ordering::SeqCst);
    }

    fn set_ms(&self, ms: u64) {
        self.micros.fetch_max(ms * 1000, Ordering::SeqCst);
    }
}

impl MonotonicClock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.micros.load(Ordering::SeqCst) / 1000
    }

    fn delay_us(&self, micros: u64) {
        self.micros.fetch_add(micros, Ordering::SeqCst);
    }
}

struct PendingWork {
    due_ms: u64,
    seq: u64,
    work: Work,
}

/// A deferred-work queue that runs nothing until the test asks it to.
pub struct ManualWorkQueue {
    clock: Arc<ManualClock>,
    pending: Mutex<Vec<PendingWork>>,
    seq: AtomicU64,
}

/// Upper bound on items run by one drain, so that a task that always reschedules itself can't hang a test.
const MAX_RUNS_PER_DRAIN: usize = 100_000;

impl ManualWorkQueue {
    pub fn new(clock: Arc<ManualClock>) -> ManualWorkQueue {
        ManualWorkQueue { clock, pending: Mutex::new(Vec::new()), seq: AtomicU64::new(0) }
    }

    /// The number of work items waiting to run.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// The due time of the earliest pending item.
    pub fn next_due_ms(&self) -> Option<u64> {
        self.pending.lock().iter().map(|p| p.due_ms).min()
    }

    /// Runs the earliest pending item that is already due, if any.
    /// Items due at the same time run in the order they were scheduled.
    pub fn run_next(&self) -> bool {
        let now = self.clock.now_ms();
        let work = {
            let mut pending = self.pending.lock();
            let next = pending.iter().enumerate()
                .filter(|(_, p)| p.due_ms <= now)
                .min_by_key(|(_, p)| (p.due_ms, p.seq))
                .map(|(i, _)| i);
            match next {
                Some(i) => pending.remove(i).work,
                None => return false,
            }
        };
        // the queue lock is released, so the work may schedule more work
        work();
        true
    }

    /// Runs every item that is due now, including items scheduled by those items with no delay.
    pub fn run_due(&self) -> usize {
        let mut ran = 0;
        while ran < MAX_RUNS_PER_DRAIN && self.run_next() {
            ran += 1;
        }
        ran
    }

    /// Advances time by `ms`, stepping through each due time in order and running the work due at it.
    pub fn advance(&self, ms: u64) -> usize {
        let target = self.clock.now_ms() + ms;
        let mut ran = self.run_due();
        while let Some(due) = self.next_due_ms().filter(|&due| due <= target) {
            self.clock.set_ms(due);
            ran += self.run_due();
        }
        self.clock.set_ms(target);
        ran + self.run_due()
    }
}

impl WorkScheduler for ManualWorkQueue {
    fn schedule(&self, delay_ms: u64, work: Work) {
        let due_ms = self.clock.now_ms() + delay_ms;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().push(PendingWork { due_ms, seq, work });
    }
}
