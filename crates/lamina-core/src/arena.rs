//! Scratch arenas: per-worker register storage and the shared temp buffer
//!
//! Both arenas exist to keep evaluation allocation-free after warm-up:
//!
//! - [`RegisterArena`] carves one contiguous allocation into disjoint
//!   per-worker register slices. Workers never share a slice, so register
//!   access needs no locking.
//! - [`TempArena`] is one growable byte buffer for intermediate array
//!   lanes. It grows monotonically (never shrinks), and only while the
//!   pool is halted; during a parallel pass workers write disjoint
//!   sub-ranges of it without locking.

use std::cell::UnsafeCell;

use crate::error::{EngineError, Result};
use crate::program::{ArgView, MAX_REGISTERS};

// ================================================================================================
// Register slots
// ================================================================================================

/// One runtime register slot: a chunk-resolved operand
///
/// For buffer and temp registers, `ptr`/`stride` address the worker's chunk
/// window. For scalar and accumulator registers `ptr` is null and the value
/// lives in `scalar`; views over such slots have stride zero and point at
/// the slot itself.
pub(crate) struct RegisterSlot {
    pub(crate) ptr: *mut u8,
    pub(crate) stride: isize,
    pub(crate) scalar: UnsafeCell<f64>,
}

impl RegisterSlot {
    fn empty() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            stride: 0,
            scalar: UnsafeCell::new(0.0),
        }
    }

    /// View of this operand at element offset `off` within the chunk
    #[inline]
    pub(crate) fn view_at(&self, off: usize) -> ArgView {
        if self.ptr.is_null() {
            ArgView::new(self.scalar.get() as *mut u8, 0)
        } else {
            ArgView::new(self.ptr.wrapping_offset(off as isize * self.stride), self.stride)
        }
    }
}

// ================================================================================================
// Register arena
// ================================================================================================

/// Fixed-capacity per-worker register storage
///
/// One allocation of `workers * MAX_REGISTERS` slots; worker `k` owns the
/// slice `[k * MAX_REGISTERS, (k + 1) * MAX_REGISTERS)`. Slices never
/// overlap, which is what makes lock-free register access sound. The arena
/// is sized at pool construction and rebuilt (zero-initialized) when the
/// pool is resized; resize requires the pool to be fully halted.
pub(crate) struct RegisterArena {
    slots: Box<[UnsafeCell<RegisterSlot>]>,
    workers: usize,
}

// Safety: slot access follows the barrier protocol. During a pass each
// worker touches only its own disjoint slice; outside a pass the supervisor
// is the sole accessor. The count-to-zero barrier handoff orders the two.
unsafe impl Send for RegisterArena {}
unsafe impl Sync for RegisterArena {}

impl RegisterArena {
    /// Allocate slots for `workers` register files
    pub(crate) fn new(workers: usize) -> Self {
        let slots: Box<[UnsafeCell<RegisterSlot>]> = (0..workers * MAX_REGISTERS)
            .map(|_| UnsafeCell::new(RegisterSlot::empty()))
            .collect();
        Self { slots, workers }
    }

    pub(crate) fn workers(&self) -> usize {
        self.workers
    }

    /// The register slice owned by `worker`
    ///
    /// # Safety
    ///
    /// The caller must hold exclusive access to this worker's slice: either
    /// it *is* that worker during a pass, or it is the supervisor while the
    /// pool is halted. The returned borrow must not outlive the current
    /// pass (a pool resize replaces the allocation).
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_for(&self, worker: usize) -> &mut [RegisterSlot] {
        debug_assert!(worker < self.workers, "worker {worker} out of range");
        let start = worker * MAX_REGISTERS;
        // UnsafeCell is repr(transparent): a span of cells no other thread
        // touches can be reborrowed as one contiguous mutable slice.
        std::slice::from_raw_parts_mut(self.slots[start].get(), MAX_REGISTERS)
    }
}

// ================================================================================================
// Temp arena
// ================================================================================================

/// Shared scratch buffer for intermediate array lanes
///
/// Owned by the supervisor side of the engine; workers only ever see raw
/// pointers into it, resolved while the job is installed. Capacity is
/// monotonically non-decreasing across evaluations and is never reallocated
/// while a pass is in flight.
#[derive(Debug, Default)]
pub(crate) struct TempArena {
    data: Vec<u8>,
}

impl TempArena {
    pub(crate) fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Current capacity in bytes
    pub(crate) fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Grow to at least `bytes`; never shrinks.
    ///
    /// Growth failure is reported instead of aborting, leaving the previous
    /// buffer intact.
    pub(crate) fn ensure_capacity(&mut self, bytes: usize) -> Result<()> {
        if bytes <= self.data.len() {
            return Ok(());
        }
        let additional = bytes - self.data.len();
        self.data
            .try_reserve_exact(additional)
            .map_err(|_| EngineError::OutOfMemory { requested: bytes })?;
        self.data.resize(bytes, 0);
        Ok(())
    }

    /// Base pointer of the arena; valid until the next growth.
    pub(crate) fn base_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }
}

// ================================================================================================
// Tests
// ================================================================================================
