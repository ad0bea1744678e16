//! Engine state and worker-pool lifecycle
//!
//! The [`Engine`] owns a persistent pool of OS worker threads plus the
//! state they share: the phase barrier, the published job, the fault
//! channel, and the register arena. Threads are spawned once and reused
//! across evaluations, amortizing creation cost; they park on the barrier's
//! condition variable between passes.
//!
//! # Architecture
//!
//! ```text
//! Engine (caller thread)
//! ├── gate: Mutex<Generation>      - single supervisor at a time
//! │   ├── EngineShared (Arc)       - shared with every worker
//! │   │   ├── PhaseBarrier         - halt/pass/exit coordination
//! │   │   ├── install: Mutex<_>    - published job + dynamic-chunk cursor
//! │   │   ├── fault: Mutex<_>      - first-writer-wins error record
//! │   │   ├── giveup: AtomicBool   - cooperative early exit
//! │   │   └── RegisterArena        - per-worker register slices
//! │   ├── workers: Vec<JoinHandle> - one OS thread per register file
//! │   └── TempArena                - shared scratch, supervisor-owned
//! └── evaluate / set_thread_count / set_temp_capacity
//! ```
//!
//! Resizing swaps in a freshly spawned generation (threads, barrier,
//! register arena) and tears down the old one; on spawn failure the old
//! generation is untouched, leaving the pool in its last known-good halted
//! state. The temp arena is not thread-dependent and carries its capacity
//! across resizes.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::arena::{RegisterArena, TempArena};
use crate::barrier::PhaseBarrier;
use crate::error::{EngineError, KernelError, Result};
use crate::partition::Partition;
use crate::plan::IterationPlan;
use crate::program::CompiledProgram;
use crate::worker::worker_main;

// ================================================================================================
// Shared state
// ================================================================================================

/// Error recorded by the first faulting worker of a pass
#[derive(Debug)]
pub(crate) struct Fault {
    pub(crate) pc: usize,
    pub(crate) worker: usize,
    pub(crate) error: KernelError,
}

/// Chunk-resolved origin of one register
#[derive(Debug, Clone, Copy)]
pub(crate) enum ResolvedBase {
    /// Caller buffer; worker offsets by `chunk_start * stride`
    Buffer { base: *mut u8, stride: isize },
    /// Temp-arena lane; worker offsets by `(chunk_start - plan.start) * itemsize`
    Temp { base: *mut u8, itemsize: usize },
    /// Constant, materialized into the worker's register slot
    Scalar { value: f64 },
    /// Reduction accumulator: partial lives in the worker's slot, merged
    /// result is written to `out` by the supervisor
    Accumulator { identity: f64, out: *mut u8 },
}

/// How the domain is split across workers for one pass
#[derive(Debug, Clone, Copy)]
pub(crate) enum ChunkPolicy {
    /// Even per-worker split; the default
    Static(Partition),
    /// Fixed-size tasks handed out from the shared cursor
    Dynamic { end: usize, task: usize },
}

/// Everything a worker needs to execute its share of one evaluation
///
/// Published under the install mutex before the barrier releases, cleared
/// after it closes. The raw pointers (program, buffers, temp lanes) are
/// owned by the caller of `evaluate`, which blocks until every worker has
/// dropped its reference — workers must drop the job before signaling done.
pub(crate) struct EvalJob {
    program: *const CompiledProgram,
    pub(crate) plan: IterationPlan,
    pub(crate) bases: Vec<ResolvedBase>,
    pub(crate) policy: ChunkPolicy,
}

// Safety: the supervisor blocks in `await_halt` until every worker has
// finished with the job, so the borrowed program and buffers outlive all
// cross-thread use.
unsafe impl Send for EvalJob {}
unsafe impl Sync for EvalJob {}

impl EvalJob {
    pub(crate) fn new(
        program: &CompiledProgram,
        plan: IterationPlan,
        bases: Vec<ResolvedBase>,
        policy: ChunkPolicy,
    ) -> Self {
        Self {
            program: program as *const CompiledProgram,
            plan,
            bases,
            policy,
        }
    }

    /// # Safety
    ///
    /// Only callable while the pass this job was installed for is in
    /// flight; the supervisor keeps the program alive until the barrier
    /// closes.
    pub(crate) unsafe fn program(&self) -> &CompiledProgram {
        &*self.program
    }
}

/// Fields shared between the supervisor and the workers
pub(crate) struct EngineShared {
    /// Worker count of this generation; immutable until resize
    pub(crate) threads: usize,
    pub(crate) barrier: PhaseBarrier,
    /// The global mutex: job publication and the dynamic-chunk cursor.
    /// Separate from the barrier's own mutex so barrier traffic is not
    /// serialized behind install/error bookkeeping.
    pub(crate) install: Mutex<InstallState>,
    pub(crate) fault: Mutex<Option<Fault>>,
    pub(crate) giveup: AtomicBool,
    pub(crate) registers: RegisterArena,
}

pub(crate) struct InstallState {
    pub(crate) job: Option<Arc<EvalJob>>,
    pub(crate) cursor: usize,
}

impl EngineShared {
    pub(crate) fn new(threads: usize) -> Self {
        Self {
            threads,
            barrier: PhaseBarrier::new(),
            install: Mutex::new(InstallState { job: None, cursor: 0 }),
            fault: Mutex::new(None),
            giveup: AtomicBool::new(false),
            registers: RegisterArena::new(threads),
        }
    }
}

// ================================================================================================
// Generations
// ================================================================================================

/// One spawned incarnation of the pool. Resize replaces the whole
/// generation; evaluations only touch its shared state.
pub(crate) struct Generation {
    pub(crate) shared: Arc<EngineShared>,
    pub(crate) workers: Vec<JoinHandle<()>>,
    pub(crate) temp: TempArena,
}

impl Generation {
    fn spawn(threads: usize) -> Result<Self> {
        let shared = Arc::new(EngineShared::new(threads));
        let mut workers = Vec::with_capacity(threads);
        for tid in 0..threads {
            let worker_shared = Arc::clone(&shared);
            let spawned = std::thread::Builder::new()
                .name(format!("lamina-worker-{tid}"))
                .spawn(move || worker_main(worker_shared, tid));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    // Unwind the partial spawn so no thread outlives the
                    // failed generation.
                    shared.barrier.shutdown();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(EngineError::Spawn(err));
                }
            }
        }
        Ok(Self {
            shared,
            workers,
            temp: TempArena::new(),
        })
    }

    fn teardown(mut self) {
        self.shared.barrier.shutdown();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

// ================================================================================================
// Engine
// ================================================================================================

/// Parallel evaluation engine
///
/// A persistent worker pool executing compiled programs over chunked array
/// data. Construct once and reuse; scratch buffers are retained between
/// calls, so steady-state evaluation does not allocate.
///
/// All methods take `&self`; the engine serializes supervisors internally
/// and reports [`EngineError::PoolBusy`] instead of blocking when an
/// evaluation or resize is already in flight.
///
/// # Example
///
/// ```
/// use lamina_core::Engine;
///
/// let engine = Engine::with_threads(2)?;
/// assert_eq!(engine.thread_count(), 2);
///
/// let previous = engine.set_thread_count(4)?;
/// assert_eq!(previous, 2);
/// assert_eq!(engine.thread_count(), 4);
/// # Ok::<(), lamina_core::EngineError>(())
/// ```
pub struct Engine {
    pub(crate) gate: Mutex<Generation>,
}

impl Engine {
    /// Create an engine with one worker per available CPU
    pub fn new() -> Result<Self> {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_threads(threads)
    }

    /// Create an engine with an explicit worker count
    #[tracing::instrument]
    pub fn with_threads(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(EngineError::InvalidThreadCount(threads));
        }
        let generation = Generation::spawn(threads)?;
        tracing::debug!(threads, "engine_created");
        Ok(Self {
            gate: Mutex::new(generation),
        })
    }

    /// Current worker count
    pub fn thread_count(&self) -> usize {
        self.gate.lock().shared.threads
    }

    /// Current temp-arena capacity in bytes
    pub fn temp_capacity(&self) -> usize {
        self.gate.lock().temp.capacity()
    }

    /// Pre-grow the shared temp arena; returns the previous capacity.
    ///
    /// The arena never shrinks, so a request below the current capacity is
    /// a no-op. Rejected with [`EngineError::PoolBusy`] while a pass or
    /// resize is in flight.
    pub fn set_temp_capacity(&self, bytes: usize) -> Result<usize> {
        let mut generation = self.gate.try_lock().ok_or(EngineError::PoolBusy)?;
        let previous = generation.temp.capacity();
        generation.temp.ensure_capacity(bytes)?;
        Ok(previous)
    }

    /// Resize the worker pool; returns the previous count.
    ///
    /// Tears down every worker thread and all thread-dependent state and
    /// spawns a fresh set. Rejected while the pool is not idle. On spawn
    /// failure the existing pool is left untouched.
    #[tracing::instrument(skip(self))]
    pub fn set_thread_count(&self, threads: usize) -> Result<usize> {
        if threads == 0 {
            return Err(EngineError::InvalidThreadCount(threads));
        }
        let mut generation = self.gate.try_lock().ok_or(EngineError::PoolBusy)?;
        if !generation.shared.barrier.is_halted() {
            return Err(EngineError::PoolBusy);
        }

        let previous = generation.shared.threads;
        if threads == previous {
            return Ok(previous);
        }

        let start = std::time::Instant::now();
        let mut next = Generation::spawn(threads)?;
        // The temp arena is not thread-dependent; its capacity survives.
        next.temp = std::mem::take(&mut generation.temp);
        let old = std::mem::replace(&mut *generation, next);
        old.teardown();

        tracing::debug!(
            previous,
            threads,
            duration_us = start.elapsed().as_micros() as u64,
            "pool_resized"
        );
        Ok(previous)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new().expect("failed to create default engine")
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let generation = self.gate.get_mut();
        generation.shared.barrier.shutdown();
        for handle in generation.workers.drain(..) {
            let _ = handle.join();
        }
        tracing::debug!("engine_dropped");
    }
}

// ================================================================================================
// Tests
// ================================================================================================
