//! Worker run loop and chunk execution
//!
//! Each worker thread loops forever on the phase barrier: park, execute one
//! pass, report done, park again. A pass means claiming chunk(s) of the
//! iteration domain, resolving the program's registers against the chunk
//! window, and walking the chunk block by block, dispatching every
//! operation's kernel per block.
//!
//! Failure inside a pass never unwinds past this module: kernel errors (and
//! caught kernel panics) are recorded in the shared fault slot and the
//! worker still reaches `worker_done`, so the barrier always closes.

use std::any::Any;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::arena::RegisterSlot;
use crate::barrier::Phase;
use crate::engine::{ChunkPolicy, EngineShared, EvalJob, Fault, ResolvedBase};
use crate::error::KernelError;
use crate::partition::next_task;
use crate::program::{ArgView, CompiledProgram, MAX_ARGS};

/// Elements processed per kernel dispatch within a chunk.
///
/// The giveup flag is polled once per block, bounding both the polling
/// overhead and how much work a worker does after another worker faults.
pub const BLOCK_SIZE: usize = 4096;

/// Entry point of every worker thread
pub(crate) fn worker_main(shared: Arc<EngineShared>, worker: usize) {
    tracing::trace!(worker, "worker_started");
    let mut epoch = 0u64;
    loop {
        let (phase, observed) = shared.barrier.worker_wait(epoch);
        epoch = observed;
        match phase {
            Phase::Exit => break,
            Phase::Pass => {
                let job = shared.install.lock().job.clone();
                if let Some(job) = job {
                    if let Err(fault) = run_pass(&shared, &job, worker) {
                        record_fault(&shared, fault);
                    }
                    // The job borrows caller memory; it must be released
                    // before the supervisor is allowed to return.
                    drop(job);
                }
                shared.barrier.worker_done();
            }
            Phase::Halt => unreachable!("worker_wait never returns Halt"),
        }
    }
    tracing::trace!(worker, "worker_exited");
}

/// Execute this worker's share of the installed job
fn run_pass(shared: &EngineShared, job: &EvalJob, worker: usize) -> Result<(), Fault> {
    // Safety: the barrier protocol gives this worker exclusive access to
    // its register slice for the duration of the pass.
    let slots = unsafe { shared.registers.slice_for(worker) };
    // Safety: the supervisor keeps the program alive until the barrier closes.
    let program = unsafe { job.program() };

    match job.policy {
        ChunkPolicy::Static(part) => {
            let range = part.range_for(worker);
            // Empty ranges still bind (a reduction partial must start at the
            // identity) but perform no kernel calls.
            bind_chunk(job, slots, range.start);
            run_chunk(shared, program, slots, range.len(), worker)
        }
        ChunkPolicy::Dynamic { end, task } => loop {
            let range = {
                let mut state = shared.install.lock();
                next_task(&mut state.cursor, end, task)
            };
            let Some(range) = range else {
                return Ok(());
            };
            bind_chunk(job, slots, range.start);
            run_chunk(shared, program, slots, range.len(), worker)?;
        },
    }
}

/// Resolve every register slot against a chunk starting at `chunk_start`
fn bind_chunk(job: &EvalJob, slots: &mut [RegisterSlot], chunk_start: usize) {
    for (idx, base) in job.bases.iter().enumerate() {
        let slot = &mut slots[idx];
        match *base {
            ResolvedBase::Buffer { base, stride } => {
                slot.ptr = base.wrapping_offset(chunk_start as isize * stride);
                slot.stride = stride;
            }
            ResolvedBase::Temp { base, itemsize } => {
                slot.ptr = base.wrapping_add((chunk_start - job.plan.start) * itemsize);
                slot.stride = itemsize as isize;
            }
            ResolvedBase::Scalar { value } => {
                slot.ptr = std::ptr::null_mut();
                slot.stride = 0;
                *slot.scalar.get_mut() = value;
            }
            ResolvedBase::Accumulator { identity, .. } => {
                slot.ptr = std::ptr::null_mut();
                slot.stride = 0;
                *slot.scalar.get_mut() = identity;
            }
        }
    }
}

/// Walk `len` elements block by block, dispatching the full program per block
fn run_chunk(
    shared: &EngineShared,
    program: &CompiledProgram,
    slots: &[RegisterSlot],
    len: usize,
    worker: usize,
) -> Result<(), Fault> {
    let mut off = 0;
    while off < len {
        if shared.giveup.load(Ordering::Relaxed) {
            tracing::trace!(worker, off, "giveup_observed");
            break;
        }
        let n = (len - off).min(BLOCK_SIZE);
        for (pc, op) in program.ops.iter().enumerate() {
            let mut inputs = [ArgView::dangling(); MAX_ARGS];
            for (arg, reg) in op.inputs.iter().enumerate() {
                inputs[arg] = slots[reg.index() as usize].view_at(off);
            }
            let out = slots[op.output.index() as usize].view_at(off);

            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                (op.kernel)(n, &inputs[..op.inputs.len()], out)
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(error)) => return Err(Fault { pc, worker, error }),
                Err(payload) => {
                    return Err(Fault {
                        pc,
                        worker,
                        error: KernelError::Panic(panic_message(&*payload)),
                    })
                }
            }
        }
        off += n;
    }
    Ok(())
}

/// Record a fault, first writer wins with ties broken toward the lowest
/// worker id, and raise the giveup flag so other workers can stop early.
fn record_fault(shared: &EngineShared, fault: Fault) {
    shared.giveup.store(true, Ordering::Relaxed);
    let mut slot = shared.fault.lock();
    match slot.as_ref() {
        Some(existing) if existing.worker <= fault.worker => {
            tracing::trace!(worker = fault.worker, pc = fault.pc, "fault_discarded");
        }
        _ => *slot = Some(fault),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

// ================================================================================================
// Tests
// ================================================================================================
