//! The evaluation supervisor: `Engine::evaluate`
//!
//! One synchronous entry point drives each pass. Structural validation
//! happens up front, before the worker pool is engaged — a caller mistake
//! (unbound register, short buffer, plan/program disagreement) is a local,
//! synchronous failure that never touches the threads. Only once the job is
//! fully resolved does the supervisor publish it and release the barrier.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::buffer::{Bindings, BoundBuffer};
use crate::engine::{ChunkPolicy, Engine, EngineShared, EvalJob, ResolvedBase};
use crate::error::{EngineError, Result};
use crate::partition::Partition;
use crate::plan::IterationPlan;
use crate::program::{CompiledProgram, ReduceOp, RegisterSpec};

/// Register origin before the temp arena's base address is known
enum PlannedBase {
    Buffer { base: *mut u8, stride: isize },
    Temp { offset: usize, itemsize: usize },
    Scalar { value: f64 },
    Accumulator { identity: f64, out: *mut u8 },
}

impl Engine {
    /// Evaluate a compiled program over the given iteration plan.
    ///
    /// Blocks the calling thread until every worker has finished. The
    /// buffers in `bindings` are borrowed for the whole call; on success
    /// the output buffers hold the computed results (a reduction writes its
    /// merged result to element 0 of the output binding).
    ///
    /// # Errors
    ///
    /// Structural errors (busy pool, invalid plan, binding mismatches) are
    /// returned before any worker runs. A kernel failure is reported as
    /// [`EngineError::Kernel`] carrying the operation index and the worker
    /// that recorded it; output contents are unspecified in that case.
    #[tracing::instrument(
        skip(self, program, plan, bindings),
        fields(vlen = plan.vlen, ops = program.ops.len(), reduce = plan.reduce)
    )]
    pub fn evaluate(
        &self,
        program: &CompiledProgram,
        plan: &IterationPlan,
        bindings: &Bindings<'_>,
    ) -> Result<()> {
        let mut generation = self.gate.try_lock().ok_or(EngineError::PoolBusy)?;
        let start_time = Instant::now();

        program.validate()?;
        plan.validate().map_err(EngineError::PlanMismatch)?;
        if plan.reduce != program.reduction.is_some() {
            return Err(EngineError::PlanMismatch(
                "plan and program disagree about reduction".to_string(),
            ));
        }

        let (planned, temp_bytes) = plan_bases(program, plan, bindings)?;
        generation.temp.ensure_capacity(temp_bytes)?;
        let temp_base = generation.temp.base_ptr();
        let bases = finalize_bases(planned, temp_base);

        let shared = Arc::clone(&generation.shared);
        let threads = shared.threads;
        let policy = chunk_policy(plan, threads);
        let job = Arc::new(EvalJob::new(program, plan.clone(), bases, policy));

        {
            let mut state = shared.install.lock();
            state.job = Some(Arc::clone(&job));
            state.cursor = plan.start;
        }
        *shared.fault.lock() = None;
        shared.giveup.store(false, Ordering::Relaxed);

        shared.barrier.release(threads);
        shared.barrier.await_halt();

        shared.install.lock().job = None;

        let fault = shared.fault.lock().take();
        if let Some(fault) = fault {
            tracing::debug!(pc = fault.pc, worker = fault.worker, "evaluation_failed");
            return Err(EngineError::Kernel {
                pc: fault.pc,
                worker: fault.worker,
                source: fault.error,
            });
        }

        if let Some(reduce) = program.reduction {
            merge_partials(&shared, program, reduce, &job);
        }

        tracing::debug!(
            threads,
            duration_us = start_time.elapsed().as_micros() as u64,
            "evaluation_complete"
        );
        Ok(())
    }
}

/// Validate bindings against the program and lay out temp lanes.
///
/// Returns one planned base per register plus the total temp-arena bytes
/// the pass needs.
fn plan_bases(
    program: &CompiledProgram,
    plan: &IterationPlan,
    bindings: &Bindings<'_>,
) -> Result<(Vec<PlannedBase>, usize)> {
    let count = program.registers.len();
    let mut bound: Vec<Option<&BoundBuffer>> = vec![None; count];
    for entry in bindings.entries() {
        let idx = entry.register.index() as usize;
        if idx >= count {
            return Err(EngineError::UnknownRegister {
                register: entry.register.index(),
            });
        }
        if bound[idx].is_some() {
            return Err(EngineError::DuplicateBinding {
                register: entry.register.index(),
            });
        }
        bound[idx] = Some(entry);
    }

    let mut planned = Vec::with_capacity(count);
    let mut temp_bytes = 0usize;
    for (idx, spec) in program.registers.iter().enumerate() {
        let register = idx as u8;
        match *spec {
            RegisterSpec::Input { itemsize } => {
                let buffer = bound[idx].ok_or(EngineError::UnboundRegister { register })?;
                if buffer.writable {
                    return Err(EngineError::BindingClass {
                        register,
                        direction: "output",
                    });
                }
                check_buffer(buffer, register, itemsize, plan.end())?;
                planned.push(PlannedBase::Buffer {
                    base: buffer.ptr,
                    stride: buffer.stride,
                });
            }
            RegisterSpec::Output { itemsize } => {
                let buffer = bound[idx].ok_or(EngineError::UnboundRegister { register })?;
                if !buffer.writable {
                    return Err(EngineError::BindingClass {
                        register,
                        direction: "input",
                    });
                }
                match program.reduction {
                    Some(reduce) => {
                        check_buffer(buffer, register, itemsize, 1)?;
                        planned.push(PlannedBase::Accumulator {
                            identity: reduce.identity(),
                            out: buffer.ptr,
                        });
                    }
                    None => {
                        check_buffer(buffer, register, itemsize, plan.end())?;
                        planned.push(PlannedBase::Buffer {
                            base: buffer.ptr,
                            stride: buffer.stride,
                        });
                    }
                }
            }
            RegisterSpec::Temp { itemsize } => {
                if bound[idx].is_some() {
                    return Err(EngineError::BindingClass {
                        register,
                        direction: "buffer",
                    });
                }
                // Temp lanes are full-domain arrays, 8-byte aligned; each
                // worker writes only its chunk's window of the lane.
                let offset = temp_bytes.div_ceil(8) * 8;
                let lane = plan
                    .vlen
                    .checked_mul(itemsize)
                    .ok_or(EngineError::OutOfMemory { requested: usize::MAX })?;
                temp_bytes = offset + lane;
                planned.push(PlannedBase::Temp { offset, itemsize });
            }
            RegisterSpec::Scalar { value } => {
                if bound[idx].is_some() {
                    return Err(EngineError::BindingClass {
                        register,
                        direction: "buffer",
                    });
                }
                planned.push(PlannedBase::Scalar { value });
            }
        }
    }

    Ok((planned, temp_bytes))
}

fn check_buffer(buffer: &BoundBuffer, register: u8, itemsize: usize, needed: usize) -> Result<()> {
    if buffer.itemsize != itemsize {
        return Err(EngineError::ItemsizeMismatch {
            register,
            expected: itemsize,
            actual: buffer.itemsize,
        });
    }
    if buffer.len < needed {
        return Err(EngineError::BufferTooShort {
            register,
            needed,
            len: buffer.len,
        });
    }
    Ok(())
}

/// Turn planned bases into concrete pointers once the temp arena is sized
fn finalize_bases(planned: Vec<PlannedBase>, temp_base: *mut u8) -> Vec<ResolvedBase> {
    planned
        .into_iter()
        .map(|base| match base {
            PlannedBase::Buffer { base, stride } => ResolvedBase::Buffer { base, stride },
            PlannedBase::Temp { offset, itemsize } => ResolvedBase::Temp {
                base: temp_base.wrapping_add(offset),
                itemsize,
            },
            PlannedBase::Scalar { value } => ResolvedBase::Scalar { value },
            PlannedBase::Accumulator { identity, out } => ResolvedBase::Accumulator { identity, out },
        })
        .collect()
}

/// Pick the chunking policy for this pass.
///
/// Static contiguous chunking is the default; dynamic chunking is used only
/// when the caller opted in with a task size below the even split.
/// Reductions always use the static partition so the partial merge order is
/// a pure function of the worker count.
fn chunk_policy(plan: &IterationPlan, threads: usize) -> ChunkPolicy {
    let part = Partition::even(plan.start, plan.vlen, threads);
    if plan.reduce {
        return ChunkPolicy::Static(part);
    }
    match plan.task_size {
        Some(task) if task < part.chunk_len() => ChunkPolicy::Dynamic {
            end: plan.end(),
            task,
        },
        _ => ChunkPolicy::Static(part),
    }
}

/// Merge per-worker reduction partials in worker-index order and write the
/// result to the bound output buffer.
fn merge_partials(shared: &EngineShared, program: &CompiledProgram, reduce: ReduceOp, job: &EvalJob) {
    let Some(out_idx) = program.reduction_output() else {
        return;
    };
    let ResolvedBase::Accumulator { out, .. } = job.bases[out_idx] else {
        return;
    };

    let mut acc = reduce.identity();
    for worker in 0..shared.registers.workers() {
        // Safety: the pool is halted; the supervisor is the only accessor.
        let slots = unsafe { shared.registers.slice_for(worker) };
        let partial = unsafe { *slots[out_idx].scalar.get() };
        acc = reduce.combine(acc, partial);
    }
    // Safety: the output binding held by the caller outlives this call.
    unsafe { std::ptr::write_unaligned(out as *mut f64, acc) };
}
