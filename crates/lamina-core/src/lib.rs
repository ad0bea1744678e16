//! Parallel evaluation engine for compiled array-expression programs
//!
//! lamina-core executes register-based compiled programs over large chunked
//! array inputs on a persistent pool of worker threads. Expression parsing,
//! compilation and kernel math live outside this crate: callers hand the
//! engine a [`CompiledProgram`] (operations + kernel function pointers), an
//! [`IterationPlan`] and buffer [`Bindings`], and get back filled output
//! buffers or a typed error.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Engine (supervisor)                     │
//! │   validate → install job → release barrier → await halt   │
//! └────────────┬─────────────────────────────────────────────┘
//!              │ PhaseBarrier (condvar, HALT ⇄ PASS, EXIT)
//!   ┌──────────┼──────────┬─────────────┐
//!   ▼          ▼          ▼             ▼
//! worker 0   worker 1   worker 2  ...  worker N-1
//!   │          │          │             │
//!   │  chunk [0,c)  [c,2c)  ...   (static even split,
//!   │                              dynamic tasks opt-in)
//!   ▼
//! per-worker register slice ── RegisterArena (one allocation)
//! temp lanes for intermediates ── TempArena (shared, grow-only)
//! ```
//!
//! Workers park on a condition variable between evaluations, so the pool is
//! paid for once and reused; steady-state evaluation performs no
//! allocation. Kernel failures are recorded first-writer-wins and surfaced
//! with the failing operation index after the barrier closes; the
//! cooperative `giveup` flag lets the remaining workers cut their chunks
//! short.
//!
//! # Usage
//!
//! ```
//! use lamina_core::{
//!     ArgView, Bindings, CompiledProgram, Engine, IterationPlan, KernelResult, Op, RegisterId,
//!     RegisterSpec,
//! };
//!
//! // Kernels are external to the engine; this one computes a * x.
//! fn scale(n: usize, inputs: &[ArgView], out: ArgView) -> KernelResult<()> {
//!     for i in 0..n {
//!         let a: f64 = unsafe { inputs[0].read(i) };
//!         let x: f64 = unsafe { inputs[1].read(0) };
//!         unsafe { out.write(i, a * x) };
//!     }
//!     Ok(())
//! }
//!
//! # fn main() -> Result<(), lamina_core::EngineError> {
//! let mut program = CompiledProgram::new();
//! program.registers.push(RegisterSpec::Input { itemsize: 8 }); // r0: data
//! program.registers.push(RegisterSpec::Scalar { value: 2.5 }); // r1: constant
//! program.registers.push(RegisterSpec::Output { itemsize: 8 }); // r2: result
//! program.ops.push(Op {
//!     kernel: scale,
//!     inputs: vec![RegisterId::new(0), RegisterId::new(1)],
//!     output: RegisterId::new(2),
//! });
//!
//! let data: Vec<f64> = (0..1000).map(f64::from).collect();
//! let mut result = vec![0.0f64; 1000];
//!
//! let engine = Engine::with_threads(4)?;
//! let mut bindings = Bindings::new();
//! bindings.bind_input(RegisterId::new(0), &data);
//! bindings.bind_output(RegisterId::new(2), &mut result);
//! engine.evaluate(&program, &IterationPlan::elementwise(1000), &bindings)?;
//!
//! assert_eq!(result[4], 10.0);
//! # Ok(())
//! # }
//! ```

mod arena;
mod barrier;
pub mod buffer;
mod engine;
pub mod error;
mod partition;
pub mod plan;
pub mod program;
mod supervisor;
mod worker;

// Re-export public API
pub use buffer::Bindings;
pub use engine::Engine;
pub use error::{EngineError, KernelError, KernelResult, Result};
pub use plan::IterationPlan;
pub use program::{
    ArgView, CompiledProgram, KernelFn, Op, ProgramError, ReduceOp, RegisterId, RegisterSpec,
    MAX_ARGS, MAX_REGISTERS,
};
pub use worker::BLOCK_SIZE;
