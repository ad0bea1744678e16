//! Iteration plans
//!
//! A plan describes the domain a program is evaluated over: a start offset,
//! a total element count, the chunking policy, and whether the program
//! performs a reduction. Plans are plain data produced by the external
//! compiler alongside the program itself.

use serde::{Deserialize, Serialize};

/// Iteration plan for one evaluation
///
/// # Example
///
/// ```
/// use lamina_core::IterationPlan;
///
/// let plan = IterationPlan::elementwise(10_000);
/// assert_eq!(plan.vlen, 10_000);
/// assert!(!plan.reduce);
///
/// let plan = IterationPlan::reduction(10_000);
/// assert!(plan.reduce);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationPlan {
    /// First element of the iteration domain
    pub start: usize,
    /// Total element count; the domain is `[start, start + vlen)`
    pub vlen: usize,
    /// Dynamic-chunking opt-in: when set and smaller than the even split,
    /// chunks of this size are handed out from a shared cursor instead of
    /// the static per-worker partition. Ignored for reductions.
    pub task_size: Option<usize>,
    /// Whether the program folds the domain into a single result
    pub reduce: bool,
}

impl IterationPlan {
    /// Plan an elementwise evaluation over `[0, vlen)`
    pub const fn elementwise(vlen: usize) -> Self {
        Self {
            start: 0,
            vlen,
            task_size: None,
            reduce: false,
        }
    }

    /// Plan a reduction evaluation over `[0, vlen)`
    pub const fn reduction(vlen: usize) -> Self {
        Self {
            start: 0,
            vlen,
            task_size: None,
            reduce: true,
        }
    }

    /// Set the start offset
    pub const fn with_start(mut self, start: usize) -> Self {
        self.start = start;
        self
    }

    /// Opt in to dynamic chunking with the given task size
    pub const fn with_task_size(mut self, task_size: usize) -> Self {
        self.task_size = Some(task_size);
        self
    }

    /// One past the last element of the domain
    pub const fn end(&self) -> usize {
        self.start + self.vlen
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.task_size == Some(0) {
            return Err("task size must be >= 1".to_string());
        }
        Ok(())
    }
}
