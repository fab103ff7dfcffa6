//! Job indices.
//!
//! # About job indices
//!
//! Every job in a chain carries a 16-bit **job index**, unique within the chain. Index 0 is
//! reserved: in a dependency slot it means "no dependency", so chains number their jobs from 1.
//!
//! A job header has two dependency slots. The hardware only starts a job once the jobs named
//! in both slots have completed. The builder uses them this way:
//!
//! * the *local* slot holds the job that directly feeds this one (the vertex job of a tiler
//!   job, for instance);
//! * the *global* slot serializes tiler jobs: each tiler job waits on the previous one in the
//!   chain, so that primitives reach the tiler in submission order.
//!
//! Indices are only meaningful inside a chain. Chains of different batches restart at 1.
use std::fmt;

/// Index of a job inside a chain. See module-level documentation.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[repr(transparent)]
pub struct JobIndex(pub u16);

impl JobIndex {
    /// Returns the index as a dependency slot value.
    pub const fn slot(dep: Option<JobIndex>) -> u16 {
        match dep {
            Some(JobIndex(i)) => i,
            None => 0,
        }
    }
}

impl fmt::Debug for JobIndex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
