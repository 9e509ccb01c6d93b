//! Two-level idle budget: a per-request [`IdleTracker`] shared by every
//! attempt, and one [`IdleTimer`] per upstream call.
//!
//! Only silence is charged. Before an attempt has produced content, each gap
//! between progress events is subtracted from the tracker; once content is
//! flowing the per-attempt countdown still applies but the shared budget is
//! left alone, so a slow but steady stream is never cut by the total budget.

mod timer;
mod tracker;

pub use timer::{FiredReason, IdleTimer};
pub use tracker::IdleTracker;
