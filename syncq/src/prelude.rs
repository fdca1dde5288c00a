//! The purpose of this module is to alleviate the need to import many of the `[syncq]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use syncq::prelude::*;
//! ```
pub use crate::backend::{Backend, BackendError, EnqueuableJob};
pub use crate::backoff::{Backoff, Curve, Jitter, Shape};
pub use crate::config::QueueConfig;
pub use crate::events::{EventSink, QueueEvent, RateLimitedSink, Severity, TracingSink};
pub use crate::job::builder::JobBuilder;
pub use crate::job::{Job, JobClass, JobId, JobState};
pub use crate::pruner::{Pruner, PrunerConfig};
pub use crate::queue::{Outcome, Queue};
pub use crate::retry::{RetryDecision, RetryPolicy};
pub use crate::token::{CredentialError, Credentials, Token, TokenManager, TokenProvider};
pub use crate::worker::{ExecutionResult, Worker, WorkerRegistry};
pub use crate::{FatalCondition, QueueError, ShutdownReport, Syncq};
