//! Delay curves, used between soft-failure retries and between attempts at a job store write.
//!
//! A [`Backoff`] maps the number of failures so far onto a delay. Its [`Shape`] is constant,
//! linear or exponential in the failure count; the result can then be clamped and jittered.
//!
//! Soft-failure retries need a curve that never decreases as failures accumulate, see
//! [`Backoff::is_monotonic`].
//!
//! ```
//! # use syncq::prelude::*;
//! # use chrono::TimeDelta;
//! let softfail = Backoff::linear(TimeDelta::seconds(300)).clamped(TimeDelta::seconds(900));
//!
//! assert_eq!(softfail.delay(1), TimeDelta::seconds(300));
//! assert_eq!(softfail.delay(2), TimeDelta::seconds(600));
//! assert_eq!(softfail.delay(4), TimeDelta::seconds(900));
//! ```
use chrono::TimeDelta;
use rand::Rng;

/// Maps a failure count, starting at 1, onto how long to wait before the next try.
pub trait Curve {
    fn delay(&self, failures: u16) -> TimeDelta;
}

/// How the delay grows with the failure count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// The same delay every time.
    Constant(TimeDelta),
    /// `step * failures`
    Linear(TimeDelta),
    /// `base * 2^(failures - 1)`
    Exponential(TimeDelta),
}

impl Shape {
    fn raw_delay(&self, failures: u16) -> TimeDelta {
        match *self {
            Self::Constant(delay) => Some(delay),
            Self::Linear(step) => step.checked_mul(failures.into()),
            Self::Exponential(base) => 2_i32
                .checked_pow(u32::from(failures.saturating_sub(1)))
                .and_then(|factor| base.checked_mul(factor)),
        }
        .unwrap_or(TimeDelta::MAX)
    }
}

/// Randomness added to a delay so that concurrent retries spread out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Up to this much earlier or later.
    Fixed(TimeDelta),
    /// Up to this fraction of the delay earlier or later.
    Proportional(f64),
}

impl Jitter {
    fn spread(&self, delay: TimeDelta) -> TimeDelta {
        let bound = match *self {
            Self::Fixed(spread) => spread.num_milliseconds(),
            Self::Proportional(fraction) => (delay.num_milliseconds() as f64 * fraction) as i64,
        }
        .saturating_abs();
        if bound == 0 {
            return delay;
        }
        let offset = rand::thread_rng().gen_range(-bound..=bound);
        delay
            .checked_add(&TimeDelta::milliseconds(offset))
            .unwrap_or(delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    shape: Shape,
    max: Option<TimeDelta>,
    min: TimeDelta,
    jitter: Option<Jitter>,
}

impl Backoff {
    pub const fn new(shape: Shape) -> Self {
        Self {
            shape,
            max: None,
            min: TimeDelta::zero(),
            jitter: None,
        }
    }

    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Shape::Constant(delay))
    }

    /// The default soft-failure curve: the n-th failure waits `n * step`.
    pub const fn linear(step: TimeDelta) -> Self {
        Self::new(Shape::Linear(step))
    }

    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Shape::Exponential(base))
    }

    /// Caps the delay before jitter is applied.
    pub const fn clamped(self, max: TimeDelta) -> Self {
        Self {
            max: Some(max),
            ..self
        }
    }

    /// Floors the delay after jitter is applied.
    pub const fn at_least(self, min: TimeDelta) -> Self {
        Self { min, ..self }
    }

    pub const fn with_jitter(self, jitter: Jitter) -> Self {
        Self {
            jitter: Some(jitter),
            ..self
        }
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Whether the delay never decreases as failures accumulate. Jitter breaks this.
    pub fn is_monotonic(&self) -> bool {
        self.jitter.is_none()
    }
}

impl Curve for Backoff {
    fn delay(&self, failures: u16) -> TimeDelta {
        let mut delay = self.shape.raw_delay(failures);
        if let Some(max) = self.max {
            delay = delay.min(max);
        }
        if let Some(jitter) = &self.jitter {
            delay = jitter.spread(delay);
        }
        delay.max(self.min)
    }
}
