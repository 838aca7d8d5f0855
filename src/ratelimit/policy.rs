//! Quota policies and their evaluation arithmetic.
//!
//! Evaluation is pure: it takes the stored state (if any), the request, and
//! the current time, and returns the outcome together with the state that
//! should be written back when the request is committed. Stores wrap this in
//! whatever atomicity their backend provides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Allowance of `rate` is granted at each period boundary, accruing up to
    /// `capacity`.
    FixedWindow,
    /// Allowance replenishes continuously at `rate` per period up to
    /// `capacity`.
    TokenBucket,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FixedWindow => "fixed_window",
            Self::TokenBucket => "token_bucket",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// Evaluate only; never writes state.
    Check,
    /// Evaluate and persist the consumed state when allowed.
    Consume,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitPolicy {
    pub kind: PolicyKind,
    pub rate: f64,
    pub period_ms: u64,
    /// Maximum accrued allowance. Defaults to `rate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<f64>,
    /// Window alignment for fixed windows, in epoch millis. Defaults to 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ms: Option<i64>,
}

impl LimitPolicy {
    pub fn fixed_window(rate: f64, period: Duration) -> Self {
        Self {
            kind: PolicyKind::FixedWindow,
            rate,
            period_ms: period.as_millis() as u64,
            capacity: None,
            start_ms: None,
        }
    }

    pub fn token_bucket(rate: f64, period: Duration) -> Self {
        Self {
            kind: PolicyKind::TokenBucket,
            rate,
            period_ms: period.as_millis() as u64,
            capacity: None,
            start_ms: None,
        }
    }

    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_start(mut self, start_ms: i64) -> Self {
        self.start_ms = Some(start_ms);
        self
    }

    pub fn effective_capacity(&self) -> f64 {
        self.capacity.unwrap_or(self.rate)
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    fn period_f64(&self) -> f64 {
        self.period_ms.max(1) as f64
    }

    pub fn initial_state(&self, now: i64) -> BucketState {
        let ts = match self.kind {
            PolicyKind::FixedWindow => {
                let period = self.period_ms.max(1) as i64;
                let start = self.start_ms.unwrap_or(0);
                now - (now - start).rem_euclid(period)
            }
            PolicyKind::TokenBucket => now,
        };
        BucketState {
            value: self.effective_capacity(),
            ts,
        }
    }

    /// Brings a stored state forward to `now` without consuming anything.
    pub fn replenish(&self, state: Option<BucketState>, now: i64) -> BucketState {
        let Some(mut state) = state else {
            return self.initial_state(now);
        };
        if now <= state.ts {
            return state;
        }

        let capacity = self.effective_capacity();
        match self.kind {
            PolicyKind::FixedWindow => {
                let period = self.period_ms.max(1) as i64;
                let windows = (now - state.ts) / period;
                if windows > 0 {
                    state.value = (state.value + windows as f64 * self.rate).min(capacity);
                    state.ts += windows * period;
                }
            }
            PolicyKind::TokenBucket => {
                let elapsed = (now - state.ts) as f64;
                state.value = (state.value + elapsed * self.rate / self.period_f64()).min(capacity);
                state.ts = now;
            }
        }
        state
    }

    /// Evaluates `request` against the replenished state.
    ///
    /// A reserve request is a charge for work already done when consumed: it
    /// always succeeds and may drive the counter negative. As a check it only
    /// asks whether the counter is still positive.
    pub fn evaluate(
        &self,
        state: Option<BucketState>,
        request: LimitRequest,
        mode: EvalMode,
        now: i64,
    ) -> Evaluation {
        let mut state = self.replenish(state, now);
        let capacity = self.effective_capacity();

        let (ok, deficit, strict) = if request.reserve {
            (
                mode == EvalMode::Consume || state.value > 0.0,
                -state.value,
                true,
            )
        } else {
            (state.value >= request.count, request.count - state.value, false)
        };

        if ok {
            state.value -= request.count;
            return Evaluation {
                ok,
                retry_after: None,
                state,
            };
        }

        let retry_after = if request.reserve || request.count <= capacity {
            Some(self.wait_for(&state, deficit, strict, now))
        } else {
            None
        };

        Evaluation {
            ok,
            retry_after,
            state,
        }
    }

    /// Milliseconds from `now` until `state` has refilled to capacity, plus
    /// one period. Past that point the stored state is indistinguishable from
    /// a fresh one and may be dropped.
    pub fn retention_millis(&self, state: &BucketState, now: i64) -> u64 {
        let rate = if self.rate > 0.0 { self.rate } else { f64::MIN_POSITIVE };
        let period = self.period_f64();
        let missing = (self.effective_capacity() - state.value).max(0.0);
        let refill = match self.kind {
            PolicyKind::FixedWindow => {
                let windows = (missing / rate).ceil();
                (state.ts as f64 + windows * period - now as f64).max(0.0)
            }
            PolicyKind::TokenBucket => (missing * period / rate).ceil(),
        };
        (refill + period) as u64
    }

    /// Time until `deficit` more allowance has accrued. `strict` asks for the
    /// counter to move strictly past the deficit.
    fn wait_for(&self, state: &BucketState, deficit: f64, strict: bool, now: i64) -> Duration {
        let rate = if self.rate > 0.0 { self.rate } else { f64::MIN_POSITIVE };
        let millis = match self.kind {
            PolicyKind::FixedWindow => {
                let windows = if strict {
                    (deficit / rate).floor() + 1.0
                } else {
                    (deficit / rate).ceil()
                };
                state.ts as f64 + windows * self.period_f64() - now as f64
            }
            PolicyKind::TokenBucket => {
                let exact = deficit * self.period_f64() / rate;
                if strict {
                    exact.floor() + 1.0
                } else {
                    exact.ceil()
                }
            }
        };
        Duration::from_millis(millis.max(0.0) as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub value: f64,
    /// Epoch millis of the last update (window start for fixed windows).
    pub ts: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitRequest {
    pub count: f64,
    pub reserve: bool,
}

impl LimitRequest {
    pub fn new(count: f64) -> Self {
        Self {
            count,
            reserve: false,
        }
    }

    pub fn reserved(count: f64) -> Self {
        Self {
            count,
            reserve: true,
        }
    }
}

impl Default for LimitRequest {
    fn default() -> Self {
        Self::new(1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub ok: bool,
    pub retry_after: Option<Duration>,
    /// Consumed state when `ok`, replenished state otherwise.
    pub state: BucketState,
}
