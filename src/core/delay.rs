use crate::domain::ports::DelayPolicy;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 單次等待的上限（24 小時）
pub const MAX_DELAY_SECS: f64 = 24.0 * 60.0 * 60.0;

/// 以均勻分布抽樣的 `[min_secs, max_secs]` 區間（含兩端）

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl DelayRange {
    pub const ZERO: DelayRange = DelayRange {
        min_secs: 0.0,
        max_secs: 0.0,
    };

    pub fn new(min_secs: f64, max_secs: f64) -> Self {
        Self { min_secs, max_secs }
    }

    pub fn is_valid(&self) -> bool {
        self.min_secs.is_finite()
            && self.max_secs.is_finite()
            && self.min_secs >= 0.0
            && self.min_secs <= self.max_secs
            && self.max_secs <= MAX_DELAY_SECS
    }

    pub fn sample(&self) -> Duration {
        // 設定錯誤時不 panic，退回下限
        if !self.is_valid() {
            return Duration::from_secs_f64(self.min_secs.max(0.0).min(MAX_DELAY_SECS));
        }
        if self.min_secs == self.max_secs {
            return Duration::from_secs_f64(self.min_secs);
        }
        let secs = rand::thread_rng().gen_range(self.min_secs..=self.max_secs);
        Duration::from_secs_f64(secs)
    }
}

/// 預設策略：兩種等待都從設定區間均勻抽樣
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UniformDelayPolicy {
    pub pre_attempt: DelayRange,
    pub backoff: DelayRange,
}

impl UniformDelayPolicy {
    pub fn new(pre_attempt: DelayRange, backoff: DelayRange) -> Self {
        Self {
            pre_attempt,
            backoff,
        }
    }

    /// 完全不等待，用於試跑與測試
    pub fn immediate() -> Self {
        Self::new(DelayRange::ZERO, DelayRange::ZERO)
    }
}

impl Default for UniformDelayPolicy {
    fn default() -> Self {
        Self::new(DelayRange::new(2.0, 5.0), DelayRange::new(5.0, 10.0))
    }
}

impl DelayPolicy for UniformDelayPolicy {
    fn pre_attempt_delay(&self) -> Duration {
        self.pre_attempt.sample()
    }

    fn inter_attempt_backoff(&self) -> Duration {
        self.backoff.sample()
    }
}
