use std::time::Duration;

use crate::config::BackoffConfig;

/// 子通道重连的指数退避计时器。
///
/// # 教案式说明
/// - **意图（Why）**：同一地址的连接失败往往成片出现，若所有子通道在固定间隔后同时重连，
///   会把刚恢复的对端再次压垮；指数增长叠加抖动可把重连分散开。
/// - **契约（What）**：
///   - 第一次 [`Backoff::next_delay`] 返回 `initial ± jitter`；
///   - 之后每次基础间隔乘以 `multiplier`，并夹紧在 `max` 以内；
///   - [`Backoff::reset`] 在连接成功后调用，恢复到初始间隔。
/// - **逻辑（How）**：抖动由 SplitMix64 对 `(seed, attempt)` 求值得到，种子来自子通道编号，
///   相同输入产生相同序列，便于测试复现。
#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    seed: u64,
    attempt: u64,
}

impl Backoff {
    pub fn new(config: BackoffConfig, seed: u64) -> Self {
        let current = config.initial();
        Self {
            config,
            current,
            seed,
            attempt: 0,
        }
    }

    /// 返回本次失败后应等待的时长，并推进基础间隔。
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current.as_secs_f64();
        let factor = jitter_factor(self.seed ^ self.attempt, self.config.jitter);
        self.attempt = self.attempt.wrapping_add(1);

        let grown = (base * self.config.multiplier).min(self.config.max().as_secs_f64());
        self.current = Duration::from_secs_f64(grown);

        Duration::from_secs_f64((base * factor).max(0.0))
    }

    pub fn reset(&mut self) {
        self.current = self.config.initial();
        self.attempt = 0;
    }

    /// 当前（未抖动的）基础间隔。
    pub fn current(&self) -> Duration {
        self.current
    }
}

#[inline]
fn jitter_factor(seed: u64, jitter: f64) -> f64 {
    let mixed = mix64(seed);
    let unit = (mixed >> 11) as f64 / ((1u64 << 53) as f64);
    1.0 + (unit * 2.0 - 1.0) * jitter
}

#[inline]
fn mix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D049BB133111EB);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn within(delay: Duration, base_ms: f64, jitter: f64) -> bool {
        let ms = delay.as_secs_f64() * 1_000.0;
        ms >= base_ms * (1.0 - jitter) - 1e-6 && ms <= base_ms * (1.0 + jitter) + 1e-6
    }

    #[test]
    fn delays_grow_geometrically_and_saturate() {
        let config = BackoffConfig {
            initial_ms: 1_000,
            multiplier: 1.6,
            jitter: 0.2,
            min_connect_timeout_ms: 20_000,
            max_ms: 3_000,
        };
        let mut backoff = Backoff::new(config, 42);
        assert!(within(backoff.next_delay(), 1_000.0, 0.2));
        assert!(within(backoff.next_delay(), 1_600.0, 0.2));
        assert!(within(backoff.next_delay(), 2_560.0, 0.2));
        assert!(within(backoff.next_delay(), 3_000.0, 0.2), "基础间隔必须夹紧到 max");
        assert_eq!(backoff.current(), Duration::from_secs(3));

        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(1));
    }

    #[test]
    fn same_seed_reproduces_sequence() {
        let mut a = Backoff::new(BackoffConfig::default(), 7);
        let mut b = Backoff::new(BackoffConfig::default(), 7);
        for _ in 0..5 {
            assert_eq!(a.next_delay(), b.next_delay());
        }
    }
}
