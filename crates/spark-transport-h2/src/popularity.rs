//! 压缩表条目热度计数。
//!
//! # 教案式说明
//! - **意图（Why）**：头部压缩表空间有限，只值得为“近期反复出现”的条目付出插入成本；
//! - **契约（What）**：
//!   - [`PopularityCount::add_element`] 递增槽位计数，返回该槽位是否满足 `count >= 2 * sum / N`，
//!     阈值按整数除法向下取整；
//!   - 任一计数器达到 `u8::MAX` 时，同一步内把**所有**计数器减半（向下取整）并重算总和，
//!     这是刻意的衰减，使热度只反映近期窗口；
//! - **逻辑（How）**：定长 `u8` 数组 + `u32` 总和，不保留任何历史。

/// `N` 个槽位的饱和热度计数器。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PopularityCount<const N: usize> {
    elems: [u8; N],
    sum: u32,
}

impl<const N: usize> PopularityCount<N> {
    pub const fn new() -> Self {
        assert!(N > 0, "popularity counter needs at least one slot");
        Self {
            elems: [0; N],
            sum: 0,
        }
    }

    /// 记录一次对槽位 `index` 的访问，返回其是否“热门”。
    ///
    /// # Panics
    /// `index >= N` 时 panic。
    pub fn add_element(&mut self, index: usize) -> bool {
        self.elems[index] += 1;
        self.sum += 1;
        if self.elems[index] == u8::MAX {
            self.halve();
        }
        u64::from(self.elems[index]) >= 2 * u64::from(self.sum) / N as u64
    }

    pub fn count(&self, index: usize) -> u8 {
        self.elems[index]
    }

    pub fn sum(&self) -> u32 {
        self.sum
    }

    pub fn counts(&self) -> &[u8; N] {
        &self.elems
    }

    fn halve(&mut self) {
        self.sum = 0;
        for elem in &mut self.elems {
            *elem /= 2;
            self.sum += u32::from(*elem);
        }
    }
}

impl<const N: usize> Default for PopularityCount<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn popularity_is_relative_to_the_average() {
        let mut counter = PopularityCount::<4>::new();
        assert!(counter.add_element(0), "1 >= 2 * 1 / 4");
        assert!(counter.add_element(0));
        assert!(counter.add_element(0));
        assert!(!counter.add_element(1), "1 < 2 * 4 / 4");
        assert!(counter.add_element(0), "4 >= 2 * 5 / 4");
    }

    #[test]
    fn threshold_is_floored() {
        let mut counter = PopularityCount::<4>::new();
        counter.add_element(0);
        counter.add_element(0);
        assert!(counter.add_element(1), "2 * 3 / 4 向下取整为 1");
        assert_eq!((counter.count(1), counter.sum()), (1, 3));
    }

    #[test]
    fn saturation_halves_every_slot() {
        let mut counter = PopularityCount::<4>::new();
        for _ in 0..9 {
            counter.add_element(1);
        }
        for _ in 0..3 {
            counter.add_element(2);
        }
        for _ in 0..254 {
            counter.add_element(0);
        }
        assert_eq!(counter.count(0), 254);

        counter.add_element(0);
        assert_eq!(counter.counts(), &[127, 4, 1, 0]);
        assert_eq!(counter.sum(), 132);
    }
}
