//! 头部是否进入动态表的决策。
//!
//! 把 `(name, value)` 以 FNV-1a 散列到热度计数器的槽位，只有“热门且放得下”的头部才被索引：
//! `popular && 32 + len(name) + len(value) < max_decoder_space_usage`。
//! 放不下的头部不会计入热度，避免大值挤占计数窗口。

use crate::popularity::PopularityCount;
use crate::settings::{ENTRY_OVERHEAD, H2Settings};

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 单个表项占用的解码端空间。
pub fn entry_size(name: &[u8], value: &[u8]) -> usize {
    ENTRY_OVERHEAD + name.len() + value.len()
}

/// 头部索引决策器，`N` 为热度槽位数。
#[derive(Clone, Debug)]
pub struct HeaderIndexer<const N: usize> {
    popularity: PopularityCount<N>,
    max_decoder_space_usage: usize,
}

impl<const N: usize> HeaderIndexer<N> {
    pub fn new(settings: &H2Settings) -> Self {
        Self {
            popularity: PopularityCount::new(),
            max_decoder_space_usage: settings.max_decoder_space_usage,
        }
    }

    /// 记录一次头部出现，返回是否应加入动态表。
    pub fn should_index(&mut self, name: &[u8], value: &[u8]) -> bool {
        if entry_size(name, value) >= self.max_decoder_space_usage {
            return false;
        }
        let slot = (fnv1a(name, value) as usize) % N;
        self.popularity.add_element(slot)
    }

    pub fn popularity(&self) -> &PopularityCount<N> {
        &self.popularity
    }
}

fn fnv1a(name: &[u8], value: &[u8]) -> u32 {
    // 名称与值之间插入分隔字节，使 ("ab", "c") 与 ("a", "bc") 落到不同槽位。
    name.iter()
        .chain(std::iter::once(&0u8))
        .chain(value)
        .fold(FNV_OFFSET_BASIS, |hash, &byte| {
            (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
        })
}
