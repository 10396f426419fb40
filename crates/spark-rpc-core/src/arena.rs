//! 调用级 Arena：单调递增游标 + 惰性链接的 Zone 链表。
//!
//! # 教案式说明
//! - **意图（Why）**：一次调用在生命周期内会产生大量小块分配（批次控制块、元数据副本等），
//!   逐一释放代价高且容易遗漏；Arena 让这些分配在调用结束时一次性归还。
//! - **逻辑（How）**：
//!   1. 游标 `cursor` 以 `fetch_add` 前进，返回的区间 `[start, start + size)` 在全局坐标系中
//!      天然互不重叠；
//!   2. 每个 Zone 覆盖坐标区间 `[begin, end)`，Zone 之间首尾相接；
//!   3. 区间落在链表末尾之外时，按“截至目前的总需求”创建新 Zone，并以 CAS 挂到链表尾部，
//!      竞争失败的一方丢弃自己的候选 Zone，转而使用胜者的 Zone；
//!   4. 区间跨越 Zone 边界时放弃这段坐标，重新申请。
//! - **契约（What）**：分配从不失败、从不阻塞其他线程；返回的内存清零、对齐到
//!   [`MAX_ALIGN`]、在 Arena 销毁前有效；[`Arena::destroy`] 返回所有已分配（对齐后）字节之和。
//! - **注意事项（Trade-offs）**：跨界放弃的坐标不会计入 `total_used`，但会推高后续 Zone 的容量。
#![allow(unsafe_code)]

use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::AtomicU64;

use crate::sync::{AtomicPtr, AtomicUsize, Ordering};

#[repr(align(16))]
struct MaxAlign;

/// Arena 返回指针的对齐保证，也是所有尺寸向上取整的粒度。
pub const MAX_ALIGN: usize = std::mem::align_of::<MaxAlign>();

/// 将尺寸向上取整到 [`MAX_ALIGN`] 的整数倍。
pub const fn round_up(size: usize) -> usize {
    (size + MAX_ALIGN - 1) & !(MAX_ALIGN - 1)
}

struct Zone {
    begin: usize,
    end: usize,
    base: NonNull<u8>,
    layout: Option<Layout>,
    next: AtomicPtr<Zone>,
}

impl Zone {
    fn new(begin: usize, capacity: usize) -> Box<Zone> {
        let capacity = round_up(capacity);
        let (base, layout) = if capacity == 0 {
            (NonNull::<MaxAlign>::dangling().cast::<u8>(), None)
        } else {
            let layout = match Layout::from_size_align(capacity, MAX_ALIGN) {
                Ok(layout) => layout,
                Err(_) => panic!("arena zone capacity {capacity} overflows the address space"),
            };
            // SAFETY: `layout` 尺寸非零。
            let raw = unsafe { alloc_zeroed(layout) };
            let base = NonNull::new(raw).unwrap_or_else(|| handle_alloc_error(layout));
            (base, Some(layout))
        };
        Box::new(Zone {
            begin,
            end: begin + capacity,
            base,
            layout,
            next: AtomicPtr::new(ptr::null_mut()),
        })
    }
}

impl Drop for Zone {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            // SAFETY: `base` 由同一 `layout` 的 `alloc_zeroed` 分配，且仅在此处释放一次。
            unsafe { dealloc(self.base.as_ptr(), layout) };
        }
    }
}

/// 调用级 bump 分配器。
///
/// # 契约说明（What）
/// - `alloc` 可在多个线程间并发调用，返回的区间互不重叠；
/// - 单独释放某一块内存不被支持，整个 Arena 通过 [`Arena::destroy`] 或 `Drop` 一次性回收；
/// - 借用型接口（[`Arena::alloc_bytes`]、[`Arena::alloc_copy`]）把返回引用的生命周期绑定到
///   `&self`，从类型层面保证引用不会活过 Arena。
pub struct Arena {
    id: u64,
    cursor: AtomicUsize,
    used: AtomicUsize,
    zones: AtomicUsize,
    head: Box<Zone>,
}

// SAFETY: Zone 链表只通过原子指针追加，Zone 内的字节区间由游标保证独占分发。
unsafe impl Send for Arena {}
// SAFETY: 同上；并发 `alloc` 之间不共享任何可变区间。
unsafe impl Sync for Arena {}

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// 驻留在某个 Arena 内的只读记录句柄。
///
/// 句柄本身不借用 Arena，可以放进 `Arc` 在线程间共享；读取必须经由分配它的 Arena
/// （[`Arena::get`]），因此引用的生命周期仍受 Arena 约束。
pub struct ArenaSlot<T> {
    arena: u64,
    ptr: NonNull<T>,
    _marker: PhantomData<T>,
}

impl<T> Clone for ArenaSlot<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ArenaSlot<T> {}

// SAFETY: 句柄只携带地址；解引用经由 `Arena::get` 且只产生共享引用。
unsafe impl<T: Sync> Send for ArenaSlot<T> {}
// SAFETY: 同上。
unsafe impl<T: Sync> Sync for ArenaSlot<T> {}

impl<T> std::fmt::Debug for ArenaSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaSlot")
            .field("arena", &self.arena)
            .field("ptr", &self.ptr)
            .finish()
    }
}

impl Arena {
    /// 创建预留 `initial_size`（向上对齐）字节首个 Zone 的 Arena。
    pub fn new(initial_size: usize) -> Self {
        Self {
            id: NEXT_ARENA_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            cursor: AtomicUsize::new(0),
            used: AtomicUsize::new(0),
            zones: AtomicUsize::new(1),
            head: Zone::new(0, initial_size),
        }
    }

    /// 预留 `size` 字节（对齐后），返回指向清零内存的指针。
    ///
    /// 指针在 Arena 销毁前有效；调用方负责不越过 `size` 字节访问。
    /// 尺寸为 0 时返回对齐的悬垂指针，不消耗任何坐标。
    pub fn alloc(&self, size: usize) -> NonNull<u8> {
        let size = round_up(size);
        if size == 0 {
            return NonNull::<MaxAlign>::dangling().cast::<u8>();
        }
        loop {
            let start = self.cursor.fetch_add(size, Ordering::Relaxed);
            let zone = self.zone_for(start, size);
            if start + size <= zone.end {
                self.used.fetch_add(size, Ordering::Relaxed);
                // SAFETY: `start - zone.begin + size <= zone 容量`，偏移量落在 Zone 内部。
                return unsafe { NonNull::new_unchecked(zone.base.as_ptr().add(start - zone.begin)) };
            }
            // 区间跨越 Zone 尾部，放弃这段坐标后重试。
        }
    }

    /// 分配 `size` 字节并以可变切片形式返回。
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_bytes(&self, size: usize) -> &mut [u8] {
        let ptr = self.alloc(size);
        // SAFETY: 区间清零、独占，且生命周期受 `&self` 约束。
        unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), size) }
    }

    /// 将 `value` 复制进 Arena 并返回其可变引用。
    ///
    /// 仅接受 `Copy` 类型：Arena 从不运行析构函数。
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_copy<T: Copy>(&self, value: T) -> &mut T {
        assert!(
            std::mem::align_of::<T>() <= MAX_ALIGN,
            "arena cannot satisfy alignment {}",
            std::mem::align_of::<T>()
        );
        let ptr = self.alloc(std::mem::size_of::<T>()).cast::<T>();
        // SAFETY: 指针按 MAX_ALIGN 对齐、空间足够且独占。
        unsafe {
            ptr.as_ptr().write(value);
            &mut *ptr.as_ptr()
        }
    }

    /// 将 `value` 写入 Arena，返回可跨线程共享的只读句柄。
    pub fn alloc_slot<T: Copy>(&self, value: T) -> ArenaSlot<T> {
        let ptr = NonNull::from(&*self.alloc_copy(value));
        ArenaSlot {
            arena: self.id,
            ptr,
            _marker: PhantomData,
        }
    }

    /// 读取本 Arena 分配的记录。
    ///
    /// # Panics
    /// 句柄来自其他 Arena 时 panic。
    pub fn get<T: Copy>(&self, slot: ArenaSlot<T>) -> &T {
        assert_eq!(
            slot.arena, self.id,
            "arena slot read through a foreign arena"
        );
        // SAFETY: 句柄由本 Arena 的 `alloc_slot` 产生，Zone 内存在 Arena drop 前既不移动也不释放，
        // 且 `alloc_slot` 之后不再发放指向该区间的可变引用。
        unsafe { slot.ptr.as_ref() }
    }

    /// 截至目前所有成功分配的对齐后字节总数。
    pub fn total_used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// 当前 Zone 数量（含初始 Zone）。
    pub fn zone_count(&self) -> usize {
        self.zones.load(Ordering::Relaxed)
    }

    /// 销毁 Arena 并返回累计分配字节数。
    pub fn destroy(self) -> usize {
        self.total_used()
    }

    fn zone_for(&self, start: usize, size: usize) -> &Zone {
        let mut zone: &Zone = &self.head;
        while start >= zone.end {
            let mut next = zone.next.load(Ordering::Acquire);
            if next.is_null() {
                let demand = self.cursor.load(Ordering::Relaxed).max(start + size);
                let candidate = Box::into_raw(Zone::new(zone.end, demand));
                match zone.next.compare_exchange(
                    ptr::null_mut(),
                    candidate,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.zones.fetch_add(1, Ordering::Relaxed);
                        next = candidate;
                    }
                    Err(winner) => {
                        // SAFETY: 候选 Zone 从未发布，仍由本线程独占。
                        drop(unsafe { Box::from_raw(candidate) });
                        next = winner;
                    }
                }
            }
            // SAFETY: 已发布的 Zone 只在 Arena drop 时释放，此时不存在 `&self` 借用。
            zone = unsafe { &*next };
        }
        zone
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let mut next = self.head.next.load(Ordering::Acquire);
        while !next.is_null() {
            // SAFETY: 每个 Zone 只经由链表持有一次，这里按顺序逐个回收。
            let zone = unsafe { Box::from_raw(next) };
            next = zone.next.load(Ordering::Acquire);
        }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("total_used", &self.total_used())
            .field("zones", &self.zone_count())
            .finish()
    }
}

#[cfg(all(test, not(any(loom, spark_loom))))]
mod tests {
    use super::*;

    #[test]
    fn sizes_round_up_to_max_align() {
        let arena = Arena::new(0);
        arena.alloc(1);
        arena.alloc(MAX_ALIGN + 1);
        assert_eq!(arena.destroy(), MAX_ALIGN * 3);
    }

    #[test]
    fn growth_links_new_zones_and_keeps_memory_zeroed() {
        let arena = Arena::new(32);
        let first = arena.alloc_bytes(32);
        first.fill(0xAB);
        let second = arena.alloc_bytes(64);
        assert!(second.iter().all(|b| *b == 0), "新 Zone 的内存必须清零");
        assert!(arena.zone_count() >= 2);
        assert_eq!(first[31], 0xAB, "旧 Zone 内容不受扩容影响");
    }

    #[test]
    fn alloc_copy_preserves_value() {
        let arena = Arena::new(8);
        let slot = arena.alloc_copy(0xDEAD_BEEF_u64);
        *slot += 1;
        assert_eq!(*slot, 0xDEAD_BEF0);
        assert_eq!(slot as *mut u64 as usize % MAX_ALIGN, 0);
    }

    #[test]
    fn slots_are_read_back_through_their_arena() {
        let arena = Arena::new(64);
        let first = arena.alloc_slot((7u32, 1u8));
        let second = arena.alloc_slot((9u32, 2u8));
        assert_eq!(*arena.get(first), (7, 1));
        assert_eq!(*arena.get(second), (9, 2));
        assert_eq!(arena.total_used(), MAX_ALIGN * 2);
    }

    #[test]
    #[should_panic(expected = "foreign arena")]
    fn slots_reject_a_foreign_arena() {
        let owner = Arena::new(16);
        let other = Arena::new(16);
        let slot = owner.alloc_slot(1u64);
        let _ = other.get(slot);
    }

    #[test]
    fn zero_sized_allocations_cost_nothing() {
        let arena = Arena::new(0);
        assert!(arena.alloc_bytes(0).is_empty());
        assert_eq!(arena.total_used(), 0);
        assert_eq!(arena.zone_count(), 1);
    }
}
