use aero_addr_range::AddressRange32;
use tracing::{debug, trace};

use crate::buffer::BufferObject;
use crate::tag::next_shared_tag;

#[derive(Debug)]
struct DmaBlock<B> {
    /// Index of the block this one forwards to; equal to its own index for heads and unbacked
    /// blocks.
    parent: u32,
    bo: Option<B>,
    memory_tag: u64,
    spilled: bool,
}

/// Snapshot of one backed run, for external eviction policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaHead {
    pub range: AddressRange32,
    /// Most recent tag of any block in the run.
    pub memory_tag: u64,
    pub spilled: bool,
}

/// Buffer objects for the whole 32-bit guest space, at `BLOCK_SIZE` granularity.
///
/// The block table holds `2^32 / BLOCK_SIZE` entries and is allocated up front. Blocks form a
/// union-find forest: each backed run is a tree rooted at its head, and lookups compress paths as
/// merges leave old heads pointing at new ones.
pub struct SurfaceCacheDma<B, const BLOCK_SIZE: u32> {
    blocks: Vec<DmaBlock<B>>,
}

fn block_align_up(size: u64, block_size: u32) -> u64 {
    let mask = u64::from(block_size) - 1;
    (size + mask) & !mask
}

impl<B: BufferObject, const BLOCK_SIZE: u32> SurfaceCacheDma<B, BLOCK_SIZE> {
    pub const BLOCK_COUNT: usize = {
        assert!(BLOCK_SIZE.is_power_of_two(), "BLOCK_SIZE must be a power of two");
        ((1u64 << 32) / BLOCK_SIZE as u64) as usize
    };

    pub fn new() -> Self {
        let blocks = (0..Self::BLOCK_COUNT)
            .map(|i| DmaBlock {
                parent: i as u32,
                bo: None,
                memory_tag: 0,
                spilled: false,
            })
            .collect();
        Self { blocks }
    }

    fn block_for(address: u32) -> usize {
        (address / BLOCK_SIZE) as usize
    }

    fn block_base(block: usize) -> u32 {
        (block as u32).wrapping_mul(BLOCK_SIZE)
    }

    fn find_root(&self, block: usize) -> usize {
        let mut root = block;
        while self.blocks[root].parent as usize != root {
            root = self.blocks[root].parent as usize;
        }
        root
    }

    fn find(&mut self, block: usize) -> usize {
        let root = self.find_root(block);
        let mut cur = block;
        while cur != root {
            let next = self.blocks[cur].parent as usize;
            self.blocks[cur].parent = root as u32;
            cur = next;
        }
        root
    }

    /// Blocks spanned by the buffer owned by `head`.
    fn head_blocks(&self, head: usize) -> usize {
        self.blocks[head].bo.as_ref().map_or(1, |bo| {
            (block_align_up(bo.size(), BLOCK_SIZE) / u64::from(BLOCK_SIZE)) as usize
        })
    }

    fn head_span(&self, head: usize) -> Option<AddressRange32> {
        let bo = self.blocks[head].bo.as_ref()?;
        let start = u64::from(Self::block_base(head));
        let end = (start + bo.size()).min(1 << 32) - 1;
        Some(AddressRange32::start_end(start as u32, end as u32))
    }

    /// Ensure `range` is backed by a single buffer object, merging runs as needed.
    pub fn with_range(&mut self, ctx: &mut B::Context, range: AddressRange32) -> &mut Self {
        assert!(range.valid(), "with_range on invalid range {range}");

        let first = Self::block_for(range.start);
        let head = self.find(first);
        if let Some(span) = self.head_span(head) {
            if range.inside(&span) {
                trace!(%range, %span, "dma range already contiguous");
                return self;
            }
        }

        // Start from the run containing `range.start` if there is one, else from its block.
        let start = if self.blocks[head].bo.is_some() {
            head
        } else {
            first
        };
        let base_address = Self::block_base(start);
        let end = u64::from(range.end);
        let mut address = u64::from(base_address);
        let mut list = Vec::new();

        while address <= end {
            let index = (address / u64::from(BLOCK_SIZE)) as usize;
            debug_assert_eq!(self.find_root(index), index, "walk landed inside a run");

            let block = &mut self.blocks[index];
            block.parent = start as u32;
            match block.bo.take() {
                Some(mut bo) => {
                    if block.spilled {
                        bo.unspill_buffer(ctx);
                        block.spilled = false;
                    }
                    address += block_align_up(bo.size(), BLOCK_SIZE).max(u64::from(BLOCK_SIZE));
                    list.push(Some(bo));
                }
                None => {
                    address += u64::from(BLOCK_SIZE);
                    list.push(None);
                }
            }
        }

        let pieces = list.len();
        let unified = B::merge_bo_list(ctx, BLOCK_SIZE, base_address, list);
        debug_assert_eq!(unified.base_address(), base_address);
        debug_assert_eq!(u64::from(base_address) + unified.size(), address);

        let head = &mut self.blocks[start];
        head.parent = start as u32;
        head.bo = Some(unified);
        head.spilled = false;

        debug!(
            base = format_args!("{base_address:#x}"),
            end = format_args!("{:#x}", address - 1),
            pieces,
            "merged dma blocks"
        );
        self
    }

    /// Stamp every block covered by `range` with a fresh generation tag.
    pub fn touch(&mut self, range: AddressRange32) -> u64 {
        let tag = next_shared_tag();
        if range.valid() {
            for block in Self::block_for(range.start)..=Self::block_for(range.end) {
                self.blocks[block].memory_tag = tag;
            }
        }
        tag
    }

    pub fn memory_tag(&self, address: u32) -> u64 {
        self.blocks[Self::block_for(address)].memory_tag
    }

    /// The buffer backing `address` and the offset of `address` within it.
    pub fn get(&self, address: u32) -> Option<(&B, u32)> {
        let head = self.find_root(Self::block_for(address));
        let bo = self.blocks[head].bo.as_ref()?;
        let offset = address - Self::block_base(head);
        if u64::from(offset) >= bo.size() {
            return None;
        }
        Some((bo, offset))
    }

    /// Guest range of the run containing `address`, if it is backed.
    pub fn head_range(&self, address: u32) -> Option<AddressRange32> {
        let head = self.find_root(Self::block_for(address));
        self.head_span(head)
    }

    /// `range` widened to block granularity, starting at the head of its first block's run.
    pub fn to_block_range(&self, range: AddressRange32) -> AddressRange32 {
        debug_assert!(range.valid());
        let first = Self::block_for(range.start);
        let head = self.find_root(first);
        let start = if self.blocks[head].bo.is_some() {
            Self::block_base(head)
        } else {
            Self::block_base(first)
        };
        AddressRange32::start_end(start, range.end | (BLOCK_SIZE - 1))
    }

    /// Heads whose run overlaps `range`, in address order.
    fn heads_in(&self, range: AddressRange32) -> Vec<usize> {
        let mut heads = Vec::new();
        if !range.valid() {
            return heads;
        }
        let mut block = self.find_root(Self::block_for(range.start));
        let last = Self::block_for(range.end);
        while block <= last {
            if self.blocks[block].bo.is_some() {
                heads.push(block);
            }
            block += self.head_blocks(block);
        }
        heads
    }

    /// Move every backed run overlapping `range` to host memory.
    pub fn spill(&mut self, ctx: &mut B::Context, range: AddressRange32) {
        for head in self.heads_in(range) {
            let block = &mut self.blocks[head];
            if let (Some(bo), false) = (block.bo.as_mut(), block.spilled) {
                bo.spill_buffer(ctx);
                block.spilled = true;
                debug!(base = format_args!("{:#x}", Self::block_base(head)), "spilled dma run");
            }
        }
    }

    /// Bring every spilled run overlapping `range` back to device memory.
    pub fn unspill(&mut self, ctx: &mut B::Context, range: AddressRange32) {
        for head in self.heads_in(range) {
            let block = &mut self.blocks[head];
            if let (Some(bo), true) = (block.bo.as_mut(), block.spilled) {
                bo.unspill_buffer(ctx);
                block.spilled = false;
                debug!(base = format_args!("{:#x}", Self::block_base(head)), "unspilled dma run");
            }
        }
    }

    pub fn is_spilled(&self, address: u32) -> bool {
        let head = self.find_root(Self::block_for(address));
        self.blocks[head].bo.is_some() && self.blocks[head].spilled
    }

    /// Detach the run containing `address` and hand its buffer back to the caller.
    pub fn evict(&mut self, address: u32) -> Option<B> {
        let head = self.find(Self::block_for(address));
        let count = self.head_blocks(head);
        let bo = self.blocks[head].bo.take()?;

        let end = (head + count).min(Self::BLOCK_COUNT);
        for (index, block) in self.blocks[head..end].iter_mut().enumerate() {
            block.parent = (head + index) as u32;
            block.spilled = false;
        }
        debug!(
            base = format_args!("{:#x}", Self::block_base(head)),
            size = bo.size(),
            "evicted dma run"
        );
        Some(bo)
    }

    /// Every backed run, in address order.
    pub fn heads(&self) -> impl Iterator<Item = DmaHead> + '_ {
        let mut block = 0;
        std::iter::from_fn(move || {
            while block < Self::BLOCK_COUNT {
                let head = block;
                let count = self.head_blocks(head);
                block += count;

                if let Some(range) = self.head_span(head) {
                    let end = (head + count).min(Self::BLOCK_COUNT);
                    let memory_tag = self.blocks[head..end]
                        .iter()
                        .map(|b| b.memory_tag)
                        .max()
                        .unwrap_or(0);
                    return Some(DmaHead {
                        range,
                        memory_tag,
                        spilled: self.blocks[head].spilled,
                    });
                }
            }
            None
        })
    }
}

impl<B: BufferObject, const BLOCK_SIZE: u32> Default for SurfaceCacheDma<B, BLOCK_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: u32 = 0x1_0000;

    /// Host-side stand-in: remembers which original pieces it was merged from.
    #[derive(Debug, PartialEq)]
    struct FakeBo {
        base: u32,
        size: u64,
        pieces: Vec<Option<u32>>,
        spilled: bool,
    }

    #[derive(Default)]
    struct Ctx {
        merges: usize,
        spills: usize,
        unspills: usize,
    }

    impl BufferObject for FakeBo {
        type Context = Ctx;

        fn size(&self) -> u64 {
            self.size
        }

        fn base_address(&self) -> u32 {
            self.base
        }

        fn merge_bo_list(
            ctx: &mut Ctx,
            block_size: u32,
            base_address: u32,
            list: Vec<Option<Self>>,
        ) -> Self {
            ctx.merges += 1;
            let mut size = 0;
            let mut pieces = Vec::new();
            for entry in list {
                match entry {
                    Some(bo) => {
                        assert!(!bo.spilled, "merged a spilled buffer");
                        assert_eq!(u64::from(bo.base), u64::from(base_address) + size);
                        size += bo.size;
                        pieces.push(Some(bo.base));
                    }
                    None => {
                        size += u64::from(block_size);
                        pieces.push(None);
                    }
                }
            }
            FakeBo {
                base: base_address,
                size,
                pieces,
                spilled: false,
            }
        }

        fn spill_buffer(&mut self, ctx: &mut Ctx) {
            ctx.spills += 1;
            self.spilled = true;
        }

        fn unspill_buffer(&mut self, ctx: &mut Ctx) {
            ctx.unspills += 1;
            self.spilled = false;
        }
    }

    type Cache = SurfaceCacheDma<FakeBo, BLOCK>;

    fn r(start: u32, end: u32) -> AddressRange32 {
        AddressRange32::start_end(start, end)
    }

    #[test]
    fn first_touch_creates_block_aligned_buffer() {
        let mut ctx = Ctx::default();
        let mut cache = Cache::new();
        cache.with_range(&mut ctx, r(0x1_0100, 0x2_0010));

        assert_eq!(cache.head_range(0x1_0100), Some(r(0x1_0000, 0x2_FFFF)));
        let (bo, offset) = cache.get(0x2_0010).unwrap();
        assert_eq!(bo.base, 0x1_0000);
        assert_eq!(offset, 0x1_0010);
        assert_eq!(bo.pieces, vec![None, None]);
        assert!(cache.get(0x3_0000).is_none());
    }

    #[test]
    fn contained_request_takes_fast_path() {
        let mut ctx = Ctx::default();
        let mut cache = Cache::new();
        cache.with_range(&mut ctx, r(0x1_0000, 0x3_FFFF));
        cache.with_range(&mut ctx, r(0x2_0000, 0x2_00FF));
        assert_eq!(ctx.merges, 1);
    }

    #[test]
    fn growing_a_run_absorbs_following_runs() {
        let mut ctx = Ctx::default();
        let mut cache = Cache::new();
        cache.with_range(&mut ctx, r(0x1_0000, 0x2_FFFF));
        cache.with_range(&mut ctx, r(0x4_0000, 0x4_FFFF));
        cache.with_range(&mut ctx, r(0x1_8000, 0x4_8000));

        let head = cache.head_range(0x4_1234).unwrap();
        assert_eq!(head, r(0x1_0000, 0x4_FFFF));
        let (bo, offset) = cache.get(0x4_1234).unwrap();
        assert_eq!(offset, 0x3_1234);
        assert_eq!(bo.pieces, vec![Some(0x1_0000), None, Some(0x4_0000)]);

        // Old members of the first run resolve through the chain.
        assert_eq!(cache.get(0x2_0000).unwrap().1, 0x1_0000);
        assert_eq!(cache.to_block_range(r(0x3_0001, 0x4_0001)), r(0x1_0000, 0x4_FFFF));
        assert_eq!(cache.heads().count(), 1);
    }

    #[test]
    fn touch_stamps_covered_blocks() {
        let mut cache = Cache::new();
        let tag = cache.touch(r(0x1_FFFF, 0x2_0000));
        assert_eq!(cache.memory_tag(0x1_0000), tag);
        assert_eq!(cache.memory_tag(0x2_FFFF), tag);
        assert_eq!(cache.memory_tag(0x3_0000), 0);

        let later = cache.touch(r(0x2_0000, 0x2_0000));
        assert!(later > tag);
    }

    #[test]
    fn spilled_runs_are_unspilled_before_merging() {
        let mut ctx = Ctx::default();
        let mut cache = Cache::new();
        cache.with_range(&mut ctx, r(0x1_0000, 0x1_FFFF));
        cache.spill(&mut ctx, r(0, 0xFFFF_FFFF));
        assert!(cache.is_spilled(0x1_0000));
        assert_eq!(ctx.spills, 1);

        cache.spill(&mut ctx, r(0x1_0000, 0x1_0000));
        assert_eq!(ctx.spills, 1);

        cache.with_range(&mut ctx, r(0x1_0000, 0x2_FFFF));
        assert_eq!(ctx.unspills, 1);
        assert!(!cache.is_spilled(0x1_0000));
    }

    #[test]
    fn unspill_restores_device_copy() {
        let mut ctx = Ctx::default();
        let mut cache = Cache::new();
        cache.with_range(&mut ctx, r(0x5_0000, 0x5_FFFF));
        cache.spill(&mut ctx, r(0x5_0000, 0x5_0000));
        cache.unspill(&mut ctx, r(0x5_8000, 0x5_8000));

        assert!(!cache.is_spilled(0x5_0000));
        assert!(!cache.get(0x5_0000).unwrap().0.spilled);
    }

    #[test]
    fn evict_detaches_every_member() {
        let mut ctx = Ctx::default();
        let mut cache = Cache::new();
        cache.with_range(&mut ctx, r(0x1_0000, 0x1_FFFF));
        cache.with_range(&mut ctx, r(0x1_0000, 0x3_FFFF));

        let bo = cache.evict(0x2_0000).unwrap();
        assert_eq!(bo.size, 0x3_0000);
        assert!(cache.get(0x1_0000).is_none());
        assert!(cache.get(0x3_0000).is_none());
        assert!(cache.evict(0x2_0000).is_none());
        assert_eq!(cache.heads().count(), 0);

        // Blocks can be backed again from scratch.
        cache.with_range(&mut ctx, r(0x2_0000, 0x2_FFFF));
        assert_eq!(cache.head_range(0x2_0000), Some(r(0x2_0000, 0x2_FFFF)));
    }

    #[test]
    fn heads_report_latest_tag() {
        let mut ctx = Ctx::default();
        let mut cache = Cache::new();
        cache.with_range(&mut ctx, r(0x1_0000, 0x2_FFFF));
        cache.with_range(&mut ctx, r(0x8_0000, 0x8_FFFF));
        cache.touch(r(0x1_0000, 0x1_0000));
        let tag = cache.touch(r(0x2_0000, 0x2_0000));

        let heads: Vec<DmaHead> = cache.heads().collect();
        assert_eq!(heads.len(), 2);
        assert_eq!(heads[0].range, r(0x1_0000, 0x2_FFFF));
        assert_eq!(heads[0].memory_tag, tag);
        assert_eq!(heads[1].memory_tag, 0);
    }

    #[test]
    fn top_of_address_space() {
        let mut ctx = Ctx::default();
        let mut cache = Cache::new();
        cache.with_range(&mut ctx, r(0xFFFE_0000, 0xFFFF_FFFF));
        assert_eq!(cache.head_range(0xFFFF_FFFF), Some(r(0xFFFE_0000, 0xFFFF_FFFF)));
        assert_eq!(cache.to_block_range(r(0xFFFF_0000, 0xFFFF_0001)), r(0xFFFE_0000, 0xFFFF_FFFF));
    }
}
