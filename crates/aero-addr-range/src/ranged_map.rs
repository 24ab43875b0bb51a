use hashbrown::HashMap;

use crate::range::AddressRange32;

/// A map from 32-bit addresses to `T`, sharded into blocks of `BLOCK_SIZE` addresses.
///
/// The shard table is allocated eagerly with `2^32 / BLOCK_SIZE` empty maps, so its footprint is
/// that count times the size of an empty `hashbrown::HashMap` (no heap allocation per empty
/// shard). With a 1 MiB block size this is 4096 shards. `BLOCK_SIZE` must be a power of two.
///
/// Range-scoped iteration ([`RangedMap::range`], [`RangedMap::cursor`]) only visits the shards the
/// range touches and yields the keys of each shard in ascending order.
pub struct RangedMap<T, const BLOCK_SIZE: u32> {
    shards: Vec<HashMap<u32, T>>,
    len: usize,
}

impl<T, const BLOCK_SIZE: u32> RangedMap<T, BLOCK_SIZE> {
    pub const SHARD_COUNT: usize = {
        assert!(BLOCK_SIZE.is_power_of_two(), "BLOCK_SIZE must be a power of two");
        ((1u64 << 32) / BLOCK_SIZE as u64) as usize
    };

    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(Self::SHARD_COUNT);
        shards.resize_with(Self::SHARD_COUNT, HashMap::new);
        Self { shards, len: 0 }
    }

    pub fn shard_count(&self) -> usize {
        Self::SHARD_COUNT
    }

    pub fn block_for(key: u32) -> usize {
        (key / BLOCK_SIZE) as usize
    }

    /// First address of `block`.
    pub fn block_address(block: usize) -> u32 {
        debug_assert!(block < Self::SHARD_COUNT);
        (block as u32).wrapping_mul(BLOCK_SIZE)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, key: u32) -> Option<&T> {
        self.shards[Self::block_for(key)].get(&key)
    }

    pub fn get_mut(&mut self, key: u32) -> Option<&mut T> {
        self.shards[Self::block_for(key)].get_mut(&key)
    }

    pub fn contains_key(&self, key: u32) -> bool {
        self.shards[Self::block_for(key)].contains_key(&key)
    }

    pub fn insert(&mut self, key: u32, value: T) -> Option<T> {
        let old = self.shards[Self::block_for(key)].insert(key, value);
        if old.is_none() {
            self.len += 1;
        }
        old
    }

    pub fn remove(&mut self, key: u32) -> Option<T> {
        let old = self.shards[Self::block_for(key)].remove(&key);
        if old.is_some() {
            self.len -= 1;
        }
        old
    }

    /// The entry for `key`, default-constructed if missing.
    pub fn get_or_default(&mut self, key: u32) -> &mut T
    where
        T: Default,
    {
        let shard = &mut self.shards[Self::block_for(key)];
        if !shard.contains_key(&key) {
            self.len += 1;
        }
        shard.entry(key).or_default()
    }

    pub fn clear(&mut self) {
        for shard in &mut self.shards {
            shard.clear();
        }
        self.len = 0;
    }

    /// All entries, shard by shard. Order within a shard is unspecified.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> + '_ {
        self.shards
            .iter()
            .flat_map(|shard| shard.iter().map(|(k, v)| (*k, v)))
    }

    /// Half-open span of shards covered by `range`.
    fn shard_span(range: &AddressRange32) -> (usize, usize) {
        if !range.valid() {
            return (0, 0);
        }
        (Self::block_for(range.start), Self::block_for(range.end) + 1)
    }

    fn sorted_keys(shard: &HashMap<u32, T>, range: &AddressRange32) -> Vec<u32> {
        let mut keys: Vec<u32> = shard
            .keys()
            .copied()
            .filter(|k| range.overlaps_address(*k))
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Entries whose key lies in `range`, ascending within each shard.
    pub fn range(&self, range: AddressRange32) -> impl Iterator<Item = (u32, &T)> + '_ {
        let (first, end) = Self::shard_span(&range);
        self.shards[first..end].iter().flat_map(move |shard| {
            Self::sorted_keys(shard, &range)
                .into_iter()
                .filter_map(move |k| shard.get(&k).map(|v| (k, v)))
        })
    }

    /// An erase-capable cursor over the entries whose key lies in `range`.
    pub fn cursor(&mut self, range: AddressRange32) -> RangeCursor<'_, T, BLOCK_SIZE> {
        RangeCursor::new(self, range)
    }
}

impl<T, const BLOCK_SIZE: u32> Default for RangedMap<T, BLOCK_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: std::fmt::Debug, const BLOCK_SIZE: u32> std::fmt::Debug for RangedMap<T, BLOCK_SIZE> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Position inside a range-scoped walk over a [`RangedMap`].
///
/// The cursor always rests on an entry or at the end; [`RangeCursor::erase`] removes the current
/// entry and moves on, even when that empties the current shard.
pub struct RangeCursor<'a, T, const BLOCK_SIZE: u32> {
    map: &'a mut RangedMap<T, BLOCK_SIZE>,
    range: AddressRange32,
    shard: usize,
    end_shard: usize,
    keys: Vec<u32>,
    pos: usize,
}

impl<'a, T, const BLOCK_SIZE: u32> RangeCursor<'a, T, BLOCK_SIZE> {
    fn new(map: &'a mut RangedMap<T, BLOCK_SIZE>, range: AddressRange32) -> Self {
        let (shard, end_shard) = RangedMap::<T, BLOCK_SIZE>::shard_span(&range);
        let mut cursor = Self {
            map,
            range,
            shard,
            end_shard,
            keys: Vec::new(),
            pos: 0,
        };
        if cursor.shard < cursor.end_shard {
            cursor.load();
        }
        cursor.settle();
        cursor
    }

    fn load(&mut self) {
        self.keys =
            RangedMap::<T, BLOCK_SIZE>::sorted_keys(&self.map.shards[self.shard], &self.range);
        self.pos = 0;
    }

    /// Skip exhausted shards until an entry or the end is reached.
    fn settle(&mut self) {
        while self.shard < self.end_shard && self.pos >= self.keys.len() {
            self.shard += 1;
            if self.shard < self.end_shard {
                self.load();
            }
        }
    }

    pub fn is_end(&self) -> bool {
        self.shard >= self.end_shard
    }

    pub fn key(&self) -> Option<u32> {
        if self.is_end() {
            None
        } else {
            Some(self.keys[self.pos])
        }
    }

    pub fn get(&self) -> Option<&T> {
        let key = self.key()?;
        self.map.shards[self.shard].get(&key)
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        let key = self.key()?;
        self.map.shards[self.shard].get_mut(&key)
    }

    /// The current payload. Panics at the end.
    pub fn value(&self) -> &T {
        match self.get() {
            Some(value) => value,
            None => panic!("RangeCursor dereferenced at end"),
        }
    }

    pub fn advance(&mut self) {
        if self.is_end() {
            return;
        }
        self.pos += 1;
        self.settle();
    }

    /// Remove the current entry and move to the next one. `None` at the end.
    pub fn erase(&mut self) -> Option<T> {
        let key = self.key()?;
        let removed = self.map.shards[self.shard].remove(&key);
        if removed.is_some() {
            self.map.len -= 1;
        }
        self.pos += 1;
        self.settle();
        removed
    }
}
