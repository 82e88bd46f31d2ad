//! Append-only buffer made of fixed-size chunks.
//!
//! A chunk is allocated with room for exactly `N` elements and is never pushed
//! past that, so an element never moves once it has been added. Growing the
//! buffer only ever allocates a new chunk.

pub struct ChunkedBuffer<T, const N: usize> {
    chunks: Vec<Vec<T>>,
    /// Chunk currently receiving appends. Every chunk before it is full.
    active: usize,
    len: usize,
    /// Total chunks allocated over the lifetime of the buffer.
    allocations: usize,
}

impl<T, const N: usize> Default for ChunkedBuffer<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> ChunkedBuffer<T, N> {
    pub const CHUNK_CAPACITY: usize = N;

    pub const fn new() -> Self {
        const { assert!(N > 0, "chunk capacity must be non-zero") };
        Self {
            chunks: Vec::new(),
            active: 0,
            len: 0,
            allocations: 0,
        }
    }

    /// Append `value` and return a reference to its slot.
    pub fn add(&mut self, value: T) -> &mut T {
        if self.active < self.chunks.len() && self.chunks[self.active].len() == N {
            self.active += 1;
        }
        if self.active == self.chunks.len() {
            self.chunks.push(Vec::with_capacity(N));
            self.allocations += 1;
        }
        let chunk = &mut self.chunks[self.active];
        chunk.push(value);
        self.len += 1;
        let last = chunk.len() - 1;
        &mut chunk[last]
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }
        self.chunks.get(index / N)?.get(index % N)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if index >= self.len {
            return None;
        }
        self.chunks.get_mut(index / N)?.get_mut(index % N)
    }

    pub fn back(&self) -> Option<&T> {
        self.len.checked_sub(1).and_then(|i| self.get(i))
    }

    pub fn back_mut(&mut self) -> Option<&mut T> {
        let last = self.len.checked_sub(1)?;
        self.get_mut(last)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Elements in allocation order.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.chunks.iter().flat_map(|chunk| chunk.iter())
    }

    /// Drop every element. With `preserve_content` the chunks stay allocated
    /// and are refilled from the first one; otherwise they are released.
    pub fn clear(&mut self, preserve_content: bool) {
        if preserve_content {
            for chunk in &mut self.chunks {
                chunk.clear();
            }
        } else {
            self.chunks = Vec::new();
        }
        self.active = 0;
        self.len = 0;
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn allocations(&self) -> usize {
        self.allocations
    }
}

impl<T: Clone, const N: usize> ChunkedBuffer<T, N> {
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}
