//! BuzHash rolling-hash chunking.
//!
//! Streams over 1 MiB are split at content-defined boundaries so that
//! insertions early in a stream do not shift every later block. A boundary
//! is declared where the low 20 bits of the rolling hash are zero and the
//! chunk has reached the floor size; a hard ceiling bounds the worst case.

/// Rolling-hash window in bytes.
pub const WINDOW_SIZE: usize = 64;

/// Streams at or below this length are stored as a single block.
pub const SINGLE_BLOCK_MAX: usize = 1024 * 1024;

/// Minimum chunk size before a hash boundary may fire.
pub const CHUNK_FLOOR: usize = 512 * 1024;

/// Hard ceiling on chunk size.
pub const CHUNK_CEILING: usize = 2 * 1024 * 1024;

/// Low 20 bits of the rolling hash must be zero at a boundary.
const BOUNDARY_MASK: u32 = (1 << 20) - 1;

/// A rolling hash over a fixed window of the most recent bytes.
pub struct BuzHash {
    hash: u32,
    window: [u8; WINDOW_SIZE],
    pos: usize,
    table: [u32; 256],
}

impl Default for BuzHash {
    fn default() -> Self {
        Self::new()
    }
}

impl BuzHash {
    /// Create a hash with an empty window.
    pub fn new() -> Self {
        let mut table = [0u32; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            *entry = (i as u32).wrapping_mul(0x5bd1_e995);
        }
        Self {
            hash: 0,
            window: [0u8; WINDOW_SIZE],
            pos: 0,
            table,
        }
    }

    /// Roll one byte in (and the oldest byte out) and return the updated
    /// hash. The window size is a multiple of 32, so the outgoing table
    /// entry needs no extra rotation.
    pub fn roll(&mut self, byte: u8) -> u32 {
        let outgoing = self.window[self.pos];
        self.window[self.pos] = byte;
        self.pos = (self.pos + 1) % WINDOW_SIZE;

        self.hash = self.hash.rotate_left(1) ^ self.table[outgoing as usize] ^ self.table[byte as usize];
        self.hash
    }

    /// Reset to the empty-window state.
    pub fn reset(&mut self) {
        self.hash = 0;
        self.window = [0u8; WINDOW_SIZE];
        self.pos = 0;
    }
}

/// Split `data` into chunk ranges. Boundaries are deterministic for a given
/// byte sequence; every chunk except possibly the last lands in
/// `[CHUNK_FLOOR, CHUNK_CEILING]`.
pub fn chunk_ranges(data: &[u8]) -> Vec<std::ops::Range<usize>> {
    let mut ranges = Vec::new();
    let mut hasher = BuzHash::new();
    let mut start = 0;

    for (i, byte) in data.iter().enumerate() {
        let hash = hasher.roll(*byte);
        let size = i - start + 1;

        let at_boundary = hash & BOUNDARY_MASK == 0 && size >= CHUNK_FLOOR;
        if at_boundary || size == CHUNK_CEILING || i == data.len() - 1 {
            ranges.push(start..i + 1);
            start = i + 1;
            hasher.reset();
        }
    }

    ranges
}
