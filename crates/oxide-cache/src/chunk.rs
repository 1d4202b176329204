//! Partitioning of an archive into contiguous byte ranges.

use std::sync::atomic::{AtomicU64, Ordering};

/// Inclusive byte range within the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// Number of bytes covered; always at least one.
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for an upload of unknown total size.
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/*", self.start, self.end)
    }

    /// `Range` request header value.
    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Plan for splitting `file_size` bytes into `chunk_size` pieces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    file_size: u64,
    chunk_size: u64,
    concurrency: usize,
}

/// Plan the transfer of a file.
pub fn plan(file_size: u64, chunk_size: u64, concurrency: usize) -> ChunkPlan {
    ChunkPlan {
        file_size,
        chunk_size: chunk_size.max(1),
        concurrency: concurrency.max(1),
    }
}

impl ChunkPlan {
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> u64 {
        self.file_size.div_ceil(self.chunk_size)
    }

    /// Workers worth spawning; never more than there are chunks.
    pub fn workers(&self) -> usize {
        let chunks = usize::try_from(self.chunk_count()).unwrap_or(usize::MAX);
        self.concurrency.min(chunks).max(1)
    }

    /// Shared claim cursor over this plan.
    pub fn cursor(&self) -> ChunkCursor {
        ChunkCursor::new(self.file_size, self.chunk_size)
    }

    /// Sequential view of the ranges.
    pub fn ranges(&self) -> ChunkRanges {
        ChunkRanges {
            cursor: self.cursor(),
        }
    }
}

impl IntoIterator for ChunkPlan {
    type Item = ChunkRange;
    type IntoIter = ChunkRanges;

    fn into_iter(self) -> ChunkRanges {
        self.ranges()
    }
}

/// Atomic offset cursor shared by transfer workers.
///
/// Each `claim` hands out the next unclaimed range exactly once.
#[derive(Debug)]
pub struct ChunkCursor {
    next: AtomicU64,
    file_size: u64,
    chunk_size: u64,
}

impl ChunkCursor {
    pub fn new(file_size: u64, chunk_size: u64) -> Self {
        Self {
            next: AtomicU64::new(0),
            file_size,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Claim the next range, or `None` once the file is exhausted.
    pub fn claim(&self) -> Option<ChunkRange> {
        let start = self.next.fetch_add(self.chunk_size, Ordering::Relaxed);
        if start >= self.file_size {
            return None;
        }
        let end = start
            .saturating_add(self.chunk_size - 1)
            .min(self.file_size - 1);
        Some(ChunkRange::new(start, end))
    }
}

/// Iterator over the ranges of a [`ChunkPlan`].
#[derive(Debug)]
pub struct ChunkRanges {
    cursor: ChunkCursor,
}

impl Iterator for ChunkRanges {
    type Item = ChunkRange;

    fn next(&mut self) -> Option<ChunkRange> {
        self.cursor.claim()
    }
}
