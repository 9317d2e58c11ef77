//! Segment mapping for guest requests
//!
//! The transport caps the size of one submission. A guest request larger
//! than the cap is split into consecutive segments; the request completes
//! when the last of them calls back.
//!
//! ```text
//! write(offset = 0, len = 2.5 MiB), max_io_size = 1 MiB
//! ├── segment 0: disk 0       .. 1 MiB    request bytes 0       .. 1 MiB
//! ├── segment 1: disk 1 MiB   .. 2 MiB    request bytes 1 MiB   .. 2 MiB
//! └── segment 2: disk 2 MiB   .. 2.5 MiB  request bytes 2 MiB   .. 2.5 MiB
//! ```

use crate::SECTOR_SIZE;

/// One transport submission of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Position within the request
    pub index: usize,
    /// Byte offset on the vdisk
    pub disk_offset: u64,
    /// Byte offset within the request buffer
    pub start: usize,
    /// Number of bytes
    pub len: usize,
}

impl Segment {
    /// Range of the request buffer this segment covers
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.start + self.len
    }
}

/// Splits requests into segments no larger than `max_io_size`
#[derive(Debug, Clone)]
pub struct SegmentMapper {
    max_io_size: usize,
}

impl Default for SegmentMapper {
    fn default() -> Self {
        Self::new(crate::DEFAULT_MAX_IO_SIZE)
    }
}

impl SegmentMapper {
    /// Create a mapper; sizes below one sector are raised to a sector
    pub fn new(max_io_size: usize) -> Self {
        Self {
            max_io_size: max_io_size.max(SECTOR_SIZE),
        }
    }

    pub fn max_io_size(&self) -> usize {
        self.max_io_size
    }

    /// Number of segments a request of `length` bytes needs
    pub fn segment_count(&self, length: usize) -> usize {
        length.div_ceil(self.max_io_size)
    }

    /// End of `[offset, offset + length)`, or `None` if it does not fit in
    /// the vdisk address space
    pub fn end_offset(offset: u64, length: usize) -> Option<u64> {
        offset.checked_add(u64::try_from(length).ok()?)
    }

    /// Split `[offset, offset + length)` into segments. Segments that would
    /// start past `u64::MAX` are not produced; callers reject such ranges
    /// with [`end_offset`](Self::end_offset) first.
    pub fn split(&self, offset: u64, length: usize) -> Vec<Segment> {
        let mut segments = Vec::with_capacity(self.segment_count(length));
        let mut start = 0;

        while start < length {
            let Some(disk_offset) = offset.checked_add(start as u64) else {
                break;
            };
            let len = self.max_io_size.min(length - start);
            segments.push(Segment {
                index: segments.len(),
                disk_offset,
                start,
                len,
            });
            start += len;
        }

        segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1024 * 1024;

    #[test]
    fn test_single_segment() {
        let mapper = SegmentMapper::new(MIB);
        let segments = mapper.split(4096, 4096);
        assert_eq!(
            segments,
            vec![Segment {
                index: 0,
                disk_offset: 4096,
                start: 0,
                len: 4096,
            }]
        );
    }

    #[test]
    fn test_exact_multiple() {
        let mapper = SegmentMapper::new(MIB);
        let segments = mapper.split(0, 2 * MIB);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].disk_offset, MIB as u64);
        assert_eq!(segments[1].range(), MIB..2 * MIB);
    }

    #[test]
    fn test_trailing_partial_segment() {
        let mapper = SegmentMapper::new(MIB);
        let segments = mapper.split(512, 2 * MIB + 1024);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[2].disk_offset, 512 + 2 * MIB as u64);
        assert_eq!(segments[2].len, 1024);
        assert_eq!(mapper.segment_count(2 * MIB + 1024), 3);
    }

    #[test]
    fn test_empty_request() {
        let mapper = SegmentMapper::default();
        assert!(mapper.split(1000, 0).is_empty());
        assert_eq!(mapper.segment_count(0), 0);
    }

    #[test]
    fn test_range_past_end_of_address_space() {
        assert_eq!(SegmentMapper::end_offset(4096, 512), Some(4608));
        assert_eq!(SegmentMapper::end_offset(u64::MAX - 512, 512), Some(u64::MAX));
        assert_eq!(SegmentMapper::end_offset(u64::MAX - 4096, 2 * MIB), None);

        let mapper = SegmentMapper::new(MIB);
        let segments = mapper.split(u64::MAX - 4096, 2 * MIB);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].disk_offset, u64::MAX - 4096);
    }

    #[test]
    fn test_tiny_cap_raised_to_sector() {
        let mapper = SegmentMapper::new(0);
        assert_eq!(mapper.max_io_size(), SECTOR_SIZE);
    }
}
