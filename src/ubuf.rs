//! Buffer descriptor: block byte-stream view and picture plane-layout view (C4).

use crate::shared::SharedRegion;

#[derive(Clone)]
struct Segment {
    region: SharedRegion,
    offset: usize,
    size: usize,
}

/// A view over a logical byte stream, physically backed by one or more
/// shared regions. Most blocks are a single segment; [`Block::insert`]
/// produces a chain, used by the framer to splice a cached sequence header
/// in front of a picture.
#[derive(Clone)]
pub struct Block {
    segments: Vec<Segment>,
}

impl Block {
    pub fn from_region(region: SharedRegion, offset: usize, size: usize) -> Self {
        Self {
            segments: vec![Segment { region, offset, size }],
        }
    }

    pub fn size(&self) -> usize {
        self.segments.iter().map(|s| s.size).sum()
    }

    /// Shares the underlying region(s); cheap (bumps reference counts only).
    pub fn dup(&self) -> Self {
        self.clone()
    }

    /// (segment index, offset within that segment) for a logical `offset`.
    fn locate(&self, mut offset: usize) -> (usize, usize) {
        for (i, seg) in self.segments.iter().enumerate() {
            if offset < seg.size {
                return (i, offset);
            }
            offset -= seg.size;
        }
        (self.segments.len(), 0)
    }

    /// Splices `other`'s segments into this block at `offset`, without
    /// copying any bytes.
    pub fn insert(&mut self, offset: usize, other: Block) {
        let (idx, within) = self.locate(offset);
        if within == 0 {
            self.segments.splice(idx..idx, other.segments);
        } else {
            let seg = self.segments.remove(idx);
            let left = Segment {
                region: seg.region.clone(),
                offset: seg.offset,
                size: within,
            };
            let right = Segment {
                region: seg.region,
                offset: seg.offset + within,
                size: seg.size - within,
            };
            let mut spliced = Vec::with_capacity(other.segments.len() + 2);
            spliced.push(left);
            spliced.extend(other.segments);
            spliced.push(right);
            self.segments.splice(idx..idx + 1, spliced);
        }
    }

    /// Trims the view down to `[new_offset, new_offset + new_size)`, without
    /// copying bytes.
    pub fn resize(&mut self, new_offset: usize, new_size: usize) {
        let end = new_offset + new_size;
        let mut result = Vec::new();
        let mut pos = 0usize;
        for seg in &self.segments {
            let seg_start = pos;
            let seg_end = pos + seg.size;
            pos = seg_end;
            if seg_end <= new_offset || seg_start >= end {
                continue;
            }
            let start_in_seg = new_offset.saturating_sub(seg_start);
            let end_in_seg = (end - seg_start).min(seg.size);
            result.push(Segment {
                region: seg.region.clone(),
                offset: seg.offset + start_in_seg,
                size: end_in_seg - start_in_seg,
            });
        }
        self.segments = result;
    }

    /// Copies `size` bytes starting at `offset` into `out`. Returns `false`
    /// (without partially writing past what's available) if the range runs
    /// past the end of the block.
    pub fn extract(&self, offset: usize, size: usize, out: &mut [u8]) -> bool {
        if offset + size > self.size() || out.len() < size {
            return false;
        }
        let mut written = 0;
        let mut pos = 0;
        for seg in &self.segments {
            if written == size {
                break;
            }
            let seg_start = pos;
            let seg_end = pos + seg.size;
            pos = seg_end;
            if seg_end <= offset {
                continue;
            }
            let local_start = offset.max(seg_start) - seg_start;
            let local_len = (seg.size - local_start).min(size - written);
            let src = &seg.region.as_slice()[seg.offset + local_start..seg.offset + local_start + local_len];
            out[written..written + local_len].copy_from_slice(src);
            written += local_len;
        }
        written == size
    }

    /// Returns a direct slice into the backing region when the requested
    /// range lies in a single segment, otherwise copies into `scratch`.
    pub fn peek<'a>(&'a self, offset: usize, size: usize, scratch: &'a mut [u8]) -> Option<&'a [u8]> {
        let mut pos = 0;
        for seg in &self.segments {
            let seg_start = pos;
            let seg_end = pos + seg.size;
            pos = seg_end;
            if offset >= seg_start && offset + size <= seg_end {
                let local = offset - seg_start;
                return Some(&seg.region.as_slice()[seg.offset + local..seg.offset + local + size]);
            }
        }
        if self.extract(offset, size, scratch) {
            Some(&scratch[..size])
        } else {
            None
        }
    }

    /// Scans forward from `*offset` for `pattern`, leaving `*offset` at the
    /// first matching byte on success and unchanged on failure.
    pub fn find(&self, offset: &mut usize, pattern: &[u8]) -> bool {
        if pattern.is_empty() {
            return true;
        }
        let total = self.size();
        if pattern.len() > total {
            return false;
        }
        let mut scratch = vec![0u8; pattern.len()];
        let mut off = *offset;
        while off + pattern.len() <= total {
            if let Some(window) = self.peek(off, pattern.len(), &mut scratch) {
                if window == pattern {
                    *offset = off;
                    return true;
                }
            } else {
                break;
            }
            off += 1;
        }
        false
    }

    /// Byte-for-byte comparison against another block.
    pub fn compare(&self, other: &Block) -> bool {
        let len = self.size();
        if len != other.size() {
            return false;
        }
        let mut a = vec![0u8; len];
        let mut b = vec![0u8; len];
        self.extract(0, len, &mut a) && other.extract(0, len, &mut b) && a == b
    }

    /// Mutable access to `size` bytes at `offset`, provided they fall within
    /// a single segment; triggers copy-on-write if that segment's region is
    /// shared. Returns `None` if the range straddles a segment boundary.
    pub fn write_direct(&mut self, offset: usize, size: usize) -> Option<&mut [u8]> {
        let mut pos = 0;
        for seg in &mut self.segments {
            let seg_start = pos;
            let seg_end = pos + seg.size;
            pos = seg_end;
            if offset >= seg_start && offset + size <= seg_end {
                let local = offset - seg_start;
                let region = seg.region.make_mut();
                return Some(&mut region.as_mut_slice()[seg.offset + local..seg.offset + local + size]);
            }
        }
        None
    }
}

/// Per-plane physical layout of a picture buffer.
#[derive(Clone)]
pub struct PlaneDesc {
    pub chroma: String,
    pub hsub: u8,
    pub vsub: u8,
    pub macropixel_size: u8,
    pub offset: usize,
    pub stride: usize,
}

/// A picture buffer descriptor: a shared region plus a plane layout.
#[derive(Clone)]
pub struct Picture {
    pub region: SharedRegion,
    pub planes: Vec<PlaneDesc>,
}

impl Picture {
    pub fn new(region: SharedRegion, planes: Vec<PlaneDesc>) -> Self {
        Self { region, planes }
    }

    pub fn dup(&self) -> Self {
        self.clone()
    }

    pub fn plane(&self, chroma: &str) -> Option<&PlaneDesc> {
        self.planes.iter().find(|p| p.chroma == chroma)
    }
}

/// A buffer descriptor: either a byte-stream [`Block`] or a [`Picture`].
#[derive(Clone)]
pub enum Ubuf {
    Block(Block),
    Picture(Picture),
}

impl Ubuf {
    pub fn dup(&self) -> Self {
        match self {
            Ubuf::Block(b) => Ubuf::Block(b.dup()),
            Ubuf::Picture(p) => Ubuf::Picture(p.dup()),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Ubuf::Block(b) => b.size(),
            Ubuf::Picture(p) => p.region.size(),
        }
    }

    pub fn as_block(&self) -> Option<&Block> {
        match self {
            Ubuf::Block(b) => Some(b),
            Ubuf::Picture(_) => None,
        }
    }

    pub fn as_block_mut(&mut self) -> Option<&mut Block> {
        match self {
            Ubuf::Block(b) => Some(b),
            Ubuf::Picture(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_of(bytes: &[u8]) -> Block {
        let region = SharedRegion::from_umem({
            let mut u = crate::umem::Umem::alloc(bytes.len());
            u.as_mut_slice().copy_from_slice(bytes);
            u
        });
        Block::from_region(region, 0, bytes.len())
    }

    #[test]
    fn extract_and_compare() {
        let a = block_of(b"hello world");
        let b = block_of(b"hello world");
        let c = block_of(b"hello earth");
        assert!(a.compare(&b));
        assert!(!a.compare(&c));

        let mut buf = [0u8; 5];
        assert!(a.extract(6, 5, &mut buf));
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn find_scans_forward() {
        let block = block_of(&[0, 0, 1, 0xb3, 0, 0, 1, 0x00]);
        let mut offset = 0;
        assert!(block.find(&mut offset, &[0, 0, 1]));
        assert_eq!(offset, 0);
        offset += 3;
        assert!(block.find(&mut offset, &[0, 0, 1]));
        assert_eq!(offset, 4);
    }

    #[test]
    fn insert_prepends_chain() {
        let mut main = block_of(b"DEF");
        let header = block_of(b"ABC");
        main.insert(0, header);
        assert_eq!(main.size(), 6);
        let mut out = [0u8; 6];
        assert!(main.extract(0, 6, &mut out));
        assert_eq!(&out, b"ABCDEF");
    }

    #[test]
    fn insert_splits_segment_mid_way() {
        let mut main = block_of(b"ABCDEF");
        let patch = block_of(b"XY");
        main.insert(3, patch);
        let mut out = [0u8; 8];
        assert!(main.extract(0, 8, &mut out));
        assert_eq!(&out, b"ABCXYDEF");
    }

    #[test]
    fn resize_trims_chain() {
        let mut main = block_of(b"ABC");
        let tail = block_of(b"DEF");
        main.insert(3, tail);
        main.resize(2, 3);
        let mut out = [0u8; 3];
        assert!(main.extract(0, 3, &mut out));
        assert_eq!(&out, b"CDE");
    }
}
