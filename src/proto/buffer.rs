//! Discontiguous byte buffers
//!
//! Every network read lands in its own `Bytes` allocation. A line or a
//! DATA block that spans several reads is represented as a chain of
//! segments over those allocations instead of being copied together.

use bytes::{Bytes, BytesMut};
use std::borrow::Cow;

/// A read-only chain of byte segments forming one logical buffer.
#[derive(Debug, Clone, Default)]
pub struct ByteBuffer {
    segments: Vec<Bytes>,
    len: usize,
}

impl ByteBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a buffer from a sequence of segments. Empty segments are dropped.
    pub fn from_segments<I>(segments: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
    {
        let mut buffer = Self::new();
        for segment in segments {
            buffer.push(segment);
        }
        buffer
    }

    /// Append a segment to the end of the chain
    pub fn push(&mut self, segment: Bytes) {
        if segment.is_empty() {
            return;
        }
        self.len += segment.len();
        self.segments.push(segment);
    }

    /// Total number of bytes across all segments
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The underlying segments, in order
    pub fn segments(&self) -> &[Bytes] {
        &self.segments
    }

    /// Byte at a logical index
    pub fn get(&self, mut index: usize) -> Option<u8> {
        for segment in &self.segments {
            if index < segment.len() {
                return Some(segment[index]);
            }
            index -= segment.len();
        }
        None
    }

    /// Iterate over every byte in order
    pub fn bytes(&self) -> impl Iterator<Item = u8> + '_ {
        self.segments.iter().flat_map(|s| s.iter().copied())
    }

    /// Locate the first occurrence of `needle`, which may straddle segments.
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() {
            return Some(0);
        }
        let last_start = self.len.checked_sub(needle.len())?;
        (0..=last_start).find(|&start| {
            needle
                .iter()
                .enumerate()
                .all(|(i, b)| self.get(start + i) == Some(*b))
        })
    }

    /// Shorten the buffer to `len` bytes, dropping or slicing trailing segments.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.len {
            return;
        }
        let mut excess = self.len - len;
        while excess > 0 {
            let Some(last) = self.segments.last_mut() else {
                break;
            };
            if last.len() <= excess {
                excess -= last.len();
                self.segments.pop();
            } else {
                last.truncate(last.len() - excess);
                excess = 0;
            }
        }
        self.len = len;
    }

    /// View the buffer as one contiguous slice, copying only if it spans segments.
    pub fn to_contiguous(&self) -> Cow<'_, [u8]> {
        match self.segments.as_slice() {
            [] => Cow::Borrowed(&[]),
            [single] => Cow::Borrowed(&single[..]),
            segments => {
                let mut out = Vec::with_capacity(self.len);
                for segment in segments {
                    out.extend_from_slice(segment);
                }
                Cow::Owned(out)
            }
        }
    }

    /// Collapse into a single `Bytes`. Free for single-segment buffers.
    pub fn freeze(&self) -> Bytes {
        match self.segments.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            segments => {
                let mut out = BytesMut::with_capacity(self.len);
                for segment in segments {
                    out.extend_from_slice(segment);
                }
                out.freeze()
            }
        }
    }
}

impl PartialEq for ByteBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.bytes().eq(other.bytes())
    }
}

impl Eq for ByteBuffer {}

impl From<&'static [u8]> for ByteBuffer {
    fn from(value: &'static [u8]) -> Self {
        Self::from_segments([Bytes::from_static(value)])
    }
}

impl From<Vec<u8>> for ByteBuffer {
    fn from(value: Vec<u8>) -> Self {
        Self::from_segments([Bytes::from(value)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunked(parts: &[&'static [u8]]) -> ByteBuffer {
        ByteBuffer::from_segments(parts.iter().map(|p| Bytes::from_static(p)))
    }

    #[test]
    fn test_len_and_get_across_segments() {
        let buffer = chunked(&[b"ab", b"", b"cde"]);
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.segments().len(), 2);
        assert_eq!(buffer.get(0), Some(b'a'));
        assert_eq!(buffer.get(2), Some(b'c'));
        assert_eq!(buffer.get(4), Some(b'e'));
        assert_eq!(buffer.get(5), None);
    }

    #[test]
    fn test_find_straddling_boundary() {
        let buffer = chunked(&[b"abc\r", b"\n.", b"\r\nxyz"]);
        assert_eq!(buffer.find(b"\r\n.\r\n"), Some(3));
        assert_eq!(buffer.find(b"xyz"), Some(8));
        assert_eq!(buffer.find(b"zz"), None);
    }

    #[test]
    fn test_truncate_drops_and_slices() {
        let mut buffer = chunked(&[b"hello", b" ", b"world\r\n"]);
        buffer.truncate(buffer.len() - 2);
        assert_eq!(&buffer.to_contiguous()[..], b"hello world");

        buffer.truncate(3);
        assert_eq!(buffer.segments().len(), 1);
        assert_eq!(&buffer.freeze()[..], b"hel");
    }

    #[test]
    fn test_equality_ignores_segmentation() {
        assert_eq!(chunked(&[b"ab", b"cd"]), chunked(&[b"a", b"bcd"]));
        assert_ne!(chunked(&[b"ab"]), chunked(&[b"abc"]));
    }
}
