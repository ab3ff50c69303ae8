//! Growable byte buffer with little-endian accessors.
//!
//! Writers append at the tail, readers consume from the head. Reads never
//! fail individually: the first short read records
//! [`FrameError::UnexpectedEof`] and every later read returns a zero value,
//! so a whole record can be decoded and checked once with [`Buffer::check`].

use std::io;

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::FrameError;

/// Capacity of a freshly constructed buffer.
pub const BOOTSTRAP_CAPACITY: usize = 128;

/// Capacity above which growth switches from doubling to linear steps.
pub const GROWTH_THRESHOLD: usize = 2 << 20;

/// Capacity to grow to so that `need` bytes fit, starting from `cap`.
fn grown_capacity(cap: usize, need: usize) -> usize {
    let mut target = cap.max(BOOTSTRAP_CAPACITY);
    while target < need {
        target = if target < GROWTH_THRESHOLD {
            target * 2
        } else {
            target + GROWTH_THRESHOLD
        };
    }
    target
}

#[derive(Debug, Default)]
pub struct Buffer {
    data: BytesMut,
    err: Option<FrameError>,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(BOOTSTRAP_CAPACITY)
    }

    pub fn with_capacity(cap: usize) -> Buffer {
        Buffer {
            data: BytesMut::with_capacity(cap),
            err: None,
        }
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Drop all content and forget any recorded error.
    pub fn clear(&mut self) {
        self.data.clear();
        self.err = None;
    }

    /// The sticky read error, if any.
    pub fn error(&self) -> Option<FrameError> {
        self.err
    }

    pub fn check(&self) -> Result<(), FrameError> {
        match self.err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Record `err` unless an earlier error is already recorded.
    pub fn fail(&mut self, err: FrameError) {
        self.err.get_or_insert(err);
    }

    /// Take the unread content, leaving the buffer empty.
    pub fn split(&mut self) -> Bytes {
        self.data.split().freeze()
    }

    fn reserve(&mut self, additional: usize) {
        let need = self.data.len() + additional;
        if need <= self.data.capacity() {
            return;
        }
        let target = grown_capacity(self.data.capacity(), need);
        self.data.reserve(target - self.data.len());
    }

    pub fn put_u8(&mut self, v: u8) {
        self.reserve(1);
        self.data.extend_from_slice(&[v]);
    }

    pub fn put_u16(&mut self, v: u16) {
        let mut b = [0; 2];
        LittleEndian::write_u16(&mut b, v);
        self.put_bytes(&b);
    }

    pub fn put_u32(&mut self, v: u32) {
        let mut b = [0; 4];
        LittleEndian::write_u32(&mut b, v);
        self.put_bytes(&b);
    }

    pub fn put_u64(&mut self, v: u64) {
        let mut b = [0; 8];
        LittleEndian::write_u64(&mut b, v);
        self.put_bytes(&b);
    }

    pub fn put_bytes(&mut self, b: &[u8]) {
        self.reserve(b.len());
        self.data.extend_from_slice(b);
    }

    /// Write a counted string `[len:u16][bytes]`.
    ///
    /// Strings longer than 65535 bytes are cut at the last character
    /// boundary that fits.
    pub fn put_str(&mut self, s: &str) {
        let mut len = s.len().min(u16::MAX as usize);
        while !s.is_char_boundary(len) {
            len -= 1;
        }
        self.put_u16(len as u16);
        self.put_bytes(&s.as_bytes()[..len]);
    }

    fn ensure(&mut self, n: usize) -> bool {
        if self.err.is_some() {
            return false;
        }
        if self.data.len() < n {
            self.err = Some(FrameError::UnexpectedEof);
            return false;
        }
        true
    }

    pub fn get_u8(&mut self) -> u8 {
        if !self.ensure(1) {
            return 0;
        }
        self.data.get_u8()
    }

    pub fn get_u16(&mut self) -> u16 {
        if !self.ensure(2) {
            return 0;
        }
        let v = LittleEndian::read_u16(&self.data[..2]);
        self.data.advance(2);
        v
    }

    pub fn get_u32(&mut self) -> u32 {
        if !self.ensure(4) {
            return 0;
        }
        let v = LittleEndian::read_u32(&self.data[..4]);
        self.data.advance(4);
        v
    }

    pub fn get_u64(&mut self) -> u64 {
        if !self.ensure(8) {
            return 0;
        }
        let v = LittleEndian::read_u64(&self.data[..8]);
        self.data.advance(8);
        v
    }

    /// Take `n` bytes without copying them.
    pub fn get_bytes(&mut self, n: usize) -> Bytes {
        if !self.ensure(n) {
            return Bytes::new();
        }
        self.data.split_to(n).freeze()
    }

    /// Read a counted string. Invalid UTF-8 records [`FrameError::InvalidUtf8`].
    pub fn get_str(&mut self) -> String {
        let len = self.get_u16() as usize;
        if !self.ensure(len) {
            return String::new();
        }
        let s = match std::str::from_utf8(&self.data[..len]) {
            Ok(s) => s.to_owned(),
            Err(_) => {
                self.err = Some(FrameError::InvalidUtf8);
                String::new()
            }
        };
        self.data.advance(len);
        s
    }

    /// Append exactly `n` bytes read from `r`.
    pub async fn read_exact<R>(&mut self, r: &mut R, n: usize) -> io::Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.reserve(n);
        let target = self.data.len() + n;
        let mut limited = r.take(n as u64);
        while self.data.len() < target {
            if limited.read_buf(&mut self.data).await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
        Ok(())
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<&[u8]> for Buffer {
    fn from(b: &[u8]) -> Buffer {
        let mut buf = Buffer::with_capacity(b.len());
        buf.put_bytes(b);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_doubles_then_steps_linearly() {
        assert_eq!(grown_capacity(0, 1), BOOTSTRAP_CAPACITY);
        assert_eq!(grown_capacity(128, 129), 256);
        assert_eq!(grown_capacity(128, 1000), 1024);
        assert_eq!(
            grown_capacity(GROWTH_THRESHOLD, GROWTH_THRESHOLD + 1),
            2 * GROWTH_THRESHOLD
        );
        assert_eq!(
            grown_capacity(2 * GROWTH_THRESHOLD, 2 * GROWTH_THRESHOLD + 1),
            3 * GROWTH_THRESHOLD
        );
    }

    #[test]
    fn integers_are_little_endian() {
        let mut buf = Buffer::new();
        buf.put_u8(0x01);
        buf.put_u16(0x0302);
        buf.put_u32(0x07060504);
        buf.put_u64(0x0f0e0d0c0b0a0908);
        let expected: Vec<u8> = (1..16).collect();
        assert_eq!(buf.as_ref(), &expected[..]);

        assert_eq!(buf.get_u8(), 0x01);
        assert_eq!(buf.get_u16(), 0x0302);
        assert_eq!(buf.get_u32(), 0x07060504);
        assert_eq!(buf.get_u64(), 0x0f0e0d0c0b0a0908);
        assert!(buf.is_empty());
        assert_eq!(buf.check(), Ok(()));
    }

    #[test]
    fn short_read_is_sticky() {
        let mut buf = Buffer::from(&[1u8, 2, 3][..]);
        assert_eq!(buf.get_u32(), 0);
        assert_eq!(buf.error(), Some(FrameError::UnexpectedEof));
        // the bytes are still there but reads keep failing
        assert_eq!(buf.get_u8(), 0);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn counted_strings() {
        let mut buf = Buffer::new();
        buf.put_str("hello");
        assert_eq!(buf.as_ref(), b"\x05\x00hello");
        assert_eq!(buf.get_str(), "hello");

        let max = "x".repeat(u16::MAX as usize);
        buf.put_str(&max);
        assert_eq!(buf.len(), 2 + u16::MAX as usize);
        assert_eq!(buf.get_str(), max);

        let over = "y".repeat(u16::MAX as usize + 1);
        buf.put_str(&over);
        assert_eq!(buf.get_str().len(), u16::MAX as usize);
        assert!(buf.is_empty());
    }

    #[test]
    fn truncation_keeps_utf8_valid() {
        let mut s = "a".repeat(u16::MAX as usize - 1);
        s.push('é');
        let mut buf = Buffer::new();
        buf.put_str(&s);
        let back = buf.get_str();
        assert_eq!(back.len(), u16::MAX as usize - 1);
        assert_eq!(buf.check(), Ok(()));
    }

    #[test]
    fn invalid_utf8_is_reported() {
        let mut buf = Buffer::from(&[2u8, 0, 0xff, 0xfe][..]);
        assert_eq!(buf.get_str(), "");
        assert_eq!(buf.error(), Some(FrameError::InvalidUtf8));
    }

    #[test]
    fn get_bytes_splits_without_copy() {
        let mut buf = Buffer::from(&b"abcdef"[..]);
        let head = buf.get_bytes(4);
        assert_eq!(&head[..], b"abcd");
        assert_eq!(buf.as_ref(), b"ef");
    }

    #[tokio::test]
    async fn read_exact_appends() {
        let mut src: &[u8] = b"0123456789";
        let mut buf = Buffer::new();
        buf.read_exact(&mut src, 4).await.unwrap();
        assert_eq!(buf.as_ref(), b"0123");
        assert_eq!(src, b"456789");

        let err = buf.read_exact(&mut src, 7).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
