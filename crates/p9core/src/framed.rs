//! Framed message encoder and decoder over async byte streams.
//!
//! A frame is `size[4] type[1] tag[2] body[size-7]`. The decoder validates
//! every header against the message catalog and the negotiated msize before
//! reading the body; the encoder writes payload-bearing bodies without copying
//! the payload.

use std::io;

use byteorder::{ByteOrder, LittleEndian};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

use crate::buffer::Buffer;
use crate::error::{Error, FrameError};
use crate::fcall::*;
use crate::serialize::{decode_body, Header};
use crate::utils::Result;

fn check_msize(msize: u32) -> Result<()> {
    if !(MIN_MSIZE..=MAX_MSIZE).contains(&msize) {
        return res!(io_err!(
            InvalidInput,
            format!("msize {} outside [{}, {}]", msize, MIN_MSIZE, MAX_MSIZE)
        ));
    }
    Ok(())
}

/// Reads frames from `R`.
pub struct MsgDecoder<R> {
    reader: R,
    dialect: Dialect,
    msize: u32,
    buf: Buffer,
}

impl<R: AsyncRead + Unpin> MsgDecoder<R> {
    pub fn new(reader: R) -> MsgDecoder<R> {
        MsgDecoder {
            reader,
            dialect: Dialect::P92000L,
            msize: MAX_MSIZE,
            buf: Buffer::new(),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn set_dialect(&mut self, dialect: Dialect) {
        self.dialect = dialect;
    }

    pub fn msize(&self) -> u32 {
        self.msize
    }

    /// Frames larger than `msize` are rejected from now on.
    pub fn set_msize(&mut self, msize: u32) -> Result<()> {
        check_msize(msize)?;
        self.msize = msize;
        Ok(())
    }

    /// Read the next frame header.
    ///
    /// Returns `None` when the stream ends cleanly on a frame boundary.
    pub async fn read_header(&mut self) -> Result<Option<Header>> {
        let mut raw = [0u8; HEADER_SIZE as usize];
        let mut got = 0;
        while got < raw.len() {
            let n = self.reader.read(&mut raw[got..]).await?;
            if n == 0 {
                if got == 0 {
                    return Ok(None);
                }
                return res!(Error::UnexpectedEof);
            }
            got += n;
        }

        Ok(Some(Header {
            size: LittleEndian::read_u32(&raw[0..4]),
            typ: raw[4],
            tag: LittleEndian::read_u16(&raw[5..7]),
        }))
    }

    /// Validate `header` and read the body that follows it.
    ///
    /// On a validation failure the body is skipped so that the stream stays
    /// on a frame boundary, except for frames that are too large or shorter
    /// than a header, after which the stream is unusable.
    pub async fn read_body(&mut self, header: &Header) -> Result<Msg> {
        let entry = match header.validate(self.dialect, self.msize) {
            Ok(entry) => entry,
            Err(e) => {
                if e.is_recoverable() {
                    self.discard(header.body_len() as u64).await?;
                }
                return res!(e);
            }
        };

        self.buf.clear();
        self.buf
            .read_exact(&mut self.reader, header.body_len() as usize)
            .await
            .map_err(eof_to_frame)?;
        let body = decode_body(entry, &mut self.buf)?;
        Ok(Msg {
            tag: header.tag,
            body,
        })
    }

    /// Read one complete message. `None` on clean end of stream.
    pub async fn read_msg(&mut self) -> Result<Option<Msg>> {
        match self.read_header().await? {
            Some(header) => self.read_body(&header).await.map(Some),
            None => Ok(None),
        }
    }

    async fn discard(&mut self, n: u64) -> Result<()> {
        let skipped = tokio::io::copy(&mut (&mut self.reader).take(n), &mut tokio::io::sink()).await?;
        if skipped < n {
            return res!(Error::UnexpectedEof);
        }
        Ok(())
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

fn eof_to_frame(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::UnexpectedEof
    } else {
        Error::Io(e)
    }
}

/// Writes frames to `W`.
///
/// The first write error is remembered and every later call fails with it.
pub struct MsgEncoder<W> {
    writer: BufWriter<W>,
    msize: u32,
    buf: Buffer,
    err: Option<io::ErrorKind>,
}

impl<W: AsyncWrite + Unpin> MsgEncoder<W> {
    pub fn new(writer: W) -> MsgEncoder<W> {
        MsgEncoder {
            writer: BufWriter::new(writer),
            msize: MAX_MSIZE,
            buf: Buffer::new(),
            err: None,
        }
    }

    pub fn msize(&self) -> u32 {
        self.msize
    }

    pub fn set_msize(&mut self, msize: u32) -> Result<()> {
        check_msize(msize)?;
        self.msize = msize;
        Ok(())
    }

    fn sticky(&self) -> Result<()> {
        match self.err {
            Some(kind) => res!(io::Error::new(kind, "encoder failed earlier")),
            None => Ok(()),
        }
    }

    fn record<T>(&mut self, r: io::Result<T>) -> Result<T> {
        r.map_err(|e| {
            self.err = Some(e.kind());
            Error::Io(e)
        })
    }

    /// Frame `msg` into the write buffer. Call [`flush`](Self::flush) to send.
    ///
    /// A message exceeding msize is refused before anything is written.
    pub async fn encode(&mut self, msg: &Msg) -> Result<()> {
        self.sticky()?;

        self.buf.clear();
        let payload = msg.body.encode_body(&mut self.buf);
        self.buf.check()?;
        let size = HEADER_SIZE as u64
            + self.buf.len() as u64
            + payload.map_or(0, |p| p.len() as u64);
        if size > u32::MAX as u64 {
            return res!(FrameError::DataTooLarge);
        }
        if size > self.msize as u64 {
            return res!(FrameError::MessageTooLarge {
                size,
                max: self.msize,
            });
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        LittleEndian::write_u32(&mut header[0..4], size as u32);
        header[4] = msg.body.msg_type() as u8;
        LittleEndian::write_u16(&mut header[5..7], msg.tag);

        let r = self.writer.write_all(&header).await;
        self.record(r)?;
        let r = self.writer.write_all(self.buf.as_ref()).await;
        self.record(r)?;
        if let Some(payload) = payload {
            let r = self.writer.write_all(payload).await;
            self.record(r)?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.sticky()?;
        let r = self.writer.flush().await;
        self.record(r)
    }

    /// Encode and flush in one go.
    pub async fn write_msg(&mut self, msg: &Msg) -> Result<()> {
        self.encode(msg).await?;
        self.flush().await
    }

    /// Flush and shut down the write half.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.sticky()?;
        let r = self.writer.shutdown().await;
        self.record(r)
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::write_msg;

    fn clunk(tag: u16, fid: u32) -> Msg {
        Msg {
            tag,
            body: Fcall::Tclunk(Tclunk { fid }),
        }
    }

    #[tokio::test]
    async fn encoder_and_decoder_agree() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let mut enc = MsgEncoder::new(a);
        let mut dec = MsgDecoder::new(b);

        let write = Msg {
            tag: 3,
            body: Fcall::Twrite(Twrite {
                fid: 2,
                offset: 9,
                data: Data::from(vec![7u8; 1000]),
            }),
        };
        enc.write_msg(&write).await.unwrap();
        enc.write_msg(&clunk(4, 2)).await.unwrap();

        assert_eq!(dec.read_msg().await.unwrap(), Some(write));
        assert_eq!(dec.read_msg().await.unwrap(), Some(clunk(4, 2)));
        drop(enc);
        assert_eq!(dec.read_msg().await.unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_type_is_skipped() {
        let mut bytes = vec![11, 0, 0, 0, 106, 1, 0, 0xaa, 0xbb, 0xcc, 0xdd];
        bytes.extend(write_msg(&clunk(2, 5)).unwrap());
        let mut dec = MsgDecoder::new(&bytes[..]);

        let header = dec.read_header().await.unwrap().unwrap();
        match dec.read_body(&header).await {
            Err(Error::Frame(FrameError::InvalidMessageType(106))) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(dec.read_msg().await.unwrap(), Some(clunk(2, 5)));
    }

    #[tokio::test]
    async fn short_frame_is_skipped() {
        // Tclunk needs 11 bytes, this one claims 9
        let mut bytes = vec![9, 0, 0, 0, 120, 1, 0, 0, 0];
        bytes.extend(write_msg(&clunk(2, 5)).unwrap());
        let mut dec = MsgDecoder::new(&bytes[..]);

        match dec.read_msg().await {
            Err(Error::Frame(FrameError::MessageTooSmall { size: 9, min: 11 })) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(dec.read_msg().await.unwrap(), Some(clunk(2, 5)));
    }

    #[tokio::test]
    async fn msize_bounds_frames() {
        let mut frame = write_msg(&Msg {
            tag: 1,
            body: Fcall::Rread(Rread {
                data: Data::from(vec![0u8; MIN_MSIZE as usize - 11]),
            }),
        })
        .unwrap();
        assert_eq!(frame.len(), MIN_MSIZE as usize);

        let mut dec = MsgDecoder::new(&frame[..]);
        dec.set_msize(MIN_MSIZE).unwrap();
        assert!(dec.read_msg().await.unwrap().is_some());

        frame.push(0);
        LittleEndian::write_u32(&mut frame[0..4], MIN_MSIZE + 1);
        let mut dec = MsgDecoder::new(&frame[..]);
        dec.set_msize(MIN_MSIZE).unwrap();
        match dec.read_msg().await {
            Err(Error::Frame(FrameError::MessageTooLarge { size, max })) => {
                assert_eq!(size, MIN_MSIZE as u64 + 1);
                assert_eq!(max, MIN_MSIZE);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn truncated_stream() {
        let frame = write_msg(&clunk(1, 1)).unwrap();
        let mut dec = MsgDecoder::new(&frame[..3]);
        assert!(matches!(dec.read_msg().await, Err(Error::UnexpectedEof)));

        let mut dec = MsgDecoder::new(&frame[..9]);
        assert!(matches!(dec.read_msg().await, Err(Error::UnexpectedEof)));
    }

    #[tokio::test]
    async fn encoder_refuses_oversized() {
        let mut enc = MsgEncoder::new(Vec::new());
        enc.set_msize(MIN_MSIZE).unwrap();
        let big = Msg {
            tag: 1,
            body: Fcall::Rread(Rread {
                data: Data::from(vec![0u8; MIN_MSIZE as usize]),
            }),
        };
        assert!(matches!(
            enc.write_msg(&big).await,
            Err(Error::Frame(FrameError::MessageTooLarge { .. }))
        ));
        // nothing was written and the encoder still works
        enc.write_msg(&clunk(1, 1)).await.unwrap();
        assert_eq!(enc.into_inner(), write_msg(&clunk(1, 1)).unwrap());
    }

    #[test]
    fn msize_range() {
        let mut enc = MsgEncoder::new(Vec::new());
        assert!(enc.set_msize(MIN_MSIZE - 1).is_err());
        assert!(enc.set_msize(MAX_MSIZE + 1).is_err());
        assert!(enc.set_msize(8192).is_ok());
        assert_eq!(enc.msize(), 8192);
    }

    #[tokio::test]
    async fn write_errors_are_sticky() {
        let (a, b) = tokio::io::duplex(64);
        drop(b);
        let mut enc = MsgEncoder::new(a);
        assert!(enc.write_msg(&clunk(1, 1)).await.is_err());
        match enc.write_msg(&clunk(2, 1)).await {
            Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected {:?}", other),
        }
    }
}
