//! Serialize/deserialize 9P messages into/from binary.
//!
//! Encoding and decoding go through a [`Buffer`], whose error is sticky: a
//! record is decoded field by field and checked once at the end.

use bytes::Bytes;

use crate::buffer::Buffer;
use crate::error::FrameError;
use crate::fcall::*;

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Append the wire form of `self` to `buf`
    fn encode(&self, buf: &mut Buffer);
}

/// Trait representing a type which can be deserialized from binary
///
/// A short or malformed input is recorded in the buffer and a zero value is
/// returned; callers check [`Buffer::check`] after the whole record.
pub trait Decodable: Sized {
    fn decode(buf: &mut Buffer) -> Self;
}

macro_rules! primitive {
    ($($typ:ty => $put:ident, $get:ident;)*) => {
        $(
            impl Encodable for $typ {
                fn encode(&self, buf: &mut Buffer) {
                    buf.$put(*self)
                }
            }

            impl Decodable for $typ {
                fn decode(buf: &mut Buffer) -> Self {
                    buf.$get()
                }
            }
        )*
    };
}

primitive! {
    u8 => put_u8, get_u8;
    u16 => put_u16, get_u16;
    u32 => put_u32, get_u32;
    u64 => put_u64, get_u64;
}

macro_rules! flags {
    ($($typ:ty: $bits:ty;)*) => {
        $(
            impl Encodable for $typ {
                fn encode(&self, buf: &mut Buffer) {
                    self.bits().encode(buf)
                }
            }

            impl Decodable for $typ {
                fn decode(buf: &mut Buffer) -> Self {
                    <$typ>::from_bits_retain(<$bits>::decode(buf))
                }
            }
        )*
    };
}

flags! {
    QidType: u8;
    LockType: u8;
    LockFlag: u32;
    LockStatus: u8;
    GetAttrMask: u64;
    SetAttrMask: u32;
}

/// Field-sequential wire form for records whose fields are all encodable.
macro_rules! record {
    ($($typ:ident { $($field:ident),* };)*) => {
        $(
            impl Encodable for $typ {
                #[allow(unused_variables)]
                fn encode(&self, buf: &mut Buffer) {
                    $(self.$field.encode(buf);)*
                }
            }

            impl Decodable for $typ {
                #[allow(unused_variables)]
                fn decode(buf: &mut Buffer) -> Self {
                    $typ {
                        $($field: Decodable::decode(buf),)*
                    }
                }
            }
        )*
    };
}

/// Records without a body.
macro_rules! unit {
    ($($typ:ident),* $(,)?) => {
        $(
            impl Encodable for $typ {
                fn encode(&self, _buf: &mut Buffer) {}
            }

            impl Decodable for $typ {
                fn decode(_buf: &mut Buffer) -> Self {
                    $typ
                }
            }
        )*
    };
}

impl Encodable for String {
    fn encode(&self, buf: &mut Buffer) {
        buf.put_str(self)
    }
}

impl Decodable for String {
    fn decode(buf: &mut Buffer) -> Self {
        buf.get_str()
    }
}

/// Walk names and qids: `[n:u16][n * T]`, never more than [`MAX_WALK_NAMES`].
impl<T: Encodable> Encodable for Vec<T> {
    fn encode(&self, buf: &mut Buffer) {
        let items = &self[..self.len().min(MAX_WALK_NAMES)];
        (items.len() as u16).encode(buf);
        for item in items {
            item.encode(buf);
        }
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode(buf: &mut Buffer) -> Self {
        let len = (u16::decode(buf) as usize).min(MAX_WALK_NAMES);
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(T::decode(buf));
        }
        items
    }
}

impl Encodable for Data {
    fn encode(&self, buf: &mut Buffer) {
        (self.0.len() as u32).encode(buf);
        buf.put_bytes(&self.0);
    }
}

impl Decodable for Data {
    fn decode(buf: &mut Buffer) -> Self {
        let len = u32::decode(buf) as usize;
        Data(buf.get_bytes(len))
    }
}

impl Encodable for p92000::Stat {
    fn encode(&self, buf: &mut Buffer) {
        let size = match u16::try_from(self.size()) {
            Ok(size) => size,
            Err(_) => return buf.fail(FrameError::DataTooLarge),
        };
        size.encode(buf);
        self.typ.encode(buf);
        self.dev.encode(buf);
        self.qid.encode(buf);
        self.mode.encode(buf);
        self.atime.encode(buf);
        self.mtime.encode(buf);
        self.length.encode(buf);
        self.name.encode(buf);
        self.uid.encode(buf);
        self.gid.encode(buf);
        self.muid.encode(buf);
    }
}

impl Decodable for p92000::Stat {
    fn decode(buf: &mut Buffer) -> Self {
        let _size = u16::decode(buf);
        p92000::Stat {
            typ: Decodable::decode(buf),
            dev: Decodable::decode(buf),
            qid: Decodable::decode(buf),
            mode: Decodable::decode(buf),
            atime: Decodable::decode(buf),
            mtime: Decodable::decode(buf),
            length: Decodable::decode(buf),
            name: Decodable::decode(buf),
            uid: Decodable::decode(buf),
            gid: Decodable::decode(buf),
            muid: Decodable::decode(buf),
        }
    }
}

// Rstat and Twstat wrap the stat record in one more length prefix.
fn encode_stat_n(stat: &p92000::Stat, buf: &mut Buffer) {
    match u16::try_from(stat.size() + 2) {
        Ok(n) => n.encode(buf),
        Err(_) => return buf.fail(FrameError::DataTooLarge),
    }
    stat.encode(buf);
}

fn decode_stat_n(buf: &mut Buffer) -> p92000::Stat {
    let _n = u16::decode(buf);
    p92000::Stat::decode(buf)
}

impl Encodable for Rstat {
    fn encode(&self, buf: &mut Buffer) {
        encode_stat_n(&self.stat, buf);
    }
}

impl Decodable for Rstat {
    fn decode(buf: &mut Buffer) -> Self {
        Rstat {
            stat: decode_stat_n(buf),
        }
    }
}

impl Encodable for Twstat {
    fn encode(&self, buf: &mut Buffer) {
        self.fid.encode(buf);
        encode_stat_n(&self.stat, buf);
    }
}

impl Decodable for Twstat {
    fn decode(buf: &mut Buffer) -> Self {
        Twstat {
            fid: Decodable::decode(buf),
            stat: decode_stat_n(buf),
        }
    }
}

record! {
    Qid { typ, version, path };
    StatFs { typ, bsize, blocks, bfree, bavail, files, ffree, fsid, namelen };
    Time { sec, nsec };
    Stat { mode, uid, gid, nlink, rdev, size, blksize, blocks, atime, mtime, ctime };
    SetAttr { mode, uid, gid, size, atime, mtime };
    DirEntry { qid, offset, typ, name };
    Flock { typ, flags, start, length, proc_id, client_id };
    Getlock { typ, start, length, proc_id, client_id };

    Tversion { msize, version };
    Rversion { msize, version };
    Tauth { afid, uname, aname };
    Tlauth { afid, uname, aname, n_uname };
    Rauth { aqid };
    Tattach { fid, afid, uname, aname };
    Tlattach { fid, afid, uname, aname, n_uname };
    Rattach { qid };
    Rerror { ename };
    Rlerror { ecode };
    Tflush { oldtag };
    Twalk { fid, newfid, wnames };
    Rwalk { wqids };
    Topen { fid, mode };
    Ropen { qid, iounit };
    Tcreate { fid, name, perm, mode };
    Rcreate { qid, iounit };
    Tread { fid, offset, count };
    Rread { data };
    Twrite { fid, offset, data };
    Rwrite { count };
    Tclunk { fid };
    Tremove { fid };
    Tstat { fid };
    Tstatfs { fid };
    Rstatfs { statfs };
    Tlopen { fid, flags };
    Rlopen { qid, iounit };
    Tlcreate { fid, name, flags, mode, gid };
    Rlcreate { qid, iounit };
    Tsymlink { fid, name, symtgt, gid };
    Rsymlink { qid };
    Tmknod { dfid, name, mode, major, minor, gid };
    Rmknod { qid };
    Trename { fid, dfid, name };
    Treadlink { fid };
    Rreadlink { target };
    Tgetattr { fid, req_mask };
    Rgetattr { valid, qid, stat, btime, r#gen, data_version };
    Tsetattr { fid, valid, stat };
    Txattrwalk { fid, newfid, name };
    Rxattrwalk { size };
    Txattrcreate { fid, name, attr_size, flags };
    Treaddir { fid, offset, count };
    Rreaddir { data };
    Tfsync { fid, datasync };
    Tlock { fid, flock };
    Rlock { status };
    Tgetlock { fid, flock };
    Rgetlock { flock };
    Tlink { dfid, fid, name };
    Tmkdir { dfid, name, mode, gid };
    Rmkdir { qid };
    Trenameat { olddirfid, oldname, newdirfid, newname };
    Tunlinkat { dirfd, name, flags };
}

unit!(
    Rflush, Rclunk, Rremove, Rwstat, Rrename, Rsetattr, Rxattrcreate, Rfsync, Rlink, Rrenameat,
    Runlinkat,
);

impl Fcall {
    /// Encode the body into `buf`.
    ///
    /// Rread, Twrite and Rreaddir only write their fixed prefix (ending with
    /// the payload count) and hand the payload back, so the caller can write
    /// it straight to the transport. A field that cannot be represented is
    /// recorded as an error on `buf`.
    pub fn encode_body(&self, buf: &mut Buffer) -> Option<&Bytes> {
        match *self {
            Fcall::Rread(ref m) => {
                (m.data.len() as u32).encode(buf);
                Some(&m.data.0)
            }
            Fcall::Twrite(ref m) => {
                m.fid.encode(buf);
                m.offset.encode(buf);
                (m.data.len() as u32).encode(buf);
                Some(&m.data.0)
            }
            Fcall::Rreaddir(ref m) => {
                (m.data.len() as u32).encode(buf);
                Some(&m.data.0)
            }
            _ => {
                self.encode_fields(buf);
                None
            }
        }
    }
}

/// Decoded frame header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub size: u32,
    pub typ: u8,
    pub tag: u16,
}

impl Header {
    pub fn decode(buf: &mut Buffer) -> Header {
        Header {
            size: Decodable::decode(buf),
            typ: Decodable::decode(buf),
            tag: Decodable::decode(buf),
        }
    }

    pub fn encode(&self, buf: &mut Buffer) {
        self.size.encode(buf);
        self.typ.encode(buf);
        self.tag.encode(buf);
    }

    /// Bytes following the header.
    pub fn body_len(&self) -> u32 {
        self.size.saturating_sub(HEADER_SIZE)
    }

    /// Check the header against the catalog and the negotiated limits.
    pub fn validate(&self, dialect: Dialect, msize: u32) -> Result<&'static Entry, FrameError> {
        if self.size < HEADER_SIZE {
            return Err(FrameError::MessageTooSmall {
                size: self.size,
                min: HEADER_SIZE,
            });
        }
        if self.size > msize {
            return Err(FrameError::MessageTooLarge {
                size: self.size as u64,
                max: msize,
            });
        }
        let entry = lookup(self.typ, dialect).ok_or(FrameError::InvalidMessageType(self.typ))?;
        if self.size < entry.min_size {
            return Err(FrameError::MessageTooSmall {
                size: self.size,
                min: entry.min_size,
            });
        }
        Ok(entry)
    }
}

/// Decode a body described by `entry`, reporting the first wire error.
pub fn decode_body(entry: &Entry, buf: &mut Buffer) -> Result<Fcall, FrameError> {
    let body = (entry.decode)(buf);
    buf.check()?;
    Ok(body)
}

impl DirEntryData {
    /// Pack entries into an Rreaddir payload of at most `count` bytes.
    ///
    /// Returns the payload and the number of entries that fit.
    pub fn to_data(&self, count: u32) -> (Data, usize) {
        let mut buf = Buffer::with_capacity(count.min(self.size()) as usize);
        let mut used = 0;
        let mut packed = 0;
        for entry in &self.data {
            let size = entry.size();
            if used + size > count {
                break;
            }
            entry.encode(&mut buf);
            used += size;
            packed += 1;
        }
        (Data(buf.split()), packed)
    }

    /// Parse an Rreaddir payload.
    pub fn from_data(data: &Data) -> Result<DirEntryData, FrameError> {
        let mut buf = Buffer::from(&data[..]);
        let mut entries = DirEntryData::new();
        while !buf.is_empty() {
            let entry = DirEntry::decode(&mut buf);
            buf.check()?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// Encode a whole frame into memory.
///
/// Frames larger than `u32::MAX`, or holding a field too long for its
/// length prefix, fail with [`FrameError::DataTooLarge`].
pub fn write_msg(msg: &Msg) -> Result<Vec<u8>, FrameError> {
    let mut body = Buffer::new();
    let payload = msg.body.encode_body(&mut body);
    body.check()?;
    let size = HEADER_SIZE as u64 + body.len() as u64 + payload.map_or(0, |p| p.len() as u64);
    if size > u32::MAX as u64 {
        return Err(FrameError::DataTooLarge);
    }

    let mut frame = Buffer::with_capacity(size as usize);
    Header {
        size: size as u32,
        typ: msg.body.msg_type() as u8,
        tag: msg.tag,
    }
    .encode(&mut frame);
    frame.put_bytes(body.as_ref());
    if let Some(payload) = payload {
        frame.put_bytes(payload);
    }
    Ok(frame.split().to_vec())
}

/// Decode one complete frame from memory.
pub fn read_msg(frame: &[u8], dialect: Dialect) -> Result<Msg, FrameError> {
    let mut buf = Buffer::from(frame);
    let header = Header::decode(&mut buf);
    buf.check()?;
    if header.size as usize != frame.len() {
        return Err(FrameError::UnexpectedEof);
    }
    let entry = header.validate(dialect, u32::MAX)?;
    let body = decode_body(entry, &mut buf)?;
    Ok(Msg {
        tag: header.tag,
        body,
    })
}
