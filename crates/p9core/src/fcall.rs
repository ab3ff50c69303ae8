//! 9P protocol data types, constants and the message catalog.
//!
//! # Protocol
//! 9P2000 and 9P2000.L

use std::fmt;

use bitflags::bitflags;
use enum_primitive::*;

use crate::buffer::Buffer;
use crate::error::Error;
use crate::serialize::{Decodable, Encodable};

/// 9P2000 version string
pub const P92000: &str = "9P2000";

/// 9P2000.L version string
pub const P92000L: &str = "9P2000.L";

/// The version string that comes with Rversion when the server does not understand
/// the client's version string
pub const VERSION_UNKNOWN: &str = "unknown";

/*
 * 9P magic numbers
 */
/// Special tag which `Tversion`/`Rversion` must use as `tag`
pub const NOTAG: u16 = !0;

/// Special value which `Tattach` with no auth must use as `afid`
///
/// If the client does not wish to authenticate the connection, or knows that authentication is
/// not required, the afid field in the attach message should be set to `NOFID`
pub const NOFID: u32 = !0;

/// Special uid which `Tlauth`/`Tlattach` use as `n_uname` to indicate no uid is specified
pub const NONUNAME: u32 = !0;

/// Ample room for `Twrite`/`Rread` header
///
/// size[4] Tread/Twrite[2] tag[2] fid[4] offset[8] count[4]
pub const IOHDRSZ: u32 = 24;

/// Room for readdir header
pub const READDIRHDRSZ: u32 = 24;

/// v9fs default port
pub const V9FS_PORT: u16 = 564;

/// size[4] type[1] tag[2]
pub const HEADER_SIZE: u32 = 7;

/// Maximum number of names in a Twalk and qids in an Rwalk
pub const MAX_WALK_NAMES: usize = 16;

/// Smallest msize a session accepts
pub const MIN_MSIZE: u32 = 4096;

/// Largest msize a session accepts
pub const MAX_MSIZE: u32 = 0x100000;

pub const DEFAULT_MSIZE: u32 = MAX_MSIZE;

/// Fixed part of a legacy stat record, not counting its leading size field
pub const FIXED_STAT_LEN: u32 = 47;

/// Fixed part of a Tread/Twrite frame: header, fid, offset and count
pub const FIXED_READ_WRITE_LEN: u32 = 23;

/// Protocol dialect negotiated by Tversion.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Dialect {
    P92000,
    P92000L,
}

impl Dialect {
    pub fn from_version(version: &str) -> Option<Dialect> {
        match version {
            P92000 => Some(Dialect::P92000),
            P92000L => Some(Dialect::P92000L),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match *self {
            Dialect::P92000 => P92000,
            Dialect::P92000L => P92000L,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Old 9P2000 protocol types
///
/// Types in this module are only used in 9P2000 sessions
pub mod p92000 {
    /// The type of I/O
    ///
    /// Open mode to be checked against the permissions for the file.
    pub mod om {
        /// Open for read
        pub const READ: u8 = 0;
        /// Write
        pub const WRITE: u8 = 1;
        /// Read and write
        pub const RDWR: u8 = 2;
        /// Execute, == read but check execute permission
        pub const EXEC: u8 = 3;
        /// Or'ed in (except for exec), truncate file first
        pub const TRUNC: u8 = 16;
        /// Or'ed in, close on exec
        pub const CEXEC: u8 = 32;
        /// Or'ed in, remove on close
        pub const RCLOSE: u8 = 64;
    }

    /// Bits in Stat.mode
    pub mod dm {
        /// Mode bit for directories
        pub const DIR: u32 = 0x80000000;
        /// Mode bit for append only files
        pub const APPEND: u32 = 0x40000000;
        /// Mode bit for exclusive use files
        pub const EXCL: u32 = 0x20000000;
        /// Mode bit for mounted channel
        pub const MOUNT: u32 = 0x10000000;
        /// Mode bit for authentication file
        pub const AUTH: u32 = 0x08000000;
        /// Mode bit for non-backed-up files
        pub const TMP: u32 = 0x04000000;
        /// Mode bit for symbolic links (9P2000.u)
        pub const SYMLINK: u32 = 0x02000000;
        /// Mode bit for devices (9P2000.u)
        pub const DEVICE: u32 = 0x00800000;
        /// Mode bit for named pipes (9P2000.u)
        pub const NAMEDPIPE: u32 = 0x00200000;
        /// Mode bit for sockets (9P2000.u)
        pub const SOCKET: u32 = 0x00100000;
        /// Mode bit for setuid (9P2000.u)
        pub const SETUID: u32 = 0x00080000;
        /// Mode bit for setgid (9P2000.u)
        pub const SETGID: u32 = 0x00040000;
        /// Mode bit for read permission
        pub const READ: u32 = 0x4;
        /// Mode bit for write permission
        pub const WRITE: u32 = 0x2;
        /// Mode bit for execute permission
        pub const EXEC: u32 = 0x1;
    }

    /// Plan 9 Namespace metadata (somewhat like a unix fstat)
    ///
    /// NOTE: Defined as `Dir` in libc.h of Plan 9
    #[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct Stat {
        /// Server type
        pub typ: u16,
        /// Server subtype
        pub dev: u32,
        /// Unique id from server
        pub qid: super::Qid,
        /// Permissions
        pub mode: u32,
        /// Last read time
        pub atime: u32,
        /// Last write time
        pub mtime: u32,
        /// File length
        pub length: u64,
        /// Last element of path
        pub name: String,
        /// Owner name
        pub uid: String,
        /// Group name
        pub gid: String,
        /// Last modifier name
        pub muid: String,
    }

    impl Stat {
        /// Value of the record's leading size field: everything after it.
        ///
        /// The field is a u16 on the wire; records whose size does not fit
        /// cannot be encoded.
        pub fn size(&self) -> u32 {
            super::FIXED_STAT_LEN
                + self.name.len() as u32
                + self.uid.len() as u32
                + self.gid.len() as u32
                + self.muid.len() as u32
        }
    }
}

bitflags! {
    /// File lock type, Flock.typ
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct LockType: u8 {
        const RDLOCK    = 0;
        const WRLOCK    = 1;
        const UNLOCK    = 2;
    }
}

bitflags! {
    /// File lock flags, Flock.flags
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct LockFlag: u32 {
        #[doc = "Blocking request"]
        const BLOCK     = 1;
        #[doc = "Reserved for future use"]
        const RECLAIM   = 2;
    }
}

bitflags! {
    /// File lock status
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct LockStatus: u8 {
        const SUCCESS   = 0;
        const BLOCKED   = 1;
        const ERROR     = 2;
        const GRACE     = 3;
    }
}

bitflags! {
    /// Bits in Qid.typ
    ///
    /// # Protocol
    /// 9P2000/9P2000.L
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct QidType: u8 {
        #[doc = "Type bit for directories"]
        const DIR       = 0x80;
        #[doc = "Type bit for append only files"]
        const APPEND    = 0x40;
        #[doc = "Type bit for exclusive use files"]
        const EXCL      = 0x20;
        #[doc = "Type bit for mounted channel"]
        const MOUNT     = 0x10;
        #[doc = "Type bit for authentication file"]
        const AUTH      = 0x08;
        #[doc = "Type bit for not-backed-up file"]
        const TMP       = 0x04;
        #[doc = "Type bits for symbolic links (9P2000.u)"]
        const SYMLINK   = 0x02;
        #[doc = "Type bits for hard-link (9P2000.u)"]
        const LINK      = 0x01;
        #[doc = "Plain file"]
        const FILE      = 0x00;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct GetAttrMask: u64 {
        const MODE          = 0x00000001;
        const NLINK         = 0x00000002;
        const UID           = 0x00000004;
        const GID           = 0x00000008;
        const RDEV          = 0x00000010;
        const ATIME         = 0x00000020;
        const MTIME         = 0x00000040;
        const CTIME         = 0x00000080;
        const INO           = 0x00000100;
        const SIZE          = 0x00000200;
        const BLOCKS        = 0x00000400;

        const BTIME         = 0x00000800;
        const GEN           = 0x00001000;
        const DATA_VERSION  = 0x00002000;

        #[doc = "Mask for fields up to BLOCKS"]
        const BASIC         = 0x000007ff;
        #[doc = "Mask for All fields above"]
        const ALL           = 0x00003fff;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct SetAttrMask: u32 {
        const MODE      = 0x00000001;
        const UID       = 0x00000002;
        const GID       = 0x00000004;
        const SIZE      = 0x00000008;
        const ATIME     = 0x00000010;
        const MTIME     = 0x00000020;
        const CTIME     = 0x00000040;
        const ATIME_SET = 0x00000080;
        const MTIME_SET = 0x00000100;
    }
}

/// Server-unique file identity, 13 bytes on the wire.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Qid {
    pub typ: QidType,
    pub version: u32,
    pub path: u64,
}

impl Qid {
    pub const SIZE: u32 = 13;
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct StatFs {
    pub typ: u32,
    pub bsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub fsid: u64,
    pub namelen: u32,
}

impl From<nix::sys::statvfs::Statvfs> for StatFs {
    fn from(buf: nix::sys::statvfs::Statvfs) -> StatFs {
        StatFs {
            typ: 0,
            bsize: buf.block_size() as u32,
            blocks: buf.blocks(),
            bfree: buf.blocks_free(),
            bavail: buf.blocks_available(),
            files: buf.files(),
            ffree: buf.files_free(),
            fsid: buf.filesystem_id(),
            namelen: buf.name_max() as u32,
        }
    }
}

/// Timespec, `[sec:u64][nsec:u64]`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Time {
    pub sec: u64,
    pub nsec: u64,
}

impl Time {
    pub fn now() -> Time {
        let d = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Time {
            sec: d.as_secs(),
            nsec: d.subsec_nanos() as u64,
        }
    }
}

/// Attributes reported by Rgetattr.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stat {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: Time,
    pub mtime: Time,
    pub ctime: Time,
}

/// Attributes carried by Tsetattr. Only the fields named in the mask apply.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct SetAttr {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: Time,
    pub mtime: Time,
}

/// One directory entry of an Rreaddir payload.
///
/// `offset` is the cookie a client passes back in the next Treaddir to resume
/// after this entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirEntry {
    pub qid: Qid,
    pub offset: u64,
    pub typ: u8,
    pub name: String,
}

impl DirEntry {
    pub fn size(&self) -> u32 {
        Qid::SIZE + 8 + 1 + 2 + self.name.len() as u32
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirEntryData {
    pub data: Vec<DirEntry>,
}

impl DirEntryData {
    pub fn new() -> DirEntryData {
        Self::with(Vec::new())
    }

    pub fn with(v: Vec<DirEntry>) -> DirEntryData {
        DirEntryData { data: v }
    }

    pub fn data(&self) -> &[DirEntry] {
        &self.data
    }

    pub fn size(&self) -> u32 {
        self.data.iter().fold(0, |a, e| a + e.size())
    }

    pub fn push(&mut self, entry: DirEntry) {
        self.data.push(entry);
    }
}

/// Bulk payload of Rread, Twrite and Rreaddir.
///
/// Backed by [`bytes::Bytes`] so a decoded payload shares the receive buffer
/// and an encoded one is written to the socket as-is.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub bytes::Bytes);

impl Data {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Data {
    fn from(v: Vec<u8>) -> Data {
        Data(v.into())
    }
}

impl From<&'static [u8]> for Data {
    fn from(v: &'static [u8]) -> Data {
        Data(bytes::Bytes::from_static(v))
    }
}

impl std::ops::Deref for Data {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Flock {
    pub typ: LockType,
    pub flags: LockFlag,
    pub start: u64,
    pub length: u64,
    pub proc_id: u32,
    pub client_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Getlock {
    pub typ: LockType,
    pub start: u64,
    pub length: u64,
    pub proc_id: u32,
    pub client_id: String,
}

enum_from_primitive! {
    #[doc = "Message type, 9P operations"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum MsgType {
        // 9P2000.L
        TlError         = 6,    // Illegal, never used
        RlError,
        TStatFs         = 8,
        RStatFs,
        TlOpen          = 12,
        RlOpen,
        TlCreate        = 14,
        RlCreate,
        TSymlink        = 16,
        RSymlink,
        TMkNod          = 18,
        RMkNod,
        TRename         = 20,
        RRename,
        TReadLink       = 22,
        RReadLink,
        TGetAttr        = 24,
        RGetAttr,
        TSetAttr        = 26,
        RSetAttr,
        TxAttrWalk      = 30,
        RxAttrWalk,
        TxAttrCreate    = 32,
        RxAttrCreate,
        TReadDir        = 40,
        RReadDir,
        TFSync          = 50,
        RFSync,
        TLock           = 52,
        RLock,
        TGetLock        = 54,
        RGetLock,
        TLink           = 70,
        RLink,
        TMkDir          = 72,
        RMkDir,
        TRenameAt       = 74,
        RRenameAt,
        TUnlinkAt       = 76,
        RUnlinkAt,

        // 9P2000, Tauth/Tattach double as Tlauth/Tlattach
        TVersion        = 100,
        RVersion,
        TAuth           = 102,
        RAuth,
        TAttach         = 104,
        RAttach,
        TError          = 106,  // Illegal, never used
        RError,
        TFlush          = 108,
        RFlush,
        TWalk           = 110,
        RWalk,
        TOpen           = 112,
        ROpen,
        TCreate         = 114,
        RCreate,
        TRead           = 116,
        RRead,
        TWrite          = 118,
        RWrite,
        TClunk          = 120,
        RClunk,
        TRemove         = 122,
        RRemove,
        TStat           = 124,
        RStat,
        TWStat          = 126,
        RWStat,
    }
}

impl MsgType {
    pub fn is_t(&self) -> bool {
        !self.is_r()
    }

    /// R-codes are odd in both dialects.
    pub fn is_r(&self) -> bool {
        (*self as u8) & 1 == 1
    }
}

/*
 * Messages, one record per variant
 */

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tversion {
    pub msize: u32,
    pub version: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rversion {
    pub msize: u32,
    pub version: String,
}

/// 9P2000 Tauth
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tauth {
    pub afid: u32,
    pub uname: String,
    pub aname: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tlauth {
    pub afid: u32,
    pub uname: String,
    pub aname: String,
    pub n_uname: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rauth {
    pub aqid: Qid,
}

/// 9P2000 Tattach
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tattach {
    pub fid: u32,
    pub afid: u32,
    pub uname: String,
    pub aname: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tlattach {
    pub fid: u32,
    pub afid: u32,
    pub uname: String,
    pub aname: String,
    pub n_uname: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rattach {
    pub qid: Qid,
}

/// 9P2000 error reply
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rerror {
    pub ename: String,
}

/// 9P2000.L error reply
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rlerror {
    pub ecode: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tflush {
    pub oldtag: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rflush;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Twalk {
    pub fid: u32,
    pub newfid: u32,
    pub wnames: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rwalk {
    pub wqids: Vec<Qid>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Topen {
    pub fid: u32,
    pub mode: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ropen {
    pub qid: Qid,
    pub iounit: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tcreate {
    pub fid: u32,
    pub name: String,
    pub perm: u32,
    pub mode: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rcreate {
    pub qid: Qid,
    pub iounit: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tread {
    pub fid: u32,
    pub offset: u64,
    pub count: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rread {
    pub data: Data,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Twrite {
    pub fid: u32,
    pub offset: u64,
    pub data: Data,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rwrite {
    pub count: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tclunk {
    pub fid: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rclunk;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tremove {
    pub fid: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rremove;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tstat {
    pub fid: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rstat {
    pub stat: p92000::Stat,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Twstat {
    pub fid: u32,
    pub stat: p92000::Stat,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rwstat;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tstatfs {
    pub fid: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rstatfs {
    pub statfs: StatFs,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tlopen {
    pub fid: u32,
    pub flags: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rlopen {
    pub qid: Qid,
    pub iounit: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tlcreate {
    pub fid: u32,
    pub name: String,
    pub flags: u32,
    pub mode: u32,
    pub gid: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rlcreate {
    pub qid: Qid,
    pub iounit: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tsymlink {
    pub fid: u32,
    pub name: String,
    pub symtgt: String,
    pub gid: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rsymlink {
    pub qid: Qid,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tmknod {
    pub dfid: u32,
    pub name: String,
    pub mode: u32,
    pub major: u32,
    pub minor: u32,
    pub gid: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rmknod {
    pub qid: Qid,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Trename {
    pub fid: u32,
    pub dfid: u32,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rrename;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Treadlink {
    pub fid: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rreadlink {
    pub target: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tgetattr {
    pub fid: u32,
    pub req_mask: GetAttrMask,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rgetattr {
    pub valid: GetAttrMask,
    pub qid: Qid,
    pub stat: Stat,
    pub btime: Time,
    pub r#gen: u64,
    pub data_version: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tsetattr {
    pub fid: u32,
    pub valid: SetAttrMask,
    pub stat: SetAttr,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rsetattr;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Txattrwalk {
    pub fid: u32,
    pub newfid: u32,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rxattrwalk {
    pub size: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Txattrcreate {
    pub fid: u32,
    pub name: String,
    pub attr_size: u64,
    pub flags: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rxattrcreate;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Treaddir {
    pub fid: u32,
    pub offset: u64,
    pub count: u32,
}

/// Packed directory entries, see [`DirEntryData::to_data`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rreaddir {
    pub data: Data,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tfsync {
    pub fid: u32,
    pub datasync: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rfsync;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tlock {
    pub fid: u32,
    pub flock: Flock,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rlock {
    pub status: LockStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tgetlock {
    pub fid: u32,
    pub flock: Getlock,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rgetlock {
    pub flock: Getlock,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tlink {
    pub dfid: u32,
    pub fid: u32,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rlink;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tmkdir {
    pub dfid: u32,
    pub name: String,
    pub mode: u32,
    pub gid: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rmkdir {
    pub qid: Qid,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Trenameat {
    pub olddirfid: u32,
    pub oldname: String,
    pub newdirfid: u32,
    pub newname: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rrenameat;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tunlinkat {
    pub dirfd: u32,
    pub name: String,
    pub flags: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Runlinkat;

/// One catalog row: how a type code is framed and decoded.
#[derive(Debug)]
pub struct Entry {
    pub typ: MsgType,
    /// `None` when the variant is valid in both dialects.
    pub dialect: Option<Dialect>,
    /// Header plus fixed body, excluding strings and payloads.
    pub min_size: u32,
    pub decode: fn(&mut Buffer) -> Fcall,
}

fn decode_as<T: Decodable + Into<Fcall>>(buf: &mut Buffer) -> Fcall {
    T::decode(buf).into()
}

macro_rules! catalog {
    ($($variant:ident = $typ:ident, $dialect:expr, $min:expr;)*) => {
        /// A 9P message body.
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub enum Fcall {
            $($variant($variant),)*
        }

        impl Fcall {
            pub fn msg_type(&self) -> MsgType {
                match *self {
                    $(Fcall::$variant(_) => MsgType::$typ,)*
                }
            }

            /// Name of the variant, for logging.
            pub fn name(&self) -> &'static str {
                match *self {
                    $(Fcall::$variant(_) => stringify!($variant),)*
                }
            }

            /// Dialect this variant belongs to, `None` if it is common to both.
            pub fn dialect(&self) -> Option<Dialect> {
                match *self {
                    $(Fcall::$variant(_) => $dialect,)*
                }
            }

            pub(crate) fn encode_fields(&self, buf: &mut Buffer) {
                match *self {
                    $(Fcall::$variant(ref m) => m.encode(buf),)*
                }
            }
        }

        $(
            impl From<$variant> for Fcall {
                fn from(m: $variant) -> Fcall {
                    Fcall::$variant(m)
                }
            }

            impl TryFrom<Fcall> for $variant {
                type Error = Error;

                fn try_from(fcall: Fcall) -> Result<$variant, Error> {
                    match fcall {
                        Fcall::$variant(m) => Ok(m),
                        other => Err(Error::UnexpectedMessage(other.msg_type())),
                    }
                }
            }
        )*

        /// Every message variant with its code, dialect and minimum frame size.
        pub static CATALOG: &[Entry] = &[
            $(Entry {
                typ: MsgType::$typ,
                dialect: $dialect,
                min_size: $min,
                decode: decode_as::<$variant>,
            },)*
        ];

        #[cfg(test)]
        pub(crate) fn catalog_samples() -> Vec<Fcall> {
            vec![$(Fcall::$variant($variant::default()),)*]
        }
    };
}

const BOTH: Option<Dialect> = None;
const LEGACY: Option<Dialect> = Some(Dialect::P92000);
const LINUX: Option<Dialect> = Some(Dialect::P92000L);

catalog! {
    Tversion     = TVersion,     BOTH,   13;
    Rversion     = RVersion,     BOTH,   13;
    Tauth        = TAuth,        LEGACY, 15;
    Tlauth       = TAuth,        LINUX,  19;
    Rauth        = RAuth,        BOTH,   20;
    Tattach      = TAttach,      LEGACY, 19;
    Tlattach     = TAttach,      LINUX,  23;
    Rattach      = RAttach,      BOTH,   20;
    Rerror       = RError,       BOTH,   9;
    Rlerror      = RlError,      BOTH,   11;
    Tflush       = TFlush,       BOTH,   9;
    Rflush       = RFlush,       BOTH,   7;
    Twalk        = TWalk,        BOTH,   17;
    Rwalk        = RWalk,        BOTH,   9;
    Topen        = TOpen,        LEGACY, 12;
    Ropen        = ROpen,        LEGACY, 24;
    Tcreate      = TCreate,      LEGACY, 18;
    Rcreate      = RCreate,      LEGACY, 24;
    Tread        = TRead,        BOTH,   23;
    Rread        = RRead,        BOTH,   11;
    Twrite       = TWrite,       BOTH,   23;
    Rwrite       = RWrite,       BOTH,   11;
    Tclunk       = TClunk,       BOTH,   11;
    Rclunk       = RClunk,       BOTH,   7;
    Tremove      = TRemove,      BOTH,   11;
    Rremove      = RRemove,      BOTH,   7;
    Tstat        = TStat,        LEGACY, 11;
    Rstat        = RStat,        LEGACY, 58;
    Twstat       = TWStat,       LEGACY, 62;
    Rwstat       = RWStat,       LEGACY, 7;
    Tstatfs      = TStatFs,      LINUX,  11;
    Rstatfs      = RStatFs,      LINUX,  67;
    Tlopen       = TlOpen,       LINUX,  15;
    Rlopen       = RlOpen,       LINUX,  24;
    Tlcreate     = TlCreate,     LINUX,  25;
    Rlcreate     = RlCreate,     LINUX,  24;
    Tsymlink     = TSymlink,     LINUX,  19;
    Rsymlink     = RSymlink,     LINUX,  20;
    Tmknod       = TMkNod,       LINUX,  29;
    Rmknod       = RMkNod,       LINUX,  20;
    Trename      = TRename,      LINUX,  17;
    Rrename      = RRename,      LINUX,  7;
    Treadlink    = TReadLink,    LINUX,  11;
    Rreadlink    = RReadLink,    LINUX,  9;
    Tgetattr     = TGetAttr,     LINUX,  19;
    Rgetattr     = RGetAttr,     LINUX,  160;
    Tsetattr     = TSetAttr,     LINUX,  67;
    Rsetattr     = RSetAttr,     LINUX,  7;
    Txattrwalk   = TxAttrWalk,   LINUX,  17;
    Rxattrwalk   = RxAttrWalk,   LINUX,  15;
    Txattrcreate = TxAttrCreate, LINUX,  25;
    Rxattrcreate = RxAttrCreate, LINUX,  7;
    Treaddir     = TReadDir,     LINUX,  23;
    Rreaddir     = RReadDir,     LINUX,  11;
    Tfsync       = TFSync,       LINUX,  15;
    Rfsync       = RFSync,       LINUX,  7;
    Tlock        = TLock,        LINUX,  38;
    Rlock        = RLock,        LINUX,  8;
    Tgetlock     = TGetLock,     LINUX,  34;
    Rgetlock     = RGetLock,     LINUX,  30;
    Tlink        = TLink,        LINUX,  17;
    Rlink        = RLink,        LINUX,  7;
    Tmkdir       = TMkDir,       LINUX,  21;
    Rmkdir       = RMkDir,       LINUX,  20;
    Trenameat    = TRenameAt,    LINUX,  19;
    Rrenameat    = RRenameAt,    LINUX,  7;
    Tunlinkat    = TUnlinkAt,    LINUX,  17;
    Runlinkat    = RUnlinkAt,    LINUX,  7;
}

/// Find the catalog entry for a type code as seen in `dialect`.
pub fn lookup(typ: u8, dialect: Dialect) -> Option<&'static Entry> {
    CATALOG
        .iter()
        .find(|e| e.typ as u8 == typ && e.dialect.is_none_or(|d| d == dialect))
}

impl Fcall {
    pub fn is_error(&self) -> bool {
        matches!(*self, Fcall::Rerror(_) | Fcall::Rlerror(_))
    }
}

/// Envelope of 9P messages
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Msg {
    /// Chosen and used by the client to identify the message.
    /// The reply to the message will have the same tag
    pub tag: u16,
    /// Message body encapsulating the various 9P messages
    pub body: Fcall,
}

impl fmt::Display for Msg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}[{}]", self.body.name(), self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_paired() {
        for entry in CATALOG {
            let code = entry.typ as u8;
            let t = MsgType::from_u8(code & !1).unwrap();
            let r = MsgType::from_u8(code | 1).unwrap();
            assert!(t.is_t(), "{:?}", t);
            assert!(r.is_r(), "{:?}", r);
        }
        assert_eq!(MsgType::from_u8(106), Some(MsgType::TError));
        assert_eq!(MsgType::from_u8(7), Some(MsgType::RlError));
        assert_eq!(MsgType::from_u8(28), None);
    }

    #[test]
    fn lookup_depends_on_dialect() {
        let t = lookup(MsgType::TAttach as u8, Dialect::P92000).unwrap();
        assert_eq!(t.min_size, 19);
        let t = lookup(MsgType::TAttach as u8, Dialect::P92000L).unwrap();
        assert_eq!(t.min_size, 23);

        assert!(lookup(MsgType::TOpen as u8, Dialect::P92000L).is_none());
        assert!(lookup(MsgType::TlOpen as u8, Dialect::P92000).is_none());
        assert!(lookup(MsgType::TError as u8, Dialect::P92000).is_none());
        assert!(lookup(MsgType::RlError as u8, Dialect::P92000).is_some());
        assert!(lookup(MsgType::RError as u8, Dialect::P92000L).is_some());
    }

    #[test]
    fn one_entry_per_code_and_dialect() {
        for dialect in [Dialect::P92000, Dialect::P92000L] {
            for code in 0..=u8::MAX {
                let n = CATALOG
                    .iter()
                    .filter(|e| e.typ as u8 == code && e.dialect.is_none_or(|d| d == dialect))
                    .count();
                assert!(n <= 1, "code {} has {} entries in {}", code, n, dialect);
            }
        }
    }

    #[test]
    fn dialect_of_variant() {
        assert_eq!(Fcall::from(Tlattach::default()).dialect(), Some(Dialect::P92000L));
        assert_eq!(Fcall::from(Tattach::default()).dialect(), Some(Dialect::P92000));
        assert_eq!(Fcall::from(Twalk::default()).dialect(), None);
    }

    #[test]
    fn try_from_reports_unexpected_message() {
        let body = Fcall::from(Rclunk);
        match Rwalk::try_from(body) {
            Err(Error::UnexpectedMessage(MsgType::RClunk)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn legacy_stat_size() {
        let stat = p92000::Stat {
            name: "file".to_owned(),
            uid: "glenda".to_owned(),
            ..Default::default()
        };
        assert_eq!(stat.size(), 47 + 4 + 6);
    }

    #[test]
    fn dialect_strings() {
        assert_eq!(Dialect::from_version("9P2000.L"), Some(Dialect::P92000L));
        assert_eq!(Dialect::from_version("9P2000"), Some(Dialect::P92000));
        assert_eq!(Dialect::from_version("9P2000.u"), None);
        assert_eq!(Dialect::P92000L.to_string(), P92000L);
    }

    #[test]
    fn statfs_from_statvfs() {
        let vfs = nix::sys::statvfs::statvfs("/").unwrap();
        let statfs = StatFs::from(vfs);
        assert!(statfs.bsize > 0);
        assert!(statfs.namelen > 0);
    }
}
