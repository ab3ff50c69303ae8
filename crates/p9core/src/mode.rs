//! File mode and open flag translation.
//!
//! 9P2000.L carries Linux `st_mode` and `open(2)` flag values on the wire,
//! 9P2000 carries Plan 9 `DM*` mode bits and `OREAD`-style open modes. Both
//! are converted to and from the abstract [`FileMode`] and [`OpenFlags`].

use bitflags::bitflags;

use crate::fcall::p92000::{dm, om};
use crate::fcall::QidType;

/// Linux numeric values as they appear on the wire.
pub mod posix {
    pub const S_IFMT: u32 = 0o170000;
    pub const S_IFSOCK: u32 = 0o140000;
    pub const S_IFLNK: u32 = 0o120000;
    pub const S_IFREG: u32 = 0o100000;
    pub const S_IFBLK: u32 = 0o060000;
    pub const S_IFDIR: u32 = 0o040000;
    pub const S_IFCHR: u32 = 0o020000;
    pub const S_IFIFO: u32 = 0o010000;

    pub const O_RDONLY: u32 = 0o0;
    pub const O_WRONLY: u32 = 0o1;
    pub const O_RDWR: u32 = 0o2;
    pub const O_ACCMODE: u32 = 0o3;
    pub const O_CREAT: u32 = 0o100;
    pub const O_EXCL: u32 = 0o200;
    pub const O_TRUNC: u32 = 0o1000;
    pub const O_APPEND: u32 = 0o2000;
    pub const O_SYNC: u32 = 0o4010000;
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum FileType {
    #[default]
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharacterDevice,
    Socket,
    NamedPipe,
}

impl FileType {
    pub const ALL: [FileType; 7] = [
        FileType::Regular,
        FileType::Directory,
        FileType::Symlink,
        FileType::BlockDevice,
        FileType::CharacterDevice,
        FileType::Socket,
        FileType::NamedPipe,
    ];

    /// Unknown type bits read as a regular file.
    pub fn from_posix(mode: u32) -> FileType {
        match mode & posix::S_IFMT {
            posix::S_IFDIR => FileType::Directory,
            posix::S_IFLNK => FileType::Symlink,
            posix::S_IFBLK => FileType::BlockDevice,
            posix::S_IFCHR => FileType::CharacterDevice,
            posix::S_IFSOCK => FileType::Socket,
            posix::S_IFIFO => FileType::NamedPipe,
            _ => FileType::Regular,
        }
    }

    pub fn to_posix(self) -> u32 {
        match self {
            FileType::Regular => posix::S_IFREG,
            FileType::Directory => posix::S_IFDIR,
            FileType::Symlink => posix::S_IFLNK,
            FileType::BlockDevice => posix::S_IFBLK,
            FileType::CharacterDevice => posix::S_IFCHR,
            FileType::Socket => posix::S_IFSOCK,
            FileType::NamedPipe => posix::S_IFIFO,
        }
    }

    /// Type bits of a qid naming a file of this type.
    ///
    /// Devices, pipes and sockets have no qid type bit of their own and
    /// are reported as plain files.
    pub fn qid_type(self) -> QidType {
        match self {
            FileType::Directory => QidType::DIR,
            FileType::Symlink => QidType::SYMLINK,
            _ => QidType::FILE,
        }
    }

    /// The `d_type` value used in readdir entries.
    pub fn dirent_type(self) -> u8 {
        (self.to_posix() >> 12) as u8
    }
}

bitflags! {
    /// Permission bits, laid out as in `st_mode`.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Permissions: u32 {
        const SETUID        = 0o4000;
        const SETGID        = 0o2000;
        const STICKY        = 0o1000;
        const USER_READ     = 0o0400;
        const USER_WRITE    = 0o0200;
        const USER_EXEC     = 0o0100;
        const GROUP_READ    = 0o0040;
        const GROUP_WRITE   = 0o0020;
        const GROUP_EXEC    = 0o0010;
        const OTHER_READ    = 0o0004;
        const OTHER_WRITE   = 0o0002;
        const OTHER_EXEC    = 0o0001;
    }
}

/// A file type plus its permission bits.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FileMode {
    pub typ: FileType,
    pub perm: Permissions,
}

impl FileMode {
    pub fn new(typ: FileType, perm: u32) -> FileMode {
        FileMode {
            typ,
            perm: Permissions::from_bits_truncate(perm),
        }
    }

    pub fn from_posix(mode: u32) -> FileMode {
        FileMode::new(FileType::from_posix(mode), mode)
    }

    pub fn to_posix(&self) -> u32 {
        self.typ.to_posix() | self.perm.bits()
    }

    /// Convert Plan 9 `DM*` bits. 9P2000 has no sticky bit and a single
    /// device bit, which reads as a character device.
    pub fn from_dm(mode: u32) -> FileMode {
        let typ = if mode & dm::DIR != 0 {
            FileType::Directory
        } else if mode & dm::SYMLINK != 0 {
            FileType::Symlink
        } else if mode & dm::DEVICE != 0 {
            FileType::CharacterDevice
        } else if mode & dm::NAMEDPIPE != 0 {
            FileType::NamedPipe
        } else if mode & dm::SOCKET != 0 {
            FileType::Socket
        } else {
            FileType::Regular
        };

        let mut perm = Permissions::from_bits_truncate(mode & 0o777);
        if mode & dm::SETUID != 0 {
            perm |= Permissions::SETUID;
        }
        if mode & dm::SETGID != 0 {
            perm |= Permissions::SETGID;
        }
        FileMode { typ, perm }
    }

    pub fn to_dm(&self) -> u32 {
        let mut mode = self.perm.bits() & 0o777;
        mode |= match self.typ {
            FileType::Regular => 0,
            FileType::Directory => dm::DIR,
            FileType::Symlink => dm::SYMLINK,
            FileType::BlockDevice | FileType::CharacterDevice => dm::DEVICE,
            FileType::NamedPipe => dm::NAMEDPIPE,
            FileType::Socket => dm::SOCKET,
        };
        if self.perm.contains(Permissions::SETUID) {
            mode |= dm::SETUID;
        }
        if self.perm.contains(Permissions::SETGID) {
            mode |= dm::SETGID;
        }
        mode
    }

    pub fn qid_type(&self) -> QidType {
        self.typ.qid_type()
    }

    pub fn is_dir(&self) -> bool {
        self.typ == FileType::Directory
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum AccessMode {
    #[default]
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn readable(self) -> bool {
        self != AccessMode::WriteOnly
    }

    pub fn writable(self) -> bool {
        self != AccessMode::ReadOnly
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct OpenFlag: u32 {
        const APPEND    = 0x01;
        const TRUNCATE  = 0x02;
        const SYNC      = 0x04;
        const CREATE    = 0x08;
        const EXCLUSIVE = 0x10;
    }
}

const POSIX_FLAGS: [(OpenFlag, u32); 5] = [
    (OpenFlag::APPEND, posix::O_APPEND),
    (OpenFlag::TRUNCATE, posix::O_TRUNC),
    (OpenFlag::SYNC, posix::O_SYNC),
    (OpenFlag::CREATE, posix::O_CREAT),
    (OpenFlag::EXCLUSIVE, posix::O_EXCL),
];

/// Access mode plus the open flags a service acts on.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct OpenFlags {
    pub access: AccessMode,
    pub flags: OpenFlag,
}

impl OpenFlags {
    /// Flags the service does not act on (`O_NOCTTY`, `O_LARGEFILE`, ...)
    /// are dropped.
    pub fn from_posix(flags: u32) -> OpenFlags {
        let access = match flags & posix::O_ACCMODE {
            posix::O_RDONLY => AccessMode::ReadOnly,
            posix::O_WRONLY => AccessMode::WriteOnly,
            _ => AccessMode::ReadWrite,
        };
        let flags = POSIX_FLAGS
            .iter()
            .filter(|(_, bits)| flags & bits == *bits)
            .fold(OpenFlag::empty(), |acc, (flag, _)| acc | *flag);
        OpenFlags { access, flags }
    }

    pub fn to_posix(&self) -> u32 {
        let access = match self.access {
            AccessMode::ReadOnly => posix::O_RDONLY,
            AccessMode::WriteOnly => posix::O_WRONLY,
            AccessMode::ReadWrite => posix::O_RDWR,
        };
        POSIX_FLAGS
            .iter()
            .filter(|(flag, _)| self.flags.contains(*flag))
            .fold(access, |acc, (_, bits)| acc | bits)
    }

    /// Convert a 9P2000 Topen/Tcreate mode byte.
    pub fn from_p9_mode(mode: u8) -> OpenFlags {
        let access = match mode & 3 {
            om::WRITE => AccessMode::WriteOnly,
            om::RDWR => AccessMode::ReadWrite,
            _ => AccessMode::ReadOnly,
        };
        let mut flags = OpenFlag::empty();
        if mode & om::TRUNC != 0 {
            flags |= OpenFlag::TRUNCATE;
        }
        OpenFlags { access, flags }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posix_mode_round_trip() {
        for typ in FileType::ALL {
            for perm in [0, 0o644, 0o755, 0o4711, 0o2750, 0o1777, 0o7777] {
                let mode = FileMode::new(typ, perm);
                let posix = mode.to_posix();
                assert_eq!(posix & 0o7777, perm);
                assert_eq!(FileMode::from_posix(posix), mode);
            }
        }
    }

    #[test]
    fn posix_mode_values() {
        assert_eq!(
            FileMode::new(FileType::Directory, 0o755).to_posix(),
            0o040755
        );
        assert_eq!(
            FileMode::from_posix(0o120777),
            FileMode::new(FileType::Symlink, 0o777)
        );
        // no type bits at all, as mknod(2) allows
        assert_eq!(FileMode::from_posix(0o644).typ, FileType::Regular);
        assert_eq!(FileType::Directory.dirent_type(), 4);
        assert_eq!(FileType::Regular.dirent_type(), 8);
        assert_eq!(FileType::Symlink.dirent_type(), 10);
    }

    #[test]
    fn dm_mode_round_trip() {
        for typ in [
            FileType::Regular,
            FileType::Directory,
            FileType::Symlink,
            FileType::CharacterDevice,
            FileType::Socket,
            FileType::NamedPipe,
        ] {
            let mode = FileMode::new(typ, 0o6755);
            assert_eq!(FileMode::from_dm(mode.to_dm()), mode);
        }

        let dir = FileMode::new(FileType::Directory, 0o755).to_dm();
        assert_eq!(dir, dm::DIR | 0o755);
        // sticky has no DM bit
        assert_eq!(FileMode::new(FileType::Regular, 0o1644).to_dm(), 0o644);
        assert_eq!(
            FileMode::new(FileType::BlockDevice, 0).to_dm(),
            dm::DEVICE
        );
    }

    #[test]
    fn qid_types() {
        assert_eq!(FileType::Directory.qid_type(), QidType::DIR);
        assert_eq!(FileType::Symlink.qid_type(), QidType::SYMLINK);
        for typ in [
            FileType::Regular,
            FileType::BlockDevice,
            FileType::CharacterDevice,
            FileType::Socket,
            FileType::NamedPipe,
        ] {
            assert_eq!(typ.qid_type(), QidType::FILE);
        }
    }

    #[test]
    fn open_flags_round_trip() {
        for access in [
            AccessMode::ReadOnly,
            AccessMode::WriteOnly,
            AccessMode::ReadWrite,
        ] {
            for bits in 0..=OpenFlag::all().bits() {
                let flags = OpenFlags {
                    access,
                    flags: OpenFlag::from_bits_truncate(bits),
                };
                assert_eq!(OpenFlags::from_posix(flags.to_posix()), flags);
            }
        }
    }

    #[test]
    fn open_flags_values() {
        let flags = OpenFlags::from_posix(0o2 | 0o100 | 0o200 | 0o100000);
        assert_eq!(flags.access, AccessMode::ReadWrite);
        assert_eq!(flags.flags, OpenFlag::CREATE | OpenFlag::EXCLUSIVE);

        // O_DSYNC alone is not O_SYNC
        assert_eq!(OpenFlags::from_posix(0o10000).flags, OpenFlag::empty());
        assert_eq!(OpenFlags::from_posix(0o4010001).flags, OpenFlag::SYNC);
    }

    #[test]
    fn legacy_open_modes() {
        assert_eq!(
            OpenFlags::from_p9_mode(om::READ),
            OpenFlags {
                access: AccessMode::ReadOnly,
                flags: OpenFlag::empty()
            }
        );
        assert_eq!(
            OpenFlags::from_p9_mode(om::EXEC).access,
            AccessMode::ReadOnly
        );
        let trunc = OpenFlags::from_p9_mode(om::RDWR | om::TRUNC);
        assert_eq!(trunc.access, AccessMode::ReadWrite);
        assert_eq!(trunc.flags, OpenFlag::TRUNCATE);
        assert!(trunc.access.writable() && trunc.access.readable());
    }
}
