//! In-memory filesystem tree served over 9P.

use {
    async_trait::async_trait,
    log::debug,
    p9core::{
        error::errno::*,
        mode::{AccessMode, FileMode, FileType, OpenFlag, OpenFlags},
        srv::{Fid, Service},
        *,
    },
    std::collections::{BTreeMap, HashMap},
    tokio::sync::{Mutex, RwLock},
};

/// Qid path of the root directory.
pub const ROOT: u64 = 1;

/// `AT_REMOVEDIR` as sent in Tunlinkat.
const AT_REMOVEDIR: u32 = 0x200;

/// Magic reported in Rstatfs, the value Linux uses for v9fs.
const V9FS_MAGIC: u32 = 0x01021997;

const BLOCK_SIZE: u64 = 4096;
const NAME_MAX: u32 = 255;

/// Largest file the tree will hold. Writes or truncations past it fail
/// with `EFBIG`.
pub const MAX_FILE_SIZE: u64 = 1 << 30;

fn resize_file(data: &mut Vec<u8>, len: u64) -> Result<()> {
    if len > MAX_FILE_SIZE {
        return Err(Error::No(EFBIG));
    }
    data.resize(len as usize, 0);
    Ok(())
}

#[derive(Debug)]
enum Content {
    File(Vec<u8>),
    Dir(BTreeMap<String, u64>),
    Symlink(String),
}

#[derive(Debug)]
struct Node {
    mode: FileMode,
    uid: u32,
    gid: u32,
    parent: u64,
    version: u32,
    atime: Time,
    mtime: Time,
    ctime: Time,
    btime: Time,
    content: Content,
}

impl Node {
    fn new(mode: FileMode, uid: u32, gid: u32, parent: u64, content: Content) -> Node {
        let now = Time::now();
        Node {
            mode,
            uid,
            gid,
            parent,
            version: 0,
            atime: now,
            mtime: now,
            ctime: now,
            btime: now,
            content,
        }
    }

    fn qid(&self, path: u64) -> Qid {
        Qid {
            typ: self.mode.qid_type(),
            version: self.version,
            path,
        }
    }

    fn size(&self) -> u64 {
        match self.content {
            Content::File(ref data) => data.len() as u64,
            Content::Dir(ref children) => children.len() as u64,
            Content::Symlink(ref target) => target.len() as u64,
        }
    }

    fn children(&self) -> Result<&BTreeMap<String, u64>> {
        match self.content {
            Content::Dir(ref children) => Ok(children),
            _ => Err(Error::No(ENOTDIR)),
        }
    }

    fn children_mut(&mut self) -> Result<&mut BTreeMap<String, u64>> {
        match self.content {
            Content::Dir(ref mut children) => Ok(children),
            _ => Err(Error::No(ENOTDIR)),
        }
    }

    fn stat(&self) -> Stat {
        let size = self.size();
        Stat {
            mode: self.mode.to_posix(),
            uid: self.uid,
            gid: self.gid,
            nlink: if self.mode.is_dir() { 2 } else { 1 },
            rdev: 0,
            size,
            blksize: BLOCK_SIZE,
            blocks: size.div_ceil(512),
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
        }
    }

    /// Record a change to the file contents.
    fn touch(&mut self) {
        let now = Time::now();
        self.version = self.version.wrapping_add(1);
        self.mtime = now;
        self.ctime = now;
    }
}

#[derive(Debug)]
struct Tree {
    nodes: HashMap<u64, Node>,
    /// Next qid path. Paths are never handed out twice.
    next_path: u64,
}

impl Tree {
    fn node(&self, path: u64) -> Result<&Node> {
        self.nodes.get(&path).ok_or(Error::No(ENOENT))
    }

    fn node_mut(&mut self, path: u64) -> Result<&mut Node> {
        self.nodes.get_mut(&path).ok_or(Error::No(ENOENT))
    }

    fn lookup(&self, dir: u64, name: &str) -> Result<u64> {
        match name {
            "." => Ok(dir),
            ".." => Ok(self.node(dir)?.parent),
            _ => self
                .node(dir)?
                .children()?
                .get(name)
                .copied()
                .ok_or(Error::No(ENOENT)),
        }
    }

    /// Link a new node named `name` into `dir`.
    fn create(&mut self, dir: u64, name: &str, mode: FileMode, gid: u32, content: Content) -> Result<u64> {
        check_name(name)?;
        let parent = self.node(dir)?;
        if parent.children()?.contains_key(name) {
            return Err(Error::No(EEXIST));
        }
        let uid = parent.uid;

        let path = self.next_path;
        self.next_path += 1;
        self.nodes.insert(path, Node::new(mode, uid, gid, dir, content));

        let parent = self.node_mut(dir)?;
        parent.children_mut()?.insert(name.to_owned(), path);
        parent.touch();
        Ok(path)
    }

    /// Drop `path` from the tree. Directories must be empty.
    fn unlink(&mut self, dir: u64, name: &str, path: u64) -> Result<()> {
        if path == ROOT {
            return Err(Error::No(EBUSY));
        }
        if let Content::Dir(ref children) = self.node(path)?.content {
            if !children.is_empty() {
                return Err(Error::No(ENOTEMPTY));
            }
        }

        let parent = self.node_mut(dir)?;
        parent.children_mut()?.remove(name);
        parent.touch();
        self.nodes.remove(&path);
        Ok(())
    }

    /// Name of `path` inside its parent directory.
    fn name_of(&self, path: u64) -> Result<String> {
        let parent = self.node(self.node(path)?.parent)?;
        parent
            .children()?
            .iter()
            .find(|&(_, &p)| p == path)
            .map(|(name, _)| name.clone())
            .ok_or(Error::No(ENOENT))
    }

    /// Whether `path` is `ancestor` or lies below it.
    fn is_within(&self, mut path: u64, ancestor: u64) -> bool {
        loop {
            if path == ancestor {
                return true;
            }
            match self.nodes.get(&path) {
                Some(node) if node.parent != path => path = node.parent,
                _ => return false,
            }
        }
    }

    fn rename(&mut self, olddir: u64, oldname: &str, newdir: u64, newname: &str) -> Result<()> {
        check_name(oldname)?;
        check_name(newname)?;
        let path = self.lookup(olddir, oldname)?;
        if path == ROOT || self.is_within(newdir, path) {
            return Err(Error::No(EINVAL));
        }
        self.node(newdir)?.children()?;

        if let Ok(target) = self.lookup(newdir, newname) {
            if target == path {
                return Ok(());
            }
            let moving_dir = self.node(path)?.mode.is_dir();
            match (moving_dir, self.node(target)?.mode.is_dir()) {
                (true, false) => return Err(Error::No(ENOTDIR)),
                (false, true) => return Err(Error::No(EISDIR)),
                _ => self.unlink(newdir, newname, target)?,
            }
        }

        let old = self.node_mut(olddir)?;
        old.children_mut()?.remove(oldname);
        old.touch();
        let new = self.node_mut(newdir)?;
        new.children_mut()?.insert(newname.to_owned(), path);
        new.touch();

        let node = self.node_mut(path)?;
        node.parent = newdir;
        node.ctime = Time::now();
        Ok(())
    }

    fn statfs(&self) -> StatFs {
        let bytes: u64 = self.nodes.values().map(Node::size).sum();
        StatFs {
            typ: V9FS_MAGIC,
            bsize: BLOCK_SIZE as u32,
            blocks: bytes.div_ceil(BLOCK_SIZE),
            bfree: 0,
            bavail: 0,
            files: self.nodes.len() as u64,
            ffree: 0,
            fsid: 0,
            namelen: NAME_MAX,
        }
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(Error::No(EINVAL));
    }
    if name.len() > NAME_MAX as usize {
        return Err(Error::No(ENAMETOOLONG));
    }
    Ok(())
}

/// Per-fid state: the node it names and how it was opened.
#[derive(Debug, Default)]
pub struct RamFid {
    path: RwLock<u64>,
    open: Mutex<Option<OpenFlags>>,
}

impl RamFid {
    async fn path(&self) -> u64 {
        *self.path.read().await
    }

    async fn set_path(&self, path: u64) {
        *self.path.write().await = path;
    }

    async fn opened(&self) -> Result<OpenFlags> {
        (*self.open.lock().await).ok_or(Error::No(EBADF))
    }
}

/// The filesystem. Every node lives in memory and vanishes with the process.
#[derive(Debug)]
pub struct RamFs {
    tree: RwLock<Tree>,
}

impl RamFs {
    /// An empty tree whose root belongs to `uid`/`gid`.
    pub fn new(uid: u32, gid: u32) -> RamFs {
        let root = Node::new(
            FileMode::new(FileType::Directory, 0o755),
            uid,
            gid,
            ROOT,
            Content::Dir(BTreeMap::new()),
        );
        RamFs {
            tree: RwLock::new(Tree {
                nodes: HashMap::from([(ROOT, root)]),
                next_path: ROOT + 1,
            }),
        }
    }

    /// Open `path` for `flags`, truncating if asked.
    async fn open(&self, fid: &Fid<RamFid>, flags: OpenFlags) -> Result<Qid> {
        let path = fid.aux.path().await;
        let mut tree = self.tree.write().await;
        let node = tree.node_mut(path)?;
        match node.content {
            Content::Dir(_) if flags.access.writable() => return Err(Error::No(EISDIR)),
            Content::Symlink(_) => return Err(Error::No(ELOOP)),
            Content::File(ref mut data) if flags.flags.contains(OpenFlag::TRUNCATE) => {
                if flags.access.writable() && !data.is_empty() {
                    data.clear();
                    node.touch();
                }
            }
            _ => {}
        }
        let qid = node.qid(path);
        drop(tree);

        *fid.aux.open.lock().await = Some(flags);
        Ok(qid)
    }

    /// Create a file in the directory `fid` and reopen `fid` on it.
    async fn create_file(&self, fid: &Fid<RamFid>, name: &str, mode: FileMode, flags: OpenFlags, gid: u32) -> Result<Qid> {
        if mode.typ != FileType::Regular {
            return Err(Error::No(EOPNOTSUPP));
        }
        let dir = fid.aux.path().await;
        let (path, qid) = {
            let mut tree = self.tree.write().await;
            let path = tree.create(dir, name, mode, gid, Content::File(Vec::new()))?;
            (path, tree.node(path)?.qid(path))
        };

        fid.aux.set_path(path).await;
        *fid.aux.open.lock().await = Some(flags);
        Ok(qid)
    }
}

#[async_trait]
impl Service for RamFs {
    type Fid = RamFid;

    async fn rattach(
        &self,
        fid: &Fid<Self::Fid>,
        _afid: Option<&Fid<Self::Fid>>,
        uname: &str,
        aname: &str,
        n_uname: u32,
    ) -> Result<Rattach> {
        debug!("attach {:?} as {:?} ({})", aname, uname, n_uname);
        fid.aux.set_path(ROOT).await;
        let tree = self.tree.read().await;
        Ok(Rattach {
            qid: tree.node(ROOT)?.qid(ROOT),
        })
    }

    async fn rwalk(&self, fid: &Fid<Self::Fid>, newfid: &Fid<Self::Fid>, wnames: &[String]) -> Result<Rwalk> {
        let mut path = fid.aux.path().await;
        let mut wqids = Vec::new();
        {
            let tree = self.tree.read().await;
            tree.node(path)?;
            for (i, name) in wnames.iter().enumerate() {
                match tree.lookup(path, name) {
                    Ok(next) => path = next,
                    Err(e) if i == 0 => return Err(e),
                    Err(_) => break,
                }
                wqids.push(tree.node(path)?.qid(path));
            }
        }

        newfid.aux.set_path(path).await;
        Ok(Rwalk { wqids })
    }

    async fn rgetattr(&self, fid: &Fid<Self::Fid>, _req_mask: GetAttrMask) -> Result<Rgetattr> {
        let path = fid.aux.path().await;
        let tree = self.tree.read().await;
        let node = tree.node(path)?;

        Ok(Rgetattr {
            valid: GetAttrMask::ALL,
            qid: node.qid(path),
            stat: node.stat(),
            btime: node.btime,
            r#gen: 0,
            data_version: node.version as u64,
        })
    }

    async fn rsetattr(&self, fid: &Fid<Self::Fid>, valid: SetAttrMask, stat: &SetAttr) -> Result<()> {
        let path = fid.aux.path().await;
        let mut tree = self.tree.write().await;
        let node = tree.node_mut(path)?;
        let now = Time::now();

        if valid.contains(SetAttrMask::SIZE) {
            match node.content {
                Content::File(ref mut data) => resize_file(data, stat.size)?,
                Content::Dir(_) => return Err(Error::No(EISDIR)),
                Content::Symlink(_) => return Err(Error::No(EINVAL)),
            }
            node.touch();
        }
        if valid.contains(SetAttrMask::MODE) {
            node.mode = FileMode::new(node.mode.typ, stat.mode);
        }
        if valid.contains(SetAttrMask::UID) {
            node.uid = stat.uid;
        }
        if valid.contains(SetAttrMask::GID) {
            node.gid = stat.gid;
        }
        if valid.contains(SetAttrMask::ATIME) {
            node.atime = if valid.contains(SetAttrMask::ATIME_SET) { stat.atime } else { now };
        }
        if valid.contains(SetAttrMask::MTIME) {
            node.mtime = if valid.contains(SetAttrMask::MTIME_SET) { stat.mtime } else { now };
        }
        node.ctime = now;
        Ok(())
    }

    async fn rreadlink(&self, fid: &Fid<Self::Fid>) -> Result<Rreadlink> {
        let path = fid.aux.path().await;
        let tree = self.tree.read().await;
        match tree.node(path)?.content {
            Content::Symlink(ref target) => Ok(Rreadlink {
                target: target.clone(),
            }),
            _ => Err(Error::No(EINVAL)),
        }
    }

    async fn rreaddir(&self, fid: &Fid<Self::Fid>, offset: u64, count: u32) -> Result<Rreaddir> {
        let path = fid.aux.path().await;
        let tree = self.tree.read().await;
        let node = tree.node(path)?;
        let children = node.children()?;

        let dot = [(".", path), ("..", node.parent)];
        let entries = dot
            .into_iter()
            .chain(children.iter().map(|(name, &p)| (name.as_str(), p)))
            .enumerate()
            .skip(offset as usize);

        let mut dirents = DirEntryData::new();
        for (i, (name, p)) in entries {
            let child = tree.node(p)?;
            dirents.push(DirEntry {
                qid: child.qid(p),
                offset: i as u64 + 1,
                typ: child.mode.typ.dirent_type(),
                name: name.to_owned(),
            });
            if dirents.size() >= count {
                break;
            }
        }

        let (data, _) = dirents.to_data(count);
        Ok(Rreaddir { data })
    }

    async fn rlopen(&self, fid: &Fid<Self::Fid>, flags: u32) -> Result<Rlopen> {
        let qid = self.open(fid, OpenFlags::from_posix(flags)).await?;
        Ok(Rlopen { qid, iounit: 0 })
    }

    async fn rlcreate(&self, fid: &Fid<Self::Fid>, name: &str, flags: u32, mode: u32, gid: u32) -> Result<Rlcreate> {
        let mode = FileMode::new(FileType::Regular, mode);
        let qid = self
            .create_file(fid, name, mode, OpenFlags::from_posix(flags), gid)
            .await?;
        Ok(Rlcreate { qid, iounit: 0 })
    }

    async fn rread(&self, fid: &Fid<Self::Fid>, offset: u64, count: u32) -> Result<Rread> {
        if !fid.aux.opened().await?.access.readable() {
            return Err(Error::No(EBADF));
        }
        let path = fid.aux.path().await;
        let tree = self.tree.read().await;
        let data = match tree.node(path)?.content {
            Content::File(ref data) => data,
            Content::Dir(_) => return Err(Error::No(EISDIR)),
            Content::Symlink(_) => return Err(Error::No(EINVAL)),
        };

        let start = (offset.min(data.len() as u64)) as usize;
        let end = start.saturating_add(count as usize).min(data.len());
        Ok(Rread {
            data: Data::from(data[start..end].to_vec()),
        })
    }

    async fn rwrite(&self, fid: &Fid<Self::Fid>, offset: u64, data: &Data) -> Result<Rwrite> {
        let flags = fid.aux.opened().await?;
        if !flags.access.writable() {
            return Err(Error::No(EBADF));
        }
        let path = fid.aux.path().await;
        let mut tree = self.tree.write().await;
        let node = tree.node_mut(path)?;
        let content = match node.content {
            Content::File(ref mut content) => content,
            _ => return Err(Error::No(EISDIR)),
        };

        let start = if flags.flags.contains(OpenFlag::APPEND) {
            content.len() as u64
        } else {
            offset
        };
        let end = start.checked_add(data.len() as u64).ok_or(Error::No(EFBIG))?;
        if (content.len() as u64) < end {
            resize_file(content, end)?;
        }
        let (start, end) = (start as usize, end as usize);
        content[start..end].copy_from_slice(data);
        node.touch();

        Ok(Rwrite {
            count: data.len() as u32,
        })
    }

    async fn rmkdir(&self, dfid: &Fid<Self::Fid>, name: &str, mode: u32, gid: u32) -> Result<Rmkdir> {
        let dir = dfid.aux.path().await;
        let mut tree = self.tree.write().await;
        let mode = FileMode::new(FileType::Directory, mode);
        let path = tree.create(dir, name, mode, gid, Content::Dir(BTreeMap::new()))?;
        Ok(Rmkdir {
            qid: tree.node(path)?.qid(path),
        })
    }

    async fn rsymlink(&self, fid: &Fid<Self::Fid>, name: &str, sym: &str, gid: u32) -> Result<Rsymlink> {
        let dir = fid.aux.path().await;
        let mut tree = self.tree.write().await;
        let mode = FileMode::new(FileType::Symlink, 0o777);
        let path = tree.create(dir, name, mode, gid, Content::Symlink(sym.to_owned()))?;
        Ok(Rsymlink {
            qid: tree.node(path)?.qid(path),
        })
    }

    async fn rrename(&self, fid: &Fid<Self::Fid>, dfid: &Fid<Self::Fid>, name: &str) -> Result<()> {
        let path = fid.aux.path().await;
        let newdir = dfid.aux.path().await;
        let mut tree = self.tree.write().await;
        let olddir = tree.node(path)?.parent;
        let oldname = tree.name_of(path)?;
        tree.rename(olddir, &oldname, newdir, name)
    }

    async fn rrenameat(&self, olddirfid: &Fid<Self::Fid>, oldname: &str, newdirfid: &Fid<Self::Fid>, newname: &str) -> Result<()> {
        let olddir = olddirfid.aux.path().await;
        let newdir = newdirfid.aux.path().await;
        self.tree
            .write()
            .await
            .rename(olddir, oldname, newdir, newname)
    }

    async fn runlinkat(&self, dirfid: &Fid<Self::Fid>, name: &str, flags: u32) -> Result<()> {
        let dir = dirfid.aux.path().await;
        let mut tree = self.tree.write().await;
        let path = tree.lookup(dir, name)?;
        let is_dir = tree.node(path)?.mode.is_dir();
        match (is_dir, flags & AT_REMOVEDIR != 0) {
            (true, false) => return Err(Error::No(EISDIR)),
            (false, true) => return Err(Error::No(ENOTDIR)),
            _ => {}
        }
        tree.unlink(dir, name, path)
    }

    async fn rremove(&self, fid: &Fid<Self::Fid>) -> Result<()> {
        let path = fid.aux.path().await;
        let mut tree = self.tree.write().await;
        if path == ROOT {
            return Err(Error::No(EBUSY));
        }
        let dir = tree.node(path)?.parent;
        let name = tree.name_of(path)?;
        tree.unlink(dir, &name, path)
    }

    async fn rfsync(&self, fid: &Fid<Self::Fid>, _datasync: bool) -> Result<()> {
        let path = fid.aux.path().await;
        self.tree.read().await.node(path)?;
        Ok(())
    }

    async fn rstatfs(&self, _: &Fid<Self::Fid>) -> Result<Rstatfs> {
        Ok(Rstatfs {
            statfs: self.tree.read().await.statfs(),
        })
    }

    async fn rclunk(&self, fid: &Fid<Self::Fid>) -> Result<()> {
        let path = fid.aux.path().await;
        if let Some(flags) = fid.aux.open.lock().await.take() {
            if flags.access.readable() {
                if let Ok(node) = self.tree.write().await.node_mut(path) {
                    node.atime = Time::now();
                }
            }
        }
        Ok(())
    }

    async fn ropen(&self, fid: &Fid<Self::Fid>, mode: u8) -> Result<Ropen> {
        let qid = self.open(fid, OpenFlags::from_p9_mode(mode)).await?;
        Ok(Ropen { qid, iounit: 0 })
    }

    async fn rcreate(&self, fid: &Fid<Self::Fid>, name: &str, perm: u32, mode: u8) -> Result<Rcreate> {
        let fmode = FileMode::from_dm(perm);
        let flags = OpenFlags::from_p9_mode(mode);
        let qid = match fmode.typ {
            FileType::Directory => {
                let dir = fid.aux.path().await;
                let path = {
                    let mut tree = self.tree.write().await;
                    tree.create(dir, name, fmode, 0, Content::Dir(BTreeMap::new()))?
                };
                fid.aux.set_path(path).await;
                self.open(fid, OpenFlags { access: AccessMode::ReadOnly, ..flags }).await?
            }
            _ => self.create_file(fid, name, fmode, flags, 0).await?,
        };
        Ok(Rcreate { qid, iounit: 0 })
    }

    async fn rstat(&self, fid: &Fid<Self::Fid>) -> Result<Rstat> {
        let path = fid.aux.path().await;
        let tree = self.tree.read().await;
        let node = tree.node(path)?;
        let name = if path == ROOT { "/".to_owned() } else { tree.name_of(path)? };

        Ok(Rstat {
            stat: p92000::Stat {
                typ: 0,
                dev: 0,
                qid: node.qid(path),
                mode: node.mode.to_dm(),
                atime: node.atime.sec as u32,
                mtime: node.mtime.sec as u32,
                length: if node.mode.is_dir() { 0 } else { node.size() },
                name,
                uid: node.uid.to_string(),
                gid: node.gid.to_string(),
                muid: node.uid.to_string(),
            },
        })
    }

    async fn rwstat(&self, fid: &Fid<Self::Fid>, stat: &p92000::Stat) -> Result<()> {
        let path = fid.aux.path().await;
        let mut tree = self.tree.write().await;

        // Fields set to all ones, or empty strings, are left alone.
        if !stat.name.is_empty() && path != ROOT {
            let dir = tree.node(path)?.parent;
            let oldname = tree.name_of(path)?;
            if oldname != stat.name {
                tree.rename(dir, &oldname, dir, &stat.name)?;
            }
        }

        let node = tree.node_mut(path)?;
        if stat.length != u64::MAX {
            match node.content {
                Content::File(ref mut data) => resize_file(data, stat.length)?,
                _ => return Err(Error::No(EISDIR)),
            }
            node.touch();
        }
        if stat.mode != u32::MAX {
            let mode = FileMode::from_dm(stat.mode);
            if mode.typ != node.mode.typ {
                return Err(Error::No(EINVAL));
            }
            node.mode = mode;
        }
        if stat.mtime != u32::MAX {
            node.mtime = Time {
                sec: stat.mtime as u64,
                nsec: 0,
            };
        }
        node.ctime = Time::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p9core::mode::posix;

    async fn attached(fs: &RamFs, fid: u32) -> Fid<RamFid> {
        let f = new_fid(fid);
        fs.rattach(&f, None, "test", "", 0).await.unwrap();
        f
    }

    fn new_fid(fid: u32) -> Fid<RamFid> {
        Fid::new(fid)
    }

    async fn walk(fs: &RamFs, from: &Fid<RamFid>, to: u32, names: &[&str]) -> Result<(Fid<RamFid>, Vec<Qid>)> {
        let new = new_fid(to);
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let r = fs.rwalk(from, &new, &names).await?;
        Ok((new, r.wqids))
    }

    #[tokio::test]
    async fn create_write_read() {
        let fs = RamFs::new(0, 0);
        let root = attached(&fs, 1).await;
        let (file, _) = walk(&fs, &root, 2, &[]).await.unwrap();

        let r = fs
            .rlcreate(&file, "greeting", posix::O_RDWR, 0o644, 0)
            .await
            .unwrap();
        assert_eq!(r.qid.typ, QidType::FILE);

        let w = fs.rwrite(&file, 0, &Data::from(b"hello world".to_vec())).await.unwrap();
        assert_eq!(w.count, 11);
        let w = fs.rwrite(&file, 6, &Data::from(b"there".to_vec())).await.unwrap();
        assert_eq!(w.count, 5);

        let r = fs.rread(&file, 0, 64).await.unwrap();
        assert_eq!(&r.data[..], b"hello there");
        let r = fs.rread(&file, 6, 2).await.unwrap();
        assert_eq!(&r.data[..], b"th");
        let r = fs.rread(&file, 100, 2).await.unwrap();
        assert!(r.data.is_empty());

        let attr = fs.rgetattr(&file, GetAttrMask::ALL).await.unwrap();
        assert_eq!(attr.stat.size, 11);
        assert_eq!(attr.stat.mode, posix::S_IFREG | 0o644);
        assert_eq!(attr.data_version, 2);
    }

    #[tokio::test]
    async fn io_requires_open() {
        let fs = RamFs::new(0, 0);
        let root = attached(&fs, 1).await;
        let (file, _) = walk(&fs, &root, 2, &[]).await.unwrap();
        fs.rlcreate(&file, "f", posix::O_WRONLY, 0o600, 0).await.unwrap();

        assert!(matches!(fs.rread(&file, 0, 1).await, Err(Error::No(EBADF))));

        let (other, _) = walk(&fs, &root, 3, &["f"]).await.unwrap();
        assert!(matches!(
            fs.rwrite(&other, 0, &Data::from(b"x".to_vec())).await,
            Err(Error::No(EBADF))
        ));
        fs.rlopen(&other, posix::O_RDONLY).await.unwrap();
        assert!(fs.rread(&other, 0, 1).await.is_ok());
    }

    #[tokio::test]
    async fn walk_stops_at_missing_name() {
        let fs = RamFs::new(0, 0);
        let root = attached(&fs, 1).await;
        fs.rmkdir(&root, "a", 0o755, 0).await.unwrap();

        let (_, qids) = walk(&fs, &root, 2, &["a", "missing"]).await.unwrap();
        assert_eq!(qids.len(), 1);
        assert_eq!(qids[0].typ, QidType::DIR);

        assert!(matches!(
            walk(&fs, &root, 3, &["missing"]).await,
            Err(Error::No(ENOENT))
        ));

        let (up, qids) = walk(&fs, &root, 4, &["a", ".."]).await.unwrap();
        assert_eq!(qids[1].path, ROOT);
        assert_eq!(up.aux.path().await, ROOT);
    }

    #[tokio::test]
    async fn readdir_resumes_at_cookie() {
        let fs = RamFs::new(0, 0);
        let root = attached(&fs, 1).await;
        for name in ["a", "b", "c"] {
            fs.rmkdir(&root, name, 0o755, 0).await.unwrap();
        }

        let all = fs.rreaddir(&root, 0, 8192).await.unwrap();
        let all = DirEntryData::from_data(&all.data).unwrap();
        let names: Vec<_> = all.data().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, [".", "..", "a", "b", "c"]);

        let rest = fs.rreaddir(&root, all.data()[2].offset, 8192).await.unwrap();
        let rest = DirEntryData::from_data(&rest.data).unwrap();
        let names: Vec<_> = rest.data().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["b", "c"]);

        // Room for exactly one entry.
        let one = fs.rreaddir(&root, 0, 25).await.unwrap();
        let one = DirEntryData::from_data(&one.data).unwrap();
        assert_eq!(one.data().len(), 1);
    }

    #[tokio::test]
    async fn qid_paths_are_not_reused() {
        let fs = RamFs::new(0, 0);
        let root = attached(&fs, 1).await;

        let first = fs.rmkdir(&root, "d", 0o755, 0).await.unwrap().qid;
        fs.runlinkat(&root, "d", AT_REMOVEDIR).await.unwrap();
        let second = fs.rmkdir(&root, "d", 0o755, 0).await.unwrap().qid;
        assert_ne!(first.path, second.path);
    }

    #[tokio::test]
    async fn unlink_checks_kind_and_emptiness() {
        let fs = RamFs::new(0, 0);
        let root = attached(&fs, 1).await;
        fs.rmkdir(&root, "d", 0o755, 0).await.unwrap();
        let (d, _) = walk(&fs, &root, 2, &["d"]).await.unwrap();
        fs.rsymlink(&d, "l", "/etc/passwd", 0).await.unwrap();

        assert!(matches!(fs.runlinkat(&root, "d", 0).await, Err(Error::No(EISDIR))));
        assert!(matches!(
            fs.runlinkat(&root, "d", AT_REMOVEDIR).await,
            Err(Error::No(ENOTEMPTY))
        ));
        assert!(matches!(
            fs.runlinkat(&d, "l", AT_REMOVEDIR).await,
            Err(Error::No(ENOTDIR))
        ));

        let (l, _) = walk(&fs, &d, 3, &["l"]).await.unwrap();
        assert_eq!(fs.rreadlink(&l).await.unwrap().target, "/etc/passwd");

        fs.runlinkat(&d, "l", 0).await.unwrap();
        fs.runlinkat(&root, "d", AT_REMOVEDIR).await.unwrap();
        assert!(matches!(fs.rreadlink(&l).await, Err(Error::No(ENOENT))));
    }

    #[tokio::test]
    async fn rename_moves_and_replaces() {
        let fs = RamFs::new(0, 0);
        let root = attached(&fs, 1).await;
        fs.rmkdir(&root, "src", 0o755, 0).await.unwrap();
        fs.rmkdir(&root, "dst", 0o755, 0).await.unwrap();
        let (src, _) = walk(&fs, &root, 2, &["src"]).await.unwrap();
        let (dst, _) = walk(&fs, &root, 3, &["dst"]).await.unwrap();

        let (f, _) = walk(&fs, &src, 4, &[]).await.unwrap();
        fs.rlcreate(&f, "f", posix::O_RDWR, 0o644, 0).await.unwrap();

        fs.rrenameat(&src, "f", &dst, "g").await.unwrap();
        assert!(walk(&fs, &dst, 5, &["g"]).await.is_ok());
        assert!(walk(&fs, &src, 6, &["f"]).await.is_err());

        // A directory cannot move below itself.
        assert!(matches!(
            fs.rrenameat(&root, "dst", &dst, "x").await,
            Err(Error::No(EINVAL))
        ));

        // Trename works on the fid itself.
        fs.rrename(&f, &root, "top").await.unwrap();
        let (_, qids) = walk(&fs, &root, 7, &["top"]).await.unwrap();
        assert_eq!(qids.len(), 1);
    }

    #[tokio::test]
    async fn setattr_truncates_and_sets_times() {
        let fs = RamFs::new(0, 0);
        let root = attached(&fs, 1).await;
        let (f, _) = walk(&fs, &root, 2, &[]).await.unwrap();
        fs.rlcreate(&f, "f", posix::O_RDWR, 0o644, 0).await.unwrap();
        fs.rwrite(&f, 0, &Data::from(b"abcdef".to_vec())).await.unwrap();

        let stat = SetAttr {
            mode: 0o600,
            size: 3,
            mtime: Time { sec: 7, nsec: 9 },
            ..Default::default()
        };
        let valid = SetAttrMask::MODE | SetAttrMask::SIZE | SetAttrMask::MTIME | SetAttrMask::MTIME_SET;
        fs.rsetattr(&f, valid, &stat).await.unwrap();

        let attr = fs.rgetattr(&f, GetAttrMask::ALL).await.unwrap();
        assert_eq!(attr.stat.size, 3);
        assert_eq!(attr.stat.mode, posix::S_IFREG | 0o600);
        assert_eq!(attr.stat.mtime, Time { sec: 7, nsec: 9 });

        assert!(matches!(
            fs.rsetattr(&root, SetAttrMask::SIZE, &stat).await,
            Err(Error::No(EISDIR))
        ));
    }

    #[tokio::test]
    async fn write_past_max_size_is_efbig() {
        let fs = RamFs::new(0, 0);
        let root = attached(&fs, 1).await;
        let (f, _) = walk(&fs, &root, 2, &[]).await.unwrap();
        fs.rlcreate(&f, "f", posix::O_RDWR, 0o644, 0).await.unwrap();
        let x = Data::from(b"x".to_vec());

        assert!(matches!(fs.rwrite(&f, u64::MAX / 2, &x).await, Err(Error::No(EFBIG))));
        assert!(matches!(fs.rwrite(&f, u64::MAX, &x).await, Err(Error::No(EFBIG))));
        assert!(matches!(fs.rwrite(&f, MAX_FILE_SIZE, &x).await, Err(Error::No(EFBIG))));

        let attr = fs.rgetattr(&f, GetAttrMask::ALL).await.unwrap();
        assert_eq!(attr.stat.size, 0);
        assert_eq!(fs.rwrite(&f, 4, &x).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn truncate_past_max_size_is_efbig() {
        let fs = RamFs::new(0, 0);
        let root = attached(&fs, 1).await;
        let (f, _) = walk(&fs, &root, 2, &[]).await.unwrap();
        fs.rlcreate(&f, "f", posix::O_RDWR, 0o644, 0).await.unwrap();

        let huge = SetAttr {
            size: MAX_FILE_SIZE + 1,
            ..Default::default()
        };
        assert!(matches!(
            fs.rsetattr(&f, SetAttrMask::SIZE, &huge).await,
            Err(Error::No(EFBIG))
        ));

        let mut st = fs.rstat(&f).await.unwrap().stat;
        st.name.clear();
        st.mode = u32::MAX;
        st.mtime = u32::MAX;
        st.length = u64::MAX - 1;
        assert!(matches!(fs.rwstat(&f, &st).await, Err(Error::No(EFBIG))));

        let attr = fs.rgetattr(&f, GetAttrMask::ALL).await.unwrap();
        assert_eq!(attr.stat.size, 0);
    }

    #[tokio::test]
    async fn legacy_stat_uses_plan9_bits() {
        let fs = RamFs::new(0, 0);
        let root = attached(&fs, 1).await;
        let st = fs.rstat(&root).await.unwrap().stat;
        assert_eq!(st.mode, p92000::dm::DIR | 0o755);
        assert_eq!(st.name, "/");

        let (f, _) = walk(&fs, &root, 2, &[]).await.unwrap();
        fs.rcreate(&f, "notes", 0o640, p92000::om::RDWR).await.unwrap();
        fs.rwrite(&f, 0, &Data::from(b"abc".to_vec())).await.unwrap();
        let st = fs.rstat(&f).await.unwrap().stat;
        assert_eq!(st.mode, 0o640);
        assert_eq!(st.length, 3);
        assert_eq!(st.name, "notes");
    }

    #[tokio::test]
    async fn statfs_counts_nodes() {
        let fs = RamFs::new(0, 0);
        let root = attached(&fs, 1).await;
        fs.rmkdir(&root, "a", 0o755, 0).await.unwrap();
        let st = fs.rstatfs(&root).await.unwrap().statfs;
        assert_eq!(st.files, 2);
        assert_eq!(st.typ, V9FS_MAGIC);
        assert_eq!(st.namelen, NAME_MAX);
    }
}
