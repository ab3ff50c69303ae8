//! Asynchronous server side 9P library.
//!
//! A [`Server`] accepts connections and runs one session per connection. A
//! session negotiates the version, then reads requests in a single loop and
//! hands each one to its own task, which calls into the [`Service`] and writes
//! the reply. Replies may go out in any order; they share one encoder.
//!
//! # Protocol
//! 9P2000.L, and 9P2000 when enabled in [`Config::dialects`]

use {
    crate::{
        error::{errno::*, Error, FrameError},
        fcall::*,
        framed::{MsgDecoder, MsgEncoder},
        serialize::Header,
        utils::{self, Result},
    },
    async_trait::async_trait,
    log::{debug, error, info, warn},
    std::{
        collections::{hash_map::Entry, HashMap},
        io,
        path::{Path, PathBuf},
        sync::{Arc, Mutex, PoisonError},
        time::Duration,
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, UnixListener},
    },
    tokio_stream::{
        wrappers::{TcpListenerStream, UnixListenerStream},
        Stream, StreamExt,
    },
    tokio_util::{sync::CancellationToken, task::TaskTracker},
};

/// Represents a fid of clients holding associated `Service::Fid`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Fid<T> {
    /// Raw client side fid.
    fid: u32,

    /// `Service::Fid` associated with this fid.
    /// Changing this value affects the continuous callbacks.
    pub aux: T,
}

impl<T> Fid<T> {
    /// Get the raw fid.
    pub fn fid(&self) -> u32 {
        self.fid
    }
}

impl<T: Default> Fid<T> {
    /// A fid with fresh service state, as the session creates it.
    pub fn new(fid: u32) -> Fid<T> {
        Fid {
            fid,
            aux: Default::default(),
        }
    }
}

#[async_trait]
/// Filesystem service trait for implementing 9P servers.
///
/// Every request other than Tversion and Tflush is routed to one of these
/// methods after the session has resolved its fids. Implementors represent an
/// error condition by returning an `Err`; the session turns it into `Rlerror`
/// (9P2000.L) or `Rerror` (9P2000). Otherwise they return the reply record.
///
/// # Error Handling
/// All methods should return `Err(Error::No(errno))` to send an error to the client.
/// Common errno values include:
/// - `ENOENT` - File not found
/// - `EACCES` - Permission denied
/// - `EISDIR` - Is a directory (when file expected)
/// - `ENOTDIR` - Not a directory (when directory expected)
///
/// # Concurrency
/// Methods are called concurrently, also for the same fid. The session never
/// has two requests with the same tag outstanding.
///
/// # Fid Management
///
/// The session owns the fid table. A new fid (attach, auth, walk, xattrwalk)
/// is handed to the service with a default `aux`, which the service fills
/// through interior mutability; the fid is installed only if the call
/// succeeds. Tclunk and Tremove drop the fid whatever the service returns,
/// and its `aux` is dropped once no request holds it any more.
///
/// # Example
/// ```no_run
/// use p9core::{error::{Error, errno::*}, fcall::*, srv::{Fid, Service}};
/// use async_trait::async_trait;
///
/// struct Empty;
///
/// #[async_trait]
/// impl Service for Empty {
///     type Fid = ();
///
///     async fn rattach(&self,
///                      _: &Fid<()>,
///                      _afid: Option<&Fid<()>>,
///                      _uname: &str,
///                      _aname: &str,
///                      _n_uname: u32,
///     ) -> p9core::Result<Rattach> {
///         Ok(Rattach { qid: Qid { typ: QidType::DIR, version: 0, path: 0 } })
///     }
/// }
/// ```
pub trait Service: Send + Sync {
    /// User defined fid type to be associated with a client's fid.
    type Fid: Send + Sync + Default;

    /// Set up an authentication fid.
    ///
    /// Legacy Tauth arrives here with `n_uname = NONUNAME`.
    async fn rauth(
        &self,
        _afid: &Fid<Self::Fid>,
        _uname: &str,
        _aname: &str,
        _n_uname: u32,
    ) -> Result<Rauth> {
        Err(Error::No(EOPNOTSUPP))
    }

    /// Attach to the filesystem root.
    ///
    /// This is the first operation performed by a client after version
    /// negotiation. It associates `fid` with the root of the tree named by
    /// `aname`. Legacy Tattach arrives here with `n_uname = NONUNAME`.
    ///
    /// # Arguments
    /// * `fid` - The fid to associate with the filesystem root
    /// * `afid` - Authentication fid, `None` for `NOFID`
    /// * `uname` - The user name
    /// * `aname` - The file tree to access (often "/" or empty)
    /// * `n_uname` - Numeric user ID
    async fn rattach(
        &self,
        _: &Fid<Self::Fid>,
        _afid: Option<&Fid<Self::Fid>>,
        _uname: &str,
        _aname: &str,
        _n_uname: u32,
    ) -> Result<Rattach> {
        Err(Error::No(EOPNOTSUPP))
    }

    /// Notified when a Tflush names a request that is still running, just
    /// before that request is abandoned.
    async fn rflush(&self, _old: Option<&Fcall>) -> Result<()> {
        Ok(())
    }

    /// Walk the directory tree.
    ///
    /// Returns one qid per name walked. A shorter list than `wnames` means
    /// the walk stopped early; `newfid` is then not created. An empty
    /// `wnames` clones `fid` into `newfid`.
    async fn rwalk(
        &self,
        _: &Fid<Self::Fid>,
        _new: &Fid<Self::Fid>,
        _wnames: &[String],
    ) -> Result<Rwalk> {
        Err(Error::No(EOPNOTSUPP))
    }

    /// Read from an open fid. `count` is already clamped to the iounit.
    async fn rread(&self, _: &Fid<Self::Fid>, _offset: u64, _count: u32) -> Result<Rread> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rwrite(&self, _: &Fid<Self::Fid>, _offset: u64, _data: &Data) -> Result<Rwrite> {
        Err(Error::No(EOPNOTSUPP))
    }

    /// Release per-fid resources. The fid is gone from the table already.
    async fn rclunk(&self, _: &Fid<Self::Fid>) -> Result<()> {
        Ok(())
    }

    /// Remove the file and clunk the fid.
    async fn rremove(&self, _: &Fid<Self::Fid>) -> Result<()> {
        Err(Error::No(EOPNOTSUPP))
    }

    // 9P2000.L

    async fn rstatfs(&self, _: &Fid<Self::Fid>) -> Result<Rstatfs> {
        Err(Error::No(EOPNOTSUPP))
    }

    /// Open a file with Linux `open(2)` flags.
    ///
    /// An `iounit` of zero is replaced by the session's maximum.
    async fn rlopen(&self, _: &Fid<Self::Fid>, _flags: u32) -> Result<Rlopen> {
        Err(Error::No(EOPNOTSUPP))
    }

    /// Create and open a file in the directory `fid`, which then refers to
    /// the new file.
    async fn rlcreate(
        &self,
        _: &Fid<Self::Fid>,
        _name: &str,
        _flags: u32,
        _mode: u32,
        _gid: u32,
    ) -> Result<Rlcreate> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rsymlink(
        &self,
        _: &Fid<Self::Fid>,
        _name: &str,
        _sym: &str,
        _gid: u32,
    ) -> Result<Rsymlink> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rmknod(
        &self,
        _: &Fid<Self::Fid>,
        _name: &str,
        _mode: u32,
        _major: u32,
        _minor: u32,
        _gid: u32,
    ) -> Result<Rmknod> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rrename(&self, _: &Fid<Self::Fid>, _: &Fid<Self::Fid>, _name: &str) -> Result<()> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rreadlink(&self, _: &Fid<Self::Fid>) -> Result<Rreadlink> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rgetattr(&self, _: &Fid<Self::Fid>, _req_mask: GetAttrMask) -> Result<Rgetattr> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rsetattr(
        &self,
        _: &Fid<Self::Fid>,
        _valid: SetAttrMask,
        _stat: &SetAttr,
    ) -> Result<()> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rxattrwalk(
        &self,
        _: &Fid<Self::Fid>,
        _: &Fid<Self::Fid>,
        _name: &str,
    ) -> Result<Rxattrwalk> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rxattrcreate(
        &self,
        _: &Fid<Self::Fid>,
        _name: &str,
        _attr_size: u64,
        _flags: u32,
    ) -> Result<()> {
        Err(Error::No(EOPNOTSUPP))
    }

    /// Read directory entries starting after the `offset` cookie.
    ///
    /// The reply payload must not exceed `count`; see
    /// [`DirEntryData::to_data`].
    async fn rreaddir(&self, _: &Fid<Self::Fid>, _offset: u64, _count: u32) -> Result<Rreaddir> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rfsync(&self, _: &Fid<Self::Fid>, _datasync: bool) -> Result<()> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rlock(&self, _: &Fid<Self::Fid>, _lock: &Flock) -> Result<Rlock> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rgetlock(&self, _: &Fid<Self::Fid>, _lock: &Getlock) -> Result<Rgetlock> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rlink(&self, _: &Fid<Self::Fid>, _: &Fid<Self::Fid>, _name: &str) -> Result<()> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rmkdir(
        &self,
        _: &Fid<Self::Fid>,
        _name: &str,
        _mode: u32,
        _gid: u32,
    ) -> Result<Rmkdir> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rrenameat(
        &self,
        _: &Fid<Self::Fid>,
        _oldname: &str,
        _: &Fid<Self::Fid>,
        _newname: &str,
    ) -> Result<()> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn runlinkat(&self, _: &Fid<Self::Fid>, _name: &str, _flags: u32) -> Result<()> {
        Err(Error::No(EOPNOTSUPP))
    }

    /*
     * 9P2000 only
     */

    /// Open with a Plan 9 mode byte, see [`p92000::om`].
    async fn ropen(&self, _: &Fid<Self::Fid>, _mode: u8) -> Result<Ropen> {
        Err(Error::No(EOPNOTSUPP))
    }

    /// Create with Plan 9 `DM*` permission bits.
    async fn rcreate(
        &self,
        _: &Fid<Self::Fid>,
        _name: &str,
        _perm: u32,
        _mode: u8,
    ) -> Result<Rcreate> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rstat(&self, _: &Fid<Self::Fid>) -> Result<Rstat> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rwstat(&self, _: &Fid<Self::Fid>, _stat: &p92000::Stat) -> Result<()> {
        Err(Error::No(EOPNOTSUPP))
    }
}

/// Server side settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Largest msize offered to clients.
    pub msize: u32,
    /// Dialects accepted in Tversion.
    pub dialects: Vec<Dialect>,
    /// Fids a single session may hold.
    pub max_fids: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            msize: DEFAULT_MSIZE,
            dialects: vec![Dialect::P92000L],
            max_fids: 65536,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_MSIZE..=MAX_MSIZE).contains(&self.msize) {
            return res!(io_err!(
                InvalidInput,
                format!("msize must be within [{}, {}]", MIN_MSIZE, MAX_MSIZE)
            ));
        }
        if self.dialects.is_empty() {
            return res!(io_err!(InvalidInput, "no protocol dialect enabled"));
        }
        if self.max_fids == 0 {
            return res!(io_err!(InvalidInput, "max_fids must be positive"));
        }
        Ok(())
    }
}

/// Pick the dialect for a client version string.
///
/// An unsupported `9P2000.x` falls back to plain 9P2000 when that is enabled.
fn negotiate(version: &str, dialects: &[Dialect]) -> Option<Dialect> {
    if let Some(dialect) = Dialect::from_version(version) {
        if dialects.contains(&dialect) {
            return Some(dialect);
        }
    }

    let extended = version
        .strip_prefix(P92000)
        .is_some_and(|rest| rest.starts_with('.'));
    if extended && dialects.contains(&Dialect::P92000) {
        return Some(Dialect::P92000);
    }
    None
}

/// Error reply in the session's dialect.
fn error_reply(dialect: Dialect, e: &Error) -> Fcall {
    let errno = e.errno();
    match dialect {
        Dialect::P92000L => Rlerror {
            ecode: errno as u32,
        }
        .into(),
        Dialect::P92000 => Rerror {
            ename: errno.desc().to_owned(),
        }
        .into(),
    }
}

/// Read and answer Tversion. `None` if the connection is done afterwards.
async fn handshake<R, W>(
    config: &Config,
    decoder: &mut MsgDecoder<R>,
    encoder: &mut MsgEncoder<W>,
) -> Result<Option<(u32, Dialect)>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let header = match decoder.read_header().await? {
        Some(header) => header,
        None => return Ok(None),
    };
    let msg = decoder.read_body(&header).await?;
    debug!("\t← {:?}", msg);

    let tversion = match msg.body {
        Fcall::Tversion(t) => t,
        other => {
            warn!("expected Tversion, got {}", other.name());
            return res!(EINVAL);
        }
    };
    if msg.tag != NOTAG {
        warn!("Tversion with tag {}", msg.tag);
    }

    let msize = tversion.msize.min(config.msize);
    if msize < MIN_MSIZE {
        warn!("client msize {} below {}", tversion.msize, MIN_MSIZE);
        return res!(EINVAL);
    }

    let dialect = negotiate(&tversion.version, &config.dialects);
    let reply = Msg {
        tag: msg.tag,
        body: Rversion {
            msize,
            version: dialect
                .map_or(VERSION_UNKNOWN, |d| d.as_str())
                .to_owned(),
        }
        .into(),
    };
    encoder.write_msg(&reply).await?;
    debug!("\t→ {:?}", reply);

    match dialect {
        Some(dialect) => {
            decoder.set_msize(msize)?;
            decoder.set_dialect(dialect);
            encoder.set_msize(msize)?;
            info!("negotiated {} with msize {}", dialect, msize);
            Ok(Some((msize, dialect)))
        }
        None => {
            info!("rejected version {:?}", tversion.version);
            Ok(None)
        }
    }
}

struct InFlight {
    cancel: CancellationToken,
    done: CancellationToken,
    request: Arc<Msg>,
}

/// Per-connection state shared by the read loop and the request tasks.
struct Session<S: Service, W> {
    service: Arc<S>,
    dialect: Dialect,
    msize: u32,
    max_fids: usize,
    fids: Mutex<HashMap<u32, Arc<Fid<S::Fid>>>>,
    inflight: Mutex<HashMap<u16, InFlight>>,
    encoder: tokio::sync::Mutex<MsgEncoder<W>>,
    token: CancellationToken,
}

impl<S, W> Session<S, W>
where
    S: Service + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    fn iounit(&self) -> u32 {
        self.msize - FIXED_READ_WRITE_LEN
    }

    fn fill_iounit(&self, iounit: u32) -> u32 {
        if iounit == 0 { self.iounit() } else { iounit }
    }

    fn fid(&self, fid: u32) -> Result<Arc<Fid<S::Fid>>> {
        let fids = self.fids.lock().unwrap_or_else(PoisonError::into_inner);
        fids.get(&fid).cloned().ok_or(Error::No(EBADF))
    }

    /// A fresh fid for `fid`, which must not be in use yet.
    fn new_fid(&self, fid: u32) -> Result<Fid<S::Fid>> {
        let fids = self.fids.lock().unwrap_or_else(PoisonError::into_inner);
        if fid == NOFID || fids.contains_key(&fid) {
            return res!(EBADF);
        }
        if fids.len() >= self.max_fids {
            return res!(EMFILE);
        }
        Ok(Fid::new(fid))
    }

    /// Install `fid` unless a concurrent request took the slot meanwhile.
    fn install(&self, fid: Fid<S::Fid>) -> Result<()> {
        let mut fids = self.fids.lock().unwrap_or_else(PoisonError::into_inner);
        match fids.entry(fid.fid) {
            Entry::Occupied(_) => res!(EBADF),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(fid));
                Ok(())
            }
        }
    }

    /// Install `fid`, dropping whatever it replaces.
    fn replace(&self, fid: Fid<S::Fid>) {
        let mut fids = self.fids.lock().unwrap_or_else(PoisonError::into_inner);
        fids.insert(fid.fid, Arc::new(fid));
    }

    fn take_fid(&self, fid: u32) -> Result<Arc<Fid<S::Fid>>> {
        let mut fids = self.fids.lock().unwrap_or_else(PoisonError::into_inner);
        fids.remove(&fid).ok_or(Error::No(EBADF))
    }

    async fn auth(&self, afid: u32, uname: &str, aname: &str, n_uname: u32) -> Result<Rauth> {
        let afid = self.new_fid(afid)?;
        let reply = self.service.rauth(&afid, uname, aname, n_uname).await?;
        self.install(afid)?;
        Ok(reply)
    }

    async fn attach(
        &self,
        fid: u32,
        afid: u32,
        uname: &str,
        aname: &str,
        n_uname: u32,
    ) -> Result<Rattach> {
        let newfid = self.new_fid(fid)?;
        let afid = match afid {
            NOFID => None,
            afid => Some(self.fid(afid)?),
        };
        let reply = self
            .service
            .rattach(&newfid, afid.as_deref(), uname, aname, n_uname)
            .await?;
        self.install(newfid)?;
        Ok(reply)
    }

    async fn walk(&self, t: &Twalk) -> Result<Rwalk> {
        if t.wnames.len() > MAX_WALK_NAMES {
            return res!(FrameError::MaxWalkElements);
        }
        let fid = self.fid(t.fid)?;
        let newfid = if t.newfid == t.fid {
            Fid::new(t.newfid)
        } else {
            self.new_fid(t.newfid)?
        };

        let reply = self.service.rwalk(&fid, &newfid, &t.wnames).await?;
        if reply.wqids.len() > t.wnames.len() {
            return res!(EIO);
        }
        if !t.wnames.is_empty() && reply.wqids.is_empty() {
            return res!(ENOENT);
        }
        if reply.wqids.len() == t.wnames.len() {
            if t.newfid == t.fid {
                self.replace(newfid);
            } else {
                self.install(newfid)?;
            }
        }
        Ok(reply)
    }

    async fn xattrwalk(&self, t: &Txattrwalk) -> Result<Rxattrwalk> {
        let fid = self.fid(t.fid)?;
        let newfid = self.new_fid(t.newfid)?;
        let reply = self.service.rxattrwalk(&fid, &newfid, &t.name).await?;
        self.install(newfid)?;
        Ok(reply)
    }

    /// Cancel the request tagged `oldtag` and wait until it has either
    /// replied or given up.
    async fn flush(&self, oldtag: u16) {
        let target = {
            let inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            inflight
                .get(&oldtag)
                .map(|f| (f.cancel.clone(), f.done.clone(), f.request.clone()))
        };

        if let Some((cancel, done, request)) = target {
            if let Err(e) = self.service.rflush(Some(&request.body)).await {
                warn!("rflush for tag {}: {}", oldtag, e);
            }
            cancel.cancel();
            done.cancelled().await;
        }
    }

    #[rustfmt::skip]
    async fn dispatch(&self, body: &Fcall) -> Result<Fcall> {
        let fs = &*self.service;
        let get_fid = |fid: u32| self.fid(fid);

        let reply: Fcall = match *body {
            Fcall::Tauth(ref t)        => self.auth(t.afid, &t.uname, &t.aname, NONUNAME).await?.into(),
            Fcall::Tlauth(ref t)       => self.auth(t.afid, &t.uname, &t.aname, t.n_uname).await?.into(),
            Fcall::Tattach(ref t)      => self.attach(t.fid, t.afid, &t.uname, &t.aname, NONUNAME).await?.into(),
            Fcall::Tlattach(ref t)     => self.attach(t.fid, t.afid, &t.uname, &t.aname, t.n_uname).await?.into(),
            Fcall::Tflush(ref t)       => { self.flush(t.oldtag).await; Rflush.into() }
            Fcall::Twalk(ref t)        => self.walk(t).await?.into(),
            Fcall::Tread(ref t)        => fs.rread(&*get_fid(t.fid)?, t.offset, t.count.min(self.iounit())).await?.into(),
            Fcall::Twrite(ref t)       => fs.rwrite(&*get_fid(t.fid)?, t.offset, &t.data).await?.into(),
            Fcall::Tclunk(ref t)       => { fs.rclunk(&*self.take_fid(t.fid)?).await?; Rclunk.into() }
            Fcall::Tremove(ref t)      => { fs.rremove(&*self.take_fid(t.fid)?).await?; Rremove.into() }
            Fcall::Topen(ref t)        => {
                let r = fs.ropen(&*get_fid(t.fid)?, t.mode).await?;
                Ropen { iounit: self.fill_iounit(r.iounit), ..r }.into()
            }
            Fcall::Tcreate(ref t)      => {
                let r = fs.rcreate(&*get_fid(t.fid)?, &t.name, t.perm, t.mode).await?;
                Rcreate { iounit: self.fill_iounit(r.iounit), ..r }.into()
            }
            Fcall::Tstat(ref t)        => fs.rstat(&*get_fid(t.fid)?).await?.into(),
            Fcall::Twstat(ref t)       => { fs.rwstat(&*get_fid(t.fid)?, &t.stat).await?; Rwstat.into() }
            Fcall::Tstatfs(ref t)      => fs.rstatfs(&*get_fid(t.fid)?).await?.into(),
            Fcall::Tlopen(ref t)       => {
                let r = fs.rlopen(&*get_fid(t.fid)?, t.flags).await?;
                Rlopen { iounit: self.fill_iounit(r.iounit), ..r }.into()
            }
            Fcall::Tlcreate(ref t)     => {
                let r = fs.rlcreate(&*get_fid(t.fid)?, &t.name, t.flags, t.mode, t.gid).await?;
                Rlcreate { iounit: self.fill_iounit(r.iounit), ..r }.into()
            }
            Fcall::Tsymlink(ref t)     => fs.rsymlink(&*get_fid(t.fid)?, &t.name, &t.symtgt, t.gid).await?.into(),
            Fcall::Tmknod(ref t)       => fs.rmknod(&*get_fid(t.dfid)?, &t.name, t.mode, t.major, t.minor, t.gid).await?.into(),
            Fcall::Trename(ref t)      => { fs.rrename(&*get_fid(t.fid)?, &*get_fid(t.dfid)?, &t.name).await?; Rrename.into() }
            Fcall::Treadlink(ref t)    => fs.rreadlink(&*get_fid(t.fid)?).await?.into(),
            Fcall::Tgetattr(ref t)     => fs.rgetattr(&*get_fid(t.fid)?, t.req_mask).await?.into(),
            Fcall::Tsetattr(ref t)     => { fs.rsetattr(&*get_fid(t.fid)?, t.valid, &t.stat).await?; Rsetattr.into() }
            Fcall::Txattrwalk(ref t)   => self.xattrwalk(t).await?.into(),
            Fcall::Txattrcreate(ref t) => { fs.rxattrcreate(&*get_fid(t.fid)?, &t.name, t.attr_size, t.flags).await?; Rxattrcreate.into() }
            Fcall::Treaddir(ref t)     => fs.rreaddir(&*get_fid(t.fid)?, t.offset, t.count.min(self.iounit())).await?.into(),
            Fcall::Tfsync(ref t)       => { fs.rfsync(&*get_fid(t.fid)?, t.datasync != 0).await?; Rfsync.into() }
            Fcall::Tlock(ref t)        => fs.rlock(&*get_fid(t.fid)?, &t.flock).await?.into(),
            Fcall::Tgetlock(ref t)     => fs.rgetlock(&*get_fid(t.fid)?, &t.flock).await?.into(),
            Fcall::Tlink(ref t)        => { fs.rlink(&*get_fid(t.dfid)?, &*get_fid(t.fid)?, &t.name).await?; Rlink.into() }
            Fcall::Tmkdir(ref t)       => fs.rmkdir(&*get_fid(t.dfid)?, &t.name, t.mode, t.gid).await?.into(),
            Fcall::Trenameat(ref t)    => { fs.rrenameat(&*get_fid(t.olddirfid)?, &t.oldname, &*get_fid(t.newdirfid)?, &t.newname).await?; Rrenameat.into() }
            Fcall::Tunlinkat(ref t)    => { fs.runlinkat(&*get_fid(t.dirfd)?, &t.name, t.flags).await?; Runlinkat.into() }
            Fcall::Tversion(_)         => return res!(EINVAL),
            ref other                  => return res!(Error::UnexpectedMessage(other.msg_type())),
        };

        Ok(reply)
    }

    /// Write a reply for `tag`, retiring the request under the writer lock so
    /// the tag cannot be seen as busy once the client has the reply.
    async fn reply(&self, tag: u16, body: Fcall) {
        let mut encoder = self.encoder.lock().await;
        self.retire(tag);

        let msg = Msg { tag, body };
        let result = match encoder.write_msg(&msg).await {
            Err(Error::Frame(e @ (FrameError::MessageTooLarge { .. } | FrameError::DataTooLarge))) => {
                warn!("{} does not fit: {}", msg, e);
                let body = error_reply(self.dialect, &Error::Frame(e));
                encoder.write_msg(&Msg { tag, body }).await
            }
            r => r,
        };

        match result {
            Ok(()) => debug!("\t→ {:?}", msg),
            Err(e) => {
                error!("Failed to send response for tag {}: {}", tag, e);
                self.token.cancel();
            }
        }
    }

    fn retire(&self, tag: u16) {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tag);
    }

    async fn handle(self: Arc<Self>, msg: Arc<Msg>, cancel: CancellationToken, done: CancellationToken) {
        // A panicking service method must still retire its tag and reply.
        let mut work = tokio::spawn({
            let session = self.clone();
            let msg = msg.clone();
            async move { session.dispatch(&msg.body).await }
        });

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                work.abort();
                None
            }
            r = &mut work => Some(r.unwrap_or_else(|e| {
                error!("{} failed: {}", msg, e);
                Err(Error::No(EIO))
            })),
        };

        match result {
            Some(Ok(body)) => self.reply(msg.tag, body).await,
            Some(Err(e)) => {
                debug!("{}: {}", msg, e);
                self.reply(msg.tag, error_reply(self.dialect, &e)).await;
            }
            None => {
                debug!("{} abandoned", msg);
                self.retire(msg.tag);
            }
        }
        done.cancel();
    }

    /// Register `msg` and run it on its own task.
    fn spawn(self: &Arc<Self>, tracker: &TaskTracker, msg: Msg) {
        let tag = msg.tag;
        let msg = Arc::new(msg);
        let cancel = self.token.child_token();
        let done = CancellationToken::new();
        {
            let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            match inflight.entry(tag) {
                Entry::Occupied(_) => {
                    warn!("tag {} is already in flight, dropping {}", tag, msg);
                    return;
                }
                Entry::Vacant(slot) => {
                    slot.insert(InFlight {
                        cancel: cancel.clone(),
                        done: done.clone(),
                        request: msg.clone(),
                    });
                }
            }
        }

        tracker.spawn(self.clone().handle(msg, cancel, done));
    }
}

async fn read_request<R>(decoder: &mut MsgDecoder<R>) -> Result<Option<(Header, Result<Msg>)>>
where
    R: AsyncRead + Unpin,
{
    match decoder.read_header().await? {
        Some(header) => {
            let msg = decoder.read_body(&header).await;
            Ok(Some((header, msg)))
        }
        None => Ok(None),
    }
}

/// Run one session over a byte stream until the peer hangs up, a fatal error
/// occurs or `token` is cancelled. Waits for all request tasks before
/// returning.
pub async fn serve_conn<S, R, W>(
    service: Arc<S>,
    config: &Config,
    reader: R,
    writer: W,
    token: CancellationToken,
) -> Result<()>
where
    S: Service + 'static,
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut decoder = MsgDecoder::new(reader);
    let mut encoder = MsgEncoder::new(writer);

    let (msize, dialect) = tokio::select! {
        _ = token.cancelled() => return Ok(()),
        r = handshake(config, &mut decoder, &mut encoder) => match r? {
            Some(negotiated) => negotiated,
            None => return Ok(()),
        },
    };

    let session = Arc::new(Session {
        service,
        dialect,
        msize,
        max_fids: config.max_fids,
        fids: Mutex::new(HashMap::new()),
        inflight: Mutex::new(HashMap::new()),
        encoder: tokio::sync::Mutex::new(encoder),
        token,
    });
    let tracker = TaskTracker::new();

    let result = loop {
        let next = tokio::select! {
            _ = session.token.cancelled() => break Ok(()),
            next = read_request(&mut decoder) => next,
        };

        let (header, msg) = match next {
            Ok(Some(next)) => next,
            Ok(None) => {
                info!("peer closed the stream, waiting for {} requests", tracker.len());
                tracker.close();
                tracker.wait().await;
                break Ok(());
            }
            Err(e) => break Err(e),
        };

        let msg = match msg {
            Ok(msg) => msg,
            Err(Error::Frame(e)) if e.is_recoverable() => {
                warn!("bad frame with tag {}: {}", header.tag, e);
                session
                    .reply(header.tag, error_reply(dialect, &Error::Frame(e)))
                    .await;
                continue;
            }
            Err(e) => break Err(e),
        };
        debug!("\t← {:?}", msg);

        session.spawn(&tracker, msg);
    };

    session.token.cancel();
    tracker.close();
    tracker.wait().await;

    if let Err(ref e) = result {
        error!("session ended: {}", e);
    }
    result
}

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts connections and serves a [`Service`] on each of them.
pub struct Server<S> {
    service: Arc<S>,
    config: Arc<Config>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl<S> Clone for Server<S> {
    fn clone(&self) -> Self {
        Server {
            service: self.service.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
            tracker: self.tracker.clone(),
        }
    }
}

/// Removes a unix socket file when the listener goes away.
struct DeleteOnDrop {
    path: PathBuf,
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        // There's no way to return a useful error here
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

impl<S: Service + 'static> Server<S> {
    pub fn new(service: S, config: Config) -> Result<Server<S>> {
        config.validate()?;
        Ok(Server {
            service: Arc::new(service),
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop accepting, cancel every session and its requests.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Serve a single already-connected stream.
    pub async fn serve_conn<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        serve_conn(
            self.service.clone(),
            &self.config,
            reader,
            writer,
            self.shutdown.child_token(),
        )
        .await
    }

    async fn accept<L, T, R, W, F>(&self, mut incoming: L, split: F) -> Result<()>
    where
        L: Stream<Item = io::Result<T>> + Unpin,
        F: Fn(T) -> (R, W),
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        loop {
            let stream = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                s = incoming.next() => match s {
                    Some(Ok(s)) => s,
                    Some(Err(e)) => {
                        // EMFILE and friends go away once sessions end
                        error!("accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                    None => break,
                },
            };

            let (reader, writer) = split(stream);
            let server = self.clone();
            self.tracker.spawn(async move {
                // session errors are logged by the session
                let _ = server.serve_conn(reader, writer).await;
            });
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!("Server shutdown complete");
        Ok(())
    }

    pub async fn serve_tcp(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("listening on {}", listener.local_addr()?);

        self.accept(TcpListenerStream::new(listener), |stream| {
            if let Ok(peer) = stream.peer_addr() {
                info!("accepted: {:?}", peer);
            }
            stream.into_split()
        })
        .await
    }

    pub async fn serve_unix(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_owned();
        let listener = UnixListener::bind(&path)?;
        let _guard = DeleteOnDrop { path: path.clone() };
        info!("listening on {:?}", path);

        self.accept(UnixListenerStream::new(listener), |stream| {
            info!("accepted: {:?}", stream.peer_addr().ok());
            stream.into_split()
        })
        .await
    }

    /// Serve on a `proto!address!port` address, `tcp` or `unix`.
    pub async fn serve(&self, addr: &str) -> Result<()> {
        let (proto, listen_addr) = utils::resolve_addr(addr)
            .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

        match proto {
            "tcp" => self.serve_tcp(&listen_addr).await,
            "unix" => self.serve_unix(&listen_addr).await,
            _ => res!(io_err!(InvalidInput, "Protocol not supported")),
        }
    }
}

/// Serve `service` with default settings on a `proto!address!port` address.
pub async fn srv_async<S>(service: S, addr: &str) -> Result<()>
where
    S: Service + 'static,
{
    Server::new(service, Config::default())?.serve(addr).await
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;

    #[async_trait]
    impl Service for Nothing {
        type Fid = ();
    }

    #[test]
    fn version_negotiation() {
        let linux = [Dialect::P92000L];
        let both = [Dialect::P92000L, Dialect::P92000];

        assert_eq!(negotiate("9P2000.L", &linux), Some(Dialect::P92000L));
        assert_eq!(negotiate("9P2000", &linux), None);
        assert_eq!(negotiate("9P2000.u", &linux), None);
        assert_eq!(negotiate("9PXYZ", &both), None);

        assert_eq!(negotiate("9P2000", &both), Some(Dialect::P92000));
        assert_eq!(negotiate("9P2000.u", &both), Some(Dialect::P92000));
        assert_eq!(negotiate("9P2000.L", &[Dialect::P92000]), Some(Dialect::P92000));
        assert_eq!(negotiate("9P2000u", &both), None);
    }

    #[test]
    fn config_validation() {
        assert!(Config::default().validate().is_ok());

        let small = Config {
            msize: MIN_MSIZE - 1,
            ..Default::default()
        };
        assert!(small.validate().is_err());

        let none = Config {
            dialects: vec![],
            ..Default::default()
        };
        assert!(none.validate().is_err());
    }

    #[test]
    fn errors_follow_dialect() {
        let e = Error::No(ENOENT);
        assert_eq!(
            error_reply(Dialect::P92000L, &e),
            Fcall::Rlerror(Rlerror {
                ecode: ENOENT as u32
            })
        );
        assert_eq!(
            error_reply(Dialect::P92000, &e),
            Fcall::Rerror(Rerror {
                ename: ENOENT.desc().to_owned()
            })
        );
    }

    #[tokio::test]
    async fn accept_survives_transient_errors() {
        let server = Server::new(Nothing, Config::default()).unwrap();
        let (near, far) = tokio::io::duplex(1 << 16);
        let incoming = tokio_stream::iter(vec![
            Err(io::Error::from_raw_os_error(EMFILE as i32)),
            Ok(far),
        ]);
        let accepting = tokio::spawn({
            let server = server.clone();
            async move { server.accept(incoming, tokio::io::split).await }
        });

        let (r, w) = tokio::io::split(near);
        let mut dec = MsgDecoder::new(r);
        let mut enc = MsgEncoder::new(w);
        let tversion = Msg {
            tag: NOTAG,
            body: Tversion {
                msize: 8192,
                version: "9P2000.L".to_owned(),
            }
            .into(),
        };
        enc.write_msg(&tversion).await.unwrap();
        let reply = dec.read_msg().await.unwrap().unwrap();
        assert!(matches!(reply.body, Fcall::Rversion(_)));

        drop((dec, enc));
        accepting.await.unwrap().unwrap();
    }
}
