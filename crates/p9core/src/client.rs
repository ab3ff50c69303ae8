//! Asynchronous client side 9P library.
//!
//! A [`Client`] owns one connection. Requests from any number of tasks are
//! multiplexed over it by tag; a background task reads replies and routes
//! each one to the caller waiting on that tag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, FrameError};
use crate::fcall::*;
use crate::framed::{MsgDecoder, MsgEncoder};
use crate::pool::Pool;
use crate::utils::{self, Result};

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Client side settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// msize offered in Tversion.
    pub msize: u32,
    /// Dialect requested in Tversion.
    pub dialect: Dialect,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            msize: DEFAULT_MSIZE,
            dialect: Dialect::P92000L,
        }
    }
}

struct PendingCall {
    seq: u64,
    reply: oneshot::Sender<Result<Fcall>>,
    /// Tag of the request this Tflush cancels.
    flush_of: Option<u16>,
    /// A Tflush for this call is outstanding; the tag stays reserved until
    /// its Rflush arrives.
    flushing: bool,
}

#[derive(Default)]
struct State {
    pending: HashMap<u16, PendingCall>,
    /// Set once the reader has stopped. Holds the error later calls get.
    shutdown: Option<Error>,
    closing: bool,
}

struct Inner {
    writer: tokio::sync::Mutex<MsgEncoder<Writer>>,
    state: Mutex<State>,
    tags: Pool,
    fids: Pool,
    seq: AtomicU64,
    msize: u32,
    dialect: Dialect,
    token: CancellationToken,
}

/// Copy of a terminal error for every call it fails.
fn replicate(e: &Error) -> Error {
    match *e {
        Error::Frame(fe) => Error::Frame(fe),
        Error::Shutdown => Error::Shutdown,
        _ => Error::UnexpectedEof,
    }
}

impl Inner {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release_tag(&self, tag: u16) {
        self.tags.put(tag as u32);
    }

    /// Register a call under `tag` and write its request.
    async fn send(
        &self,
        tag: u16,
        flush_of: Option<u16>,
        body: Fcall,
    ) -> Result<(u64, oneshot::Receiver<Result<Fcall>>)> {
        let (tx, rx) = oneshot::channel();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state();
            if let Some(ref e) = state.shutdown {
                let e = replicate(e);
                drop(state);
                self.release_tag(tag);
                return Err(e);
            }
            state.pending.insert(
                tag,
                PendingCall {
                    seq,
                    reply: tx,
                    flush_of,
                    flushing: false,
                },
            );
        }

        let msg = Msg { tag, body };
        let written = {
            let mut writer = self.writer.lock().await;
            writer.write_msg(&msg).await
        };
        if let Err(e) = written {
            // The reader may have failed the call already.
            if self.state().pending.remove(&tag).is_some() {
                self.release_tag(tag);
            }
            return Err(e);
        }
        debug!("\t→ {:?}", msg);
        Ok((seq, rx))
    }

    /// Route one reply to its caller.
    fn deliver(&self, msg: Msg) {
        let mut state = self.state();
        let call = match state.pending.remove(&msg.tag) {
            Some(call) => call,
            None => {
                warn!("reply for unknown tag {}: {}", msg.tag, msg);
                return;
            }
        };

        if let Some(oldtag) = call.flush_of {
            // The cancelled call ends here unless its own reply beat the Rflush.
            if let Some(old) = state.pending.remove(&oldtag) {
                let _ = old.reply.send(Err(Error::Flushed));
            }
            drop(state);
            self.release_tag(oldtag);
            self.release_tag(msg.tag);
            let _ = call.reply.send(Ok(msg.body));
            return;
        }
        drop(state);

        if !call.flushing {
            self.release_tag(msg.tag);
        }
        let reply = match msg.body {
            Fcall::Rlerror(e) => Err(Error::from_ecode(e.ecode)),
            Fcall::Rerror(e) => Err(Error::Remote(e.ename)),
            body => Ok(body),
        };
        let _ = call.reply.send(reply);
    }

    /// Stop accepting calls and fail every outstanding one with `cause`.
    /// Calls made afterwards fail with `Shutdown` or `UnexpectedEof`.
    fn teardown(&self, cause: Error) {
        let mut state = self.state();
        let cause = if state.closing { Error::Shutdown } else { cause };
        state.shutdown = Some(match cause {
            Error::Shutdown => Error::Shutdown,
            _ => Error::UnexpectedEof,
        });
        for (tag, call) in state.pending.drain() {
            debug!("failing tag {}: {}", tag, cause);
            let _ = call.reply.send(Err(replicate(&cause)));
        }
    }

    /// Send a Tflush for `oldtag` if the call `seq` is still waiting.
    async fn flush(&self, oldtag: u16, seq: u64) -> Result<()> {
        {
            let mut state = self.state();
            match state.pending.get_mut(&oldtag) {
                Some(call) if call.seq == seq => call.flushing = true,
                _ => return Ok(()),
            }
        }

        let tag = match self.tags.next() {
            Some(tag) => tag as u16,
            None => {
                // The call stays pending; its own reply will release the tag.
                if let Some(call) = self.state().pending.get_mut(&oldtag) {
                    call.flushing = false;
                }
                return Err(Error::OutOfTags);
            }
        };
        self.send(tag, Some(oldtag), Tflush { oldtag }.into()).await?;
        Ok(())
    }
}

async fn read_loop<R>(inner: Arc<Inner>, mut decoder: MsgDecoder<R>)
where
    R: AsyncRead + Unpin,
{
    let cause = loop {
        let header = tokio::select! {
            _ = inner.token.cancelled() => break Error::Shutdown,
            r = decoder.read_header() => r,
        };
        let header = match header {
            Ok(Some(header)) => header,
            Ok(None) => break Error::UnexpectedEof,
            Err(e) => break e,
        };

        match decoder.read_body(&header).await {
            Ok(msg) => {
                debug!("\t← {:?}", msg);
                inner.deliver(msg);
            }
            Err(e) => {
                warn!("bad reply frame for tag {}: {}", header.tag, e);
                break e;
            }
        }
    };

    match cause {
        Error::Shutdown => info!("connection closed"),
        ref e => error!("connection lost: {}", e),
    }
    inner.teardown(cause);
}

/// A 9P connection.
pub struct Client {
    inner: Arc<Inner>,
    reader: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Negotiate the version over `reader`/`writer` and start the reply
    /// reader.
    pub async fn new<R, W>(reader: R, writer: W, config: Config) -> Result<Client>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut decoder = MsgDecoder::new(reader);
        let mut encoder = MsgEncoder::new(Box::new(writer) as Writer);
        decoder.set_msize(config.msize)?;
        encoder.set_msize(config.msize)?;

        let requested = config.dialect.as_str();
        let tversion = Msg {
            tag: NOTAG,
            body: Tversion {
                msize: config.msize,
                version: requested.to_owned(),
            }
            .into(),
        };
        encoder.write_msg(&tversion).await?;
        debug!("\t→ {:?}", tversion);

        let reply = decoder.read_msg().await?.ok_or(Error::UnexpectedEof)?;
        debug!("\t← {:?}", reply);
        let rversion = match reply.body {
            Fcall::Rversion(r) => r,
            Fcall::Rlerror(e) => return Err(Error::from_ecode(e.ecode)),
            Fcall::Rerror(e) => return Err(Error::Remote(e.ename)),
            other => return Err(Error::UnexpectedMessage(other.msg_type())),
        };
        if rversion.version != requested {
            return Err(Error::VersionNotSupported(rversion.version));
        }

        let msize = rversion.msize.min(config.msize);
        if msize < MIN_MSIZE {
            return res!(io_err!(
                InvalidData,
                format!("server msize {} too small", rversion.msize)
            ));
        }
        decoder.set_msize(msize)?;
        decoder.set_dialect(config.dialect);
        encoder.set_msize(msize)?;
        info!("negotiated {} with msize {}", config.dialect, msize);

        let inner = Arc::new(Inner {
            writer: tokio::sync::Mutex::new(encoder),
            state: Mutex::new(State::default()),
            tags: Pool::new(1, NOTAG as u32),
            fids: Pool::new(0, NOFID),
            seq: AtomicU64::new(0),
            msize,
            dialect: config.dialect,
            token: CancellationToken::new(),
        });
        let reader = tokio::spawn(read_loop(inner.clone(), decoder));

        Ok(Client {
            inner,
            reader: tokio::sync::Mutex::new(Some(reader)),
        })
    }

    /// Connect to a `proto!address!port` address, `tcp` or `unix`.
    pub async fn connect(addr: &str, config: Config) -> Result<Client> {
        let (proto, addr) = utils::resolve_addr(addr)
            .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

        match proto {
            "tcp" => {
                let (reader, writer) = TcpStream::connect(&addr).await?.into_split();
                Client::new(reader, writer, config).await
            }
            "unix" => {
                let (reader, writer) = UnixStream::connect(&addr).await?.into_split();
                Client::new(reader, writer, config).await
            }
            _ => res!(io_err!(InvalidInput, "Protocol not supported")),
        }
    }

    /// Negotiated maximum frame size.
    pub fn msize(&self) -> u32 {
        self.inner.msize
    }

    pub fn dialect(&self) -> Dialect {
        self.inner.dialect
    }

    /// Largest payload a single read or write can carry.
    pub fn iounit(&self) -> u32 {
        self.inner.msize - FIXED_READ_WRITE_LEN
    }

    /// Reserve a fid number.
    pub fn alloc_fid(&self) -> Result<u32> {
        self.inner.fids.next().ok_or(Error::OutOfFids)
    }

    /// Return a fid number once the server has forgotten it.
    pub fn release_fid(&self, fid: u32) {
        self.inner.fids.put(fid);
    }

    fn next_tag(&self) -> Result<u16> {
        self.inner
            .tags
            .next()
            .map(|tag| tag as u16)
            .ok_or(Error::OutOfTags)
    }

    /// Send `body` and wait for its reply.
    ///
    /// `Rlerror` and `Rerror` come back as `Err`.
    pub async fn rpc(&self, body: Fcall) -> Result<Fcall> {
        let tag = self.next_tag()?;
        let (_, rx) = self.inner.send(tag, None, body).await?;
        rx.await.unwrap_or(Err(Error::UnexpectedEof))
    }

    /// Like [`rpc`](Self::rpc), but cancelling `token` flushes the request.
    ///
    /// After cancellation this still waits for either the original reply or
    /// the Rflush, and returns [`Error::Flushed`] in the latter case.
    pub async fn rpc_cancellable(&self, body: Fcall, token: &CancellationToken) -> Result<Fcall> {
        let tag = self.next_tag()?;
        let (seq, mut rx) = self.inner.send(tag, None, body).await?;

        tokio::select! {
            r = &mut rx => return r.unwrap_or(Err(Error::UnexpectedEof)),
            _ = token.cancelled() => {}
        }

        debug!("flushing tag {}", tag);
        self.inner.flush(tag, seq).await?;
        rx.await.unwrap_or(Err(Error::UnexpectedEof))
    }

    async fn call<T>(&self, body: impl Into<Fcall>) -> Result<T>
    where
        T: TryFrom<Fcall, Error = Error>,
    {
        T::try_from(self.rpc(body.into()).await?)
    }

    pub async fn attach(&self, fid: u32, afid: u32, uname: &str, aname: &str, n_uname: u32) -> Result<Qid> {
        check_name(uname)?;
        check_path(aname)?;
        let r: Rattach = self
            .call(Tlattach {
                fid,
                afid,
                uname: uname.to_owned(),
                aname: aname.to_owned(),
                n_uname,
            })
            .await?;
        Ok(r.qid)
    }

    /// Walk `wnames` from `fid` to `newfid`. Fewer qids than names means the
    /// walk stopped early and `newfid` was not created.
    pub async fn walk(&self, fid: u32, newfid: u32, wnames: &[&str]) -> Result<Vec<Qid>> {
        if wnames.len() > MAX_WALK_NAMES {
            return res!(FrameError::MaxWalkElements);
        }
        for name in wnames {
            check_name(name)?;
        }
        let r: Rwalk = self
            .call(Twalk {
                fid,
                newfid,
                wnames: wnames.iter().map(|s| s.to_string()).collect(),
            })
            .await?;
        Ok(r.wqids)
    }

    pub async fn lopen(&self, fid: u32, flags: u32) -> Result<Rlopen> {
        self.call(Tlopen { fid, flags }).await
    }

    pub async fn lcreate(&self, fid: u32, name: &str, flags: u32, mode: u32, gid: u32) -> Result<Rlcreate> {
        check_name(name)?;
        self.call(Tlcreate {
            fid,
            name: name.to_owned(),
            flags,
            mode,
            gid,
        })
        .await
    }

    /// Read up to `count` bytes, clamped to the iounit.
    pub async fn read(&self, fid: u32, offset: u64, count: u32) -> Result<Data> {
        let r: Rread = self
            .call(Tread {
                fid,
                offset,
                count: count.min(self.iounit()),
            })
            .await?;
        Ok(r.data)
    }

    /// Write one chunk; `data` must fit in the iounit.
    pub async fn write(&self, fid: u32, offset: u64, data: impl Into<Data>) -> Result<u32> {
        let data = data.into();
        if data.len() as u64 > self.iounit() as u64 {
            return res!(FrameError::DataTooLarge);
        }
        let r: Rwrite = self.call(Twrite { fid, offset, data }).await?;
        Ok(r.count)
    }

    pub async fn readdir(&self, fid: u32, offset: u64, count: u32) -> Result<DirEntryData> {
        let r: Rreaddir = self
            .call(Treaddir {
                fid,
                offset,
                count: count.min(self.iounit()),
            })
            .await?;
        Ok(DirEntryData::from_data(&r.data)?)
    }

    pub async fn getattr(&self, fid: u32, req_mask: GetAttrMask) -> Result<Rgetattr> {
        self.call(Tgetattr { fid, req_mask }).await
    }

    pub async fn setattr(&self, fid: u32, valid: SetAttrMask, stat: SetAttr) -> Result<()> {
        let _: Rsetattr = self.call(Tsetattr { fid, valid, stat }).await?;
        Ok(())
    }

    pub async fn mkdir(&self, dfid: u32, name: &str, mode: u32, gid: u32) -> Result<Qid> {
        check_name(name)?;
        let r: Rmkdir = self
            .call(Tmkdir {
                dfid,
                name: name.to_owned(),
                mode,
                gid,
            })
            .await?;
        Ok(r.qid)
    }

    pub async fn symlink(&self, fid: u32, name: &str, target: &str, gid: u32) -> Result<Qid> {
        check_name(name)?;
        check_path(target)?;
        let r: Rsymlink = self
            .call(Tsymlink {
                fid,
                name: name.to_owned(),
                symtgt: target.to_owned(),
                gid,
            })
            .await?;
        Ok(r.qid)
    }

    pub async fn readlink(&self, fid: u32) -> Result<String> {
        let r: Rreadlink = self.call(Treadlink { fid }).await?;
        Ok(r.target)
    }

    pub async fn unlinkat(&self, dirfd: u32, name: &str, flags: u32) -> Result<()> {
        check_name(name)?;
        let _: Runlinkat = self
            .call(Tunlinkat {
                dirfd,
                name: name.to_owned(),
                flags,
            })
            .await?;
        Ok(())
    }

    pub async fn renameat(&self, olddirfid: u32, oldname: &str, newdirfid: u32, newname: &str) -> Result<()> {
        check_name(oldname)?;
        check_name(newname)?;
        let _: Rrenameat = self
            .call(Trenameat {
                olddirfid,
                oldname: oldname.to_owned(),
                newdirfid,
                newname: newname.to_owned(),
            })
            .await?;
        Ok(())
    }

    pub async fn statfs(&self, fid: u32) -> Result<StatFs> {
        let r: Rstatfs = self.call(Tstatfs { fid }).await?;
        Ok(r.statfs)
    }

    pub async fn fsync(&self, fid: u32, datasync: bool) -> Result<()> {
        let _: Rfsync = self
            .call(Tfsync {
                fid,
                datasync: datasync as u32,
            })
            .await?;
        Ok(())
    }

    /// Clunk `fid` and return its number to the pool.
    pub async fn clunk(&self, fid: u32) -> Result<()> {
        let r: Result<Rclunk> = self.call(Tclunk { fid }).await;
        // The fid is gone on the server even when clunk fails.
        if !matches!(r, Err(Error::Shutdown | Error::UnexpectedEof)) {
            self.release_fid(fid);
        }
        r.map(|_| ())
    }

    /// Remove the file behind `fid`; the fid is clunked either way.
    pub async fn remove(&self, fid: u32) -> Result<()> {
        let r: Result<Rremove> = self.call(Tremove { fid }).await;
        if !matches!(r, Err(Error::Shutdown | Error::UnexpectedEof)) {
            self.release_fid(fid);
        }
        r.map(|_| ())
    }

    /// Stop the reader and fail outstanding calls with [`Error::Shutdown`].
    /// Calls made after this fail the same way.
    pub async fn close(&self) -> Result<()> {
        self.inner.state().closing = true;
        self.inner.token.cancel();
        if let Some(reader) = self.reader.lock().await.take() {
            if let Err(e) = reader.await {
                warn!("reader task failed: {}", e);
            }
        }
        let mut writer = self.inner.writer.lock().await;
        // The peer may have hung up already.
        if let Err(e) = writer.shutdown().await {
            debug!("shutdown: {}", e);
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.state().closing = true;
        self.inner.token.cancel();
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.len() > u16::MAX as usize {
        return res!(FrameError::NameTooLarge);
    }
    Ok(())
}

fn check_path(path: &str) -> Result<()> {
    if path.len() > u16::MAX as usize {
        return res!(FrameError::PathTooLarge);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_errors_are_replicated() {
        assert!(matches!(
            replicate(&Error::Frame(FrameError::InvalidUtf8)),
            Error::Frame(FrameError::InvalidUtf8)
        ));
        assert!(matches!(replicate(&Error::Shutdown), Error::Shutdown));
        assert!(matches!(
            replicate(&Error::Io(io_err!(BrokenPipe, "gone"))),
            Error::UnexpectedEof
        ));
    }

    #[test]
    fn long_names_are_refused() {
        let long = "x".repeat(u16::MAX as usize + 1);
        assert!(matches!(
            check_name(&long),
            Err(Error::Frame(FrameError::NameTooLarge))
        ));
        assert!(matches!(
            check_path(&long),
            Err(Error::Frame(FrameError::PathTooLarge))
        ));
        assert!(check_name(&long[1..]).is_ok());
    }
}
