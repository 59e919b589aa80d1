//! The filesystem proxy for namespace-based translator selection.
//!
//! [`ProxyFs`] owns every process-wide singleton (root node, light
//! node tree, node cache, translator registry) and implements the
//! [`FileServer`] surface: the per-component lookup state machine
//! with `,,` handling, translator startup and chaining, and the
//! read-side handlers that mirror the underlying tree.


use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::lnode::{LnodeId, Tree};
use crate::magic;
use crate::ncache::Ncache;
use crate::node::{self, Node, NodeFlags, NodeKind};
use crate::server::{Credentials, FileServer, Lookup};
use crate::trans::{self, Control, Registry, Substrate};
use crate::ulfs::{self, FileTime, FileType, OpenFlags, Port, Stat};

/// The inode number presented for the proxy root.
pub const ROOT_INODE: u64 = 1;

/// Bound on chained symlink resolution.
pub const MAX_SYMLINKS: usize = 12;

/// The proxy runtime.
pub struct ProxyFs {
    config: Config,
    tree: Arc<Tree>,
    cache: Ncache,
    dyntrans: Registry,
    root: Arc<Node>,
    /// Stat identity of the mirrored directory, used to detect
    /// lookups that loop back into the proxy.
    underlying_stat: Stat,
    fsid: u64,
    /// Serializes root initialization and node refresh against the
    /// underlying filesystem.
    ulfs_lock: tokio::sync::Mutex<()>,
}

impl ProxyFs {
    /// Builds the runtime over the configured directory: creates and
    /// initializes the root node, sizes the cache, and fixes up the
    /// stat presented for the root.
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let tree = Arc::new(Tree::new());
        let root = Node::create_root(&tree);
        let ulfs_lock = tokio::sync::Mutex::new(());

        let underlying_stat = {
            let _ulfs = ulfs_lock.lock().await;
            node::init_root(&root, &tree, &config.dir).await?
        };
        debug!(dir = config.dir.as_str(), "root node initialized");

        let fsid = std::process::id() as u64;
        let mut root_stat = underlying_stat.clone();
        root_stat.ino = ROOT_INODE;
        root_stat.fsid = fsid;
        root_stat.file_type = FileType::Directory;
        root_stat.mode = libc::S_IFDIR | (underlying_stat.mode & 0o7777);
        if !underlying_stat.is_dir() {
            // a readable non-directory must become a traversable root
            if underlying_stat.mode & 0o400 != 0 {
                root_stat.mode |= 0o100;
            }
            if underlying_stat.mode & 0o040 != 0 {
                root_stat.mode |= 0o010;
            }
            if underlying_stat.mode & 0o004 != 0 {
                root_stat.mode |= 0o001;
            }
        }
        let now = FileTime::now();
        root_stat.atime = now;
        root_stat.mtime = now;
        root_stat.ctime = now;
        root.state.lock().await.stat = Some(root_stat);

        let cache = Ncache::new(config.settings.cache_size);
        Ok(Arc::new(Self {
            config,
            tree,
            cache,
            dyntrans: Registry::new(),
            root,
            underlying_stat,
            fsid,
            ulfs_lock,
        }))
    }

    pub fn root(&self) -> Arc<Node> {
        Arc::clone(&self.root)
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn cache(&self) -> &Ncache {
        &self.cache
    }

    pub fn registry(&self) -> &Registry {
        &self.dyntrans
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn fsid(&self) -> u64 {
        self.fsid
    }

    /// Stat identity of the mirrored directory.
    pub fn underlying(&self) -> &Stat {
        &self.underlying_stat
    }

    fn translator_timeout(&self) -> Duration {
        self.config.translator_timeout()
    }

    /// Prepends the configured prefix to relative translator names.
    fn normalize_translator(&self, name: &str) -> String {
        if name.starts_with('/') {
            name.to_owned()
        } else {
            format!("{}{}", self.config.settings.translator_prefix, name)
        }
    }

    /// Resolves one plain path component under `dnp`: probes the
    /// underlying object, retains the right port for its shape,
    /// finds or creates the light node and attaches a heavy node
    /// (through the cache, or the factory for proxies).
    async fn lookup_component(
        &self,
        dnp: &Arc<Node>,
        name: &str,
        flags: OpenFlags,
        last: bool,
        proxy: bool,
    ) -> Result<Arc<Node>> {
        let dstate = dnp.state.lock().await;
        let dport = dstate.port.as_ref().and_then(Port::as_file).ok_or(Error::BadPort)?;

        // probe without following the final symlink; the lookup
        // engine chases links itself
        let (_, probe_stat) =
            ulfs::file_lookup(Some(dport), name, OpenFlags::NOTRANS, OpenFlags::NOTRANS).await?;

        let port = if probe_stat.is_dir() {
            let opened = dport
                .lookup_under(name, OpenFlags::READ | OpenFlags::DIRECTORY)
                .await
                .map_err(|_| Error::BadPort)?;
            Some(opened)
        } else if probe_stat.file_type == FileType::Symlink {
            Some(dport.lookup_under(name, OpenFlags::NOTRANS).await?)
        } else if last {
            let mut open_flags = flags;
            open_flags.remove(OpenFlags::OPENONLY_STATE_MODES);
            Some(dport.lookup_under(name, open_flags).await?)
        } else {
            None
        };

        let dlnode = dnp.lnode().ok_or(Error::NotDir)?;
        let lnode = match self.tree.get(dlnode, name) {
            Ok(lnode) => lnode,
            Err(Error::NotFound) => self.tree.create_under(dlnode, name),
            Err(err) => return Err(err),
        };

        let np = if proxy {
            Node::create_proxy(&self.tree, lnode)
        } else {
            self.cache.lookup(&self.tree, lnode)
        };

        self.tree.set_dir_flag(lnode, probe_stat.is_dir());
        self.tree.path_construct(lnode)?;
        self.tree.ref_remove(lnode);

        {
            let mut state = np.state.lock().await;
            state.port = port.map(Port::File);
            state.stat = Some(probe_stat);
            state.flags.remove(NodeFlags::INVALIDATE);
            state.flags.insert(NodeFlags::ULFS_UPTODATE);
        }
        trace!(name, proxy, "component resolved");
        Ok(np)
    }

    /// Splits the tail of a magic component into the translator
    /// specs to stack, bottom first.
    fn split_translator_specs(tail: &str) -> Vec<String> {
        let mut specs = Vec::new();
        let mut rest = tail;
        loop {
            match magic::find_separator(rest) {
                Some(idx) => {
                    let mut head = rest[..idx].to_owned();
                    let len = head.len();
                    magic::unescape(&mut head, len);
                    specs.push(head);
                    rest = &rest[idx + 2..];
                }
                None => {
                    let mut head = rest.to_owned();
                    let len = head.len();
                    magic::unescape(&mut head, len);
                    specs.push(head);
                    return specs;
                }
            }
        }
    }

    /// Splits a normalized translator command line into argv on
    /// spaces.
    fn argz_split(cmdline: &str) -> Vec<String> {
        cmdline.split(' ').filter(|part| !part.is_empty()).map(str::to_owned).collect()
    }

    /// Starts the translator chain described by `trans_spec` on
    /// `np`, bottom-up, and returns the port to the top of the
    /// stack. Every `,,`-separated spec in the tail is started in
    /// this one call, each chained onto the previous root.
    pub async fn set_translator(
        &self,
        cred: &Credentials,
        dnp: &Arc<Node>,
        np: &Arc<Node>,
        trans_spec: &str,
        flags: OpenFlags,
        filename: &str,
    ) -> Result<Port> {
        // the directory port handed to translator startup carries no
        // caller identity
        let unauth_dir = {
            let dstate = dnp.state.lock().await;
            dstate.port.as_ref().and_then(Port::as_file).ok_or(Error::BadPort)?.restrict()
        };

        let specs = Self::split_translator_specs(trans_spec);
        let mut np_state = np.state.lock().await;
        let mut chain: Option<Port> = None;

        for (idx, spec) in specs.iter().enumerate() {
            let argv = Self::argz_split(&self.normalize_translator(spec));

            let substrate = if idx == 0 {
                let stat = match np_state.stat.clone() {
                    Some(stat) => stat,
                    None => match np_state.port.as_ref() {
                        Some(port) => port.stat().await?,
                        None => return Err(Error::BadPort),
                    },
                };
                self.check_open_permissions(cred, &stat, flags)?;

                if np_state.port.is_none() {
                    let mut open_flags = flags;
                    open_flags.remove(OpenFlags::OPENONLY_STATE_MODES);
                    let (port, stat) =
                        ulfs::file_lookup(Some(&unauth_dir), filename, open_flags, OpenFlags::READ)
                            .await?;
                    np_state.stat = Some(stat);
                    np_state.port = Some(Port::File(port));
                }
                let fport =
                    np_state.port.as_ref().and_then(Port::as_file).ok_or(Error::BadPort)?;
                Substrate::File(fport.open_substrate()?)
            } else {
                let prev = chain.take().ok_or(Error::BadPort)?;
                let stream = match prev {
                    Port::Stream(stream) => stream,
                    Port::File(_) => return Err(Error::BadPort),
                };
                let stdout = stream.take_stdout().await.ok_or(Error::BadPort)?;
                Substrate::Chained(stdout)
            };

            let started = trans::start(&argv, substrate, self.translator_timeout()).await?;
            let id = self.dyntrans.register(Arc::clone(&started.control), started.pid);
            np_state.dyntrans.push(id);
            debug!(spec = spec.as_str(), pid = started.pid, "translator stacked");
            chain = Some(started.root);
        }

        chain.ok_or(Error::NotFound)
    }

    /// Hands a terminal device or FIFO off to a synthesized
    /// translator, the command line derived from its stat.
    async fn fetch_root(
        &self,
        np: &Arc<Node>,
        stat: &Stat,
    ) -> Result<Port> {
        let prefix = &self.config.settings.translator_prefix;
        let argv = match stat.file_type {
            FileType::Fifo => vec![format!("{}fifo", prefix)],
            FileType::CharacterDevice => vec![
                format!("{}chrdev", prefix),
                dev_major(stat.rdev).to_string(),
                dev_minor(stat.rdev).to_string(),
            ],
            FileType::BlockDevice => vec![
                format!("{}blkdev", prefix),
                dev_major(stat.rdev).to_string(),
                dev_minor(stat.rdev).to_string(),
            ],
            _ => return Err(Error::BadPort),
        };

        let mut np_state = np.state.lock().await;
        let fport = np_state.port.as_ref().and_then(Port::as_file).ok_or(Error::BadPort)?;
        let substrate = Substrate::File(fport.open_substrate_nonblocking()?);
        let started = trans::start(&argv, substrate, self.translator_timeout()).await?;
        let id = self.dyntrans.register(Arc::clone(&started.control), started.pid);
        np_state.dyntrans.push(id);
        Ok(started.root)
    }

    /// Builds the absolute path of `lnode` and stats it through the
    /// root port without retaining a port.
    async fn stat_via_root(&self, lnode: LnodeId) -> Result<Stat> {
        let path = self.tree.path_construct(lnode)?;
        let root_state = self.root.state.lock().await;
        let root_port =
            root_state.port.as_ref().and_then(Port::as_file).ok_or(Error::BadPort)?;
        let (_, stat) =
            ulfs::file_lookup(Some(root_port), &path, OpenFlags::empty(), OpenFlags::NOTRANS)
                .await?;
        Ok(stat)
    }

    /// Opens `node`'s port through the root when it has none yet.
    async fn ensure_port(&self, node: &Arc<Node>, flags: OpenFlags) -> Result<()> {
        {
            let state = node.state.lock().await;
            if state.port.is_some() {
                return Ok(());
            }
        }
        let lnode = node.lnode().ok_or(Error::BadPort)?;
        let path = self.tree.path_construct(lnode)?;

        let _ulfs = self.ulfs_lock.lock().await;
        let root_state = self.root.state.lock().await;
        let root_port =
            root_state.port.as_ref().and_then(Port::as_file).ok_or(Error::BadPort)?;
        let (port, stat) =
            ulfs::file_lookup(Some(root_port), &path, flags, OpenFlags::READ).await?;
        drop(root_state);

        let mut state = node.state.lock().await;
        if state.port.is_none() {
            state.port = Some(Port::File(port));
            state.stat = Some(stat);
        }
        Ok(())
    }

    /// Walks `..`: shadow substrates and the proxy root redirect the
    /// client to the parent's port, everything else resolves through
    /// the cache.
    fn parent_of(&self, dnp: &Arc<Node>) -> Option<LnodeId> {
        let lnode = dnp.lnode()?;
        self.tree.parent(lnode)
    }
}

/// Linux device number split.
fn dev_major(rdev: u64) -> u64 {
    ((rdev >> 32) & 0xffff_f000) | ((rdev >> 8) & 0xfff)
}

fn dev_minor(rdev: u64) -> u64 {
    ((rdev >> 12) & 0xffff_ff00) | (rdev & 0xff)
}

/// Splits the next `/`-separated component off `rest`. Returns the
/// component, the remainder, and whether trailing slashes force
/// directory semantics.
fn split_component(rest: &str) -> (String, String, bool) {
    match rest.find('/') {
        None => (rest.to_owned(), String::new(), false),
        Some(idx) => {
            let name = rest[..idx].to_owned();
            let remainder = rest[idx..].trim_start_matches('/').to_owned();
            let mustbedir = remainder.is_empty();
            (name, remainder, mustbedir)
        }
    }
}

#[async_trait]
impl FileServer for ProxyFs {
    async fn dir_lookup(
        &self,
        cred: &Credentials,
        dir: &Arc<Node>,
        path: &str,
        flags: OpenFlags,
    ) -> Result<Lookup> {
        let mut dnp = Arc::clone(dir);
        let mut rest = path.trim_start_matches('/').to_owned();
        let mut symlinks = 0usize;
        trace!(path, "dir_lookup");

        if rest.is_empty() {
            return Ok(Lookup::Node(dnp));
        }

        loop {
            let (name, remainder, mustbedir) = split_component(&rest);
            let last = remainder.is_empty();

            if name == "." || name.is_empty() {
                if last {
                    return Ok(Lookup::Node(dnp));
                }
                rest = remainder;
                continue;
            }

            if name == ".." {
                let parent = match dnp.kind() {
                    // out of a shadow root the client must reauth
                    NodeKind::Shadow => None,
                    _ => self.parent_of(&dnp),
                };
                match parent {
                    None => return Ok(Lookup::ReauthParent { rest: remainder }),
                    Some(parent) => {
                        let np = self.cache.lookup(&self.tree, parent);
                        self.ensure_port(&np, OpenFlags::READ | OpenFlags::DIRECTORY).await?;
                        self.cache.add(&np);
                        if last {
                            return Ok(Lookup::Node(np));
                        }
                        dnp = np;
                        rest = remainder;
                        continue;
                    }
                }
            }

            match magic::find_separator(&name) {
                // a name that starts with the control sequence is
                // unresolvable
                Some(0) => return Err(Error::NotFound),

                None => {
                    let mut component = name;
                    let len = component.len();
                    magic::unescape(&mut component, len);

                    let np =
                        self.lookup_component(&dnp, &component, flags, last, false).await?;
                    let stat = {
                        let state = np.state.lock().await;
                        state.stat.clone().ok_or(Error::BadPort)?
                    };

                    if stat.file_type == FileType::Symlink {
                        let follow = !last
                            || mustbedir
                            || !flags.intersects(OpenFlags::NOLINK | OpenFlags::NOTRANS);
                        if follow {
                            symlinks += 1;
                            if symlinks > MAX_SYMLINKS {
                                return Err(Error::Loop);
                            }
                            let target = {
                                let state = np.state.lock().await;
                                let port = state
                                    .port
                                    .as_ref()
                                    .and_then(Port::as_file)
                                    .ok_or(Error::BadPort)?;
                                port.read_link().await?
                            };
                            let target = target.to_string_lossy().into_owned();
                            let spliced = if remainder.is_empty() {
                                target.clone()
                            } else {
                                format!("{}/{}", target, remainder)
                            };
                            if target.starts_with('/') {
                                return Ok(Lookup::Magical { path: spliced });
                            }
                            rest = spliced;
                            continue;
                        }
                    }

                    if last {
                        if mustbedir && !stat.is_dir() {
                            return Err(Error::NotDir);
                        }
                        if !stat.is_dir()
                            && !flags.contains(OpenFlags::NOTRANS)
                            && matches!(
                                stat.file_type,
                                FileType::CharacterDevice
                                    | FileType::BlockDevice
                                    | FileType::Fifo
                            )
                        {
                            let port = self.fetch_root(&np, &stat).await?;
                            return Ok(Lookup::Port(port));
                        }
                        self.check_open_permissions(cred, &stat, flags)?;
                        self.cache.add(&np);
                        return Ok(Lookup::Node(np));
                    }

                    if !stat.is_dir() {
                        return Err(Error::NotDir);
                    }
                    self.cache.add(&np);
                    dnp = np;
                    rest = remainder;
                }

                Some(idx) => {
                    let tail = name[idx + 2..].to_owned();
                    let mut head = name[..idx].to_owned();
                    let len = head.len();
                    magic::unescape(&mut head, len);

                    let np = self.lookup_component(&dnp, &head, flags, true, true).await?;
                    let port =
                        self.set_translator(cred, &dnp, &np, &tail, flags, &head).await?;

                    if last {
                        return Ok(Lookup::Port(port));
                    }
                    // keep walking under the freshly stacked root
                    dnp = Node::create_from_port(&self.tree, port);
                    rest = remainder;
                }
            }
        }
    }

    async fn validate_stat(&self, np: &Arc<Node>, _cred: &Credentials) -> Result<Stat> {
        if Arc::ptr_eq(np, &self.root) {
            let mut state = self.root.state.lock().await;
            let port = state.port.as_ref().and_then(Port::as_file).ok_or(Error::BadPort)?;
            let size = node::get_size(port).await?;
            let mut stat = state.stat.clone().ok_or(Error::BadPort)?;
            stat.size = size;
            state.stat = Some(stat.clone());
            return Ok(stat);
        }

        let needs_update = {
            let state = np.state.lock().await;
            !state.flags.contains(NodeFlags::ULFS_UPTODATE)
        };
        if needs_update {
            let _ulfs = self.ulfs_lock.lock().await;
            node::update(np, &self.root, &self.underlying_stat).await?;
        }

        let mut state = np.state.lock().await;
        if state.port.is_some() {
            let stat = match &state.port {
                Some(port) => port.stat().await?,
                None => return Err(Error::BadPort),
            };
            state.stat = Some(stat.clone());
            Ok(stat)
        } else {
            drop(state);
            // a transient port through the parent, released right away
            let lnode = np.lnode().ok_or(Error::BadPort)?;
            let stat = self.stat_via_root(lnode).await?;
            np.state.lock().await.stat = Some(stat.clone());
            Ok(stat)
        }
    }

    fn check_open_permissions(
        &self,
        cred: &Credentials,
        stat: &Stat,
        flags: OpenFlags,
    ) -> Result<()> {
        for (flag, bit) in [
            (OpenFlags::READ, 0o4),
            (OpenFlags::WRITE, 0o2),
            (OpenFlags::EXEC, 0o1),
        ] {
            if flags.contains(flag) && !stat.permits(cred.uid, cred.gid, bit) {
                return Err(Error::Permission);
            }
        }
        Ok(())
    }

    async fn get_dirents(
        &self,
        dir: &Arc<Node>,
        first: usize,
        count: Option<usize>,
        max_len: Option<usize>,
    ) -> Result<(Vec<u8>, usize)> {
        let state = dir.state.lock().await;
        let port = state.port.as_ref().and_then(Port::as_file).ok_or(Error::BadPort)?;
        let entries = node::entries_get(port).await?;
        drop(state);

        // measure: select the records that fit the caller's bounds
        let mut selected: Vec<(String, u64, u8)> = Vec::new();
        let mut size = 0usize;
        let mut bump = |name: &str, ino: u64, file_type: u8| -> bool {
            if count.is_some_and(|count| selected.len() >= count) {
                return false;
            }
            let next = size + ulfs::dirent_len(name.len());
            if max_len.is_some_and(|max| next > max) {
                return false;
            }
            size = next;
            selected.push((name.to_owned(), ino, file_type));
            true
        };

        if first == 0 {
            bump(".", 2, libc::DT_DIR);
        }
        if first <= 1 {
            bump("..", 2, libc::DT_DIR);
        }
        let skip = first.saturating_sub(2);
        for entry in entries.iter().skip(skip) {
            if !bump(&entry.name, entry.ino, entry.file_type) {
                break;
            }
        }

        // serialize into one buffer in the dirent layout
        let mut buf = Vec::with_capacity(size);
        for (name, ino, file_type) in &selected {
            ulfs::write_dirent(&mut buf, *ino, *file_type, name);
        }
        Ok((buf, selected.len()))
    }

    async fn attempt_read(&self, np: &Arc<Node>, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.ensure_port(np, OpenFlags::READ).await?;
        let state = np.state.lock().await;
        let port = state.port.as_ref().ok_or(Error::BadPort)?;
        port.read(offset, len).await
    }

    async fn attempt_write(
        &self,
        cred: &Credentials,
        np: &Arc<Node>,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        if !self.config.settings.delegate_writes {
            return Err(Error::Unsupported);
        }
        {
            let state = np.state.lock().await;
            if let Some(stat) = &state.stat {
                if !stat.permits(cred.uid, cred.gid, 0o2) {
                    return Err(Error::Permission);
                }
            }
        }
        self.ensure_port(np, OpenFlags::READ | OpenFlags::WRITE).await?;
        let state = np.state.lock().await;
        let port = state.port.as_ref().and_then(Port::as_file).ok_or(Error::BadPort)?;
        port.write_at(offset, data).await
    }

    async fn attempt_utimes(
        &self,
        cred: &Credentials,
        np: &Arc<Node>,
        atime: Option<FileTime>,
        mtime: Option<FileTime>,
    ) -> Result<()> {
        let mut state = np.state.lock().await;
        let stat = state.stat.as_mut().ok_or(Error::BadPort)?;
        // only the owner may touch timestamps
        if cred.uid != 0 && cred.uid != stat.uid {
            return Err(Error::Permission);
        }
        let now = FileTime::now();
        stat.atime = atime.unwrap_or(now);
        stat.mtime = mtime.unwrap_or(now);
        stat.ctime = now;
        Ok(())
    }

    async fn report_access(&self, cred: &Credentials, np: &Arc<Node>) -> Result<OpenFlags> {
        let stat = self.validate_stat(np, cred).await?;
        let mut access = OpenFlags::empty();
        if stat.permits(cred.uid, cred.gid, 0o4) {
            access.insert(OpenFlags::READ);
        }
        if stat.permits(cred.uid, cred.gid, 0o2) {
            access.insert(OpenFlags::WRITE);
        }
        if stat.permits(cred.uid, cred.gid, 0o1) {
            access.insert(OpenFlags::EXEC);
        }
        Ok(access)
    }

    async fn get_translator_cntl(&self, np: &Arc<Node>) -> Result<Arc<Control>> {
        if !Arc::ptr_eq(np, &self.root) {
            return Err(Error::Unsupported);
        }
        let state = self.root.state.lock().await;
        let id = state.dyntrans.first().copied().ok_or(Error::Unsupported)?;
        self.dyntrans.control(id).ok_or(Error::Unsupported)
    }

    async fn attempt_unlink(
        &self,
        cred: &Credentials,
        dir: &Arc<Node>,
        name: &str,
    ) -> Result<()> {
        if !self.config.settings.delegate_writes {
            return Err(Error::Unsupported);
        }
        let state = dir.state.lock().await;
        if let Some(stat) = &state.stat {
            if !stat.permits(cred.uid, cred.gid, 0o2) {
                return Err(Error::Permission);
            }
        }
        let port = state.port.as_ref().and_then(Port::as_file).ok_or(Error::BadPort)?;
        node::unlink_file(port, name).await
    }
}
