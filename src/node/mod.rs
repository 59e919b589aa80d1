//! Heavy node management. Also see the light-node tree in
//! [`crate::lnode`].
//!
//! A heavy node is a client-facing object bound to a live [`Port`].
//! The outer server's reference counting is `Arc` cloning; dropping
//! the last clone runs the destructor, which detaches the node from
//! its light node (heavy-before-light order).


use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::lnode::{HeavyRef, LnodeId, Tree};
use crate::ulfs::{self, dirent_len, FilePort, OpenFlags, Port, Stat};

/// Node flags.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct NodeFlags(u32);

impl NodeFlags {
    /// The node must not be refreshed against the underlying
    /// filesystem.
    pub const ULFS_FIXED: NodeFlags = NodeFlags(1 << 0);
    /// The node's port is known stale.
    pub const INVALIDATE: NodeFlags = NodeFlags(1 << 1);
    /// The port was validated against the underlying filesystem.
    pub const ULFS_UPTODATE: NodeFlags = NodeFlags(1 << 2);

    pub fn empty() -> Self {
        NodeFlags(0)
    }

    pub fn contains(self, other: NodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: NodeFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: NodeFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for NodeFlags {
    type Output = NodeFlags;

    fn bitor(self, rhs: NodeFlags) -> NodeFlags {
        NodeFlags(self.0 | rhs.0)
    }
}

/// The three shapes a heavy node can take.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// A real file or directory of the proxied tree.
    Normal,
    /// A per-lookup alias of a light node used for translator
    /// stacking; never the light node's primary.
    Proxy,
    /// An orphan substrate not attached to any light node.
    Shadow,
}

/// Mutable node state, protected by the node lock.
#[derive(Debug, Default)]
pub struct NodeState {
    /// Port to the underlying file, or the root of a translator
    /// chain.
    pub port: Option<Port>,
    pub flags: NodeFlags,
    /// Stat information as of the last validation.
    pub stat: Option<Stat>,
    /// Registry entries for the translators started on this node.
    pub dyntrans: Vec<crate::trans::TransId>,
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

fn next_token() -> u64 {
    NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
}

/// A client-facing node.
#[derive(Debug)]
pub struct Node {
    kind: NodeKind,
    token: u64,
    lnode: Option<LnodeId>,
    tree: Arc<Tree>,
    /// Slot in the node cache chain, `None` while off the chain.
    cache_link: std::sync::Mutex<Option<usize>>,
    pub state: tokio::sync::Mutex<NodeState>,
}

impl Node {
    /// Derives a new primary node from `lnode`, counting a light
    /// reference.
    pub fn create(tree: &Arc<Tree>, lnode: LnodeId) -> Arc<Node> {
        let token = next_token();
        let node = Arc::new(Node {
            kind: NodeKind::Normal,
            token,
            lnode: Some(lnode),
            tree: Arc::clone(tree),
            cache_link: std::sync::Mutex::new(None),
            state: tokio::sync::Mutex::new(NodeState::default()),
        });
        tree.set_primary(lnode, HeavyRef { token, node: Arc::downgrade(&node) });
        node
    }

    /// Derives a new proxy from `lnode`. The light node keeps its
    /// primary; the proxy joins the proxy collection.
    pub fn create_proxy(tree: &Arc<Tree>, lnode: LnodeId) -> Arc<Node> {
        let token = next_token();
        let node = Arc::new(Node {
            kind: NodeKind::Proxy,
            token,
            lnode: Some(lnode),
            tree: Arc::clone(tree),
            cache_link: std::sync::Mutex::new(None),
            state: tokio::sync::Mutex::new(NodeState::default()),
        });
        tree.add_proxy(lnode, HeavyRef { token, node: Arc::downgrade(&node) });
        node
    }

    /// Creates a shadow node seeded with `port`, not linked to any
    /// light node.
    pub fn create_from_port(tree: &Arc<Tree>, port: Port) -> Arc<Node> {
        Arc::new(Node {
            kind: NodeKind::Shadow,
            token: next_token(),
            lnode: None,
            tree: Arc::clone(tree),
            cache_link: std::sync::Mutex::new(None),
            state: tokio::sync::Mutex::new(NodeState {
                port: Some(port),
                ..NodeState::default()
            }),
        })
    }

    /// Creates the root node over a fresh nameless light node.
    pub fn create_root(tree: &Arc<Tree>) -> Arc<Node> {
        let lnode = tree.create(None);
        Node::create(tree, lnode)
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn lnode(&self) -> Option<LnodeId> {
        self.lnode
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    /// The node's slot in the cache chain; managed by the cache.
    pub(crate) fn cache_link(&self) -> &std::sync::Mutex<Option<usize>> {
        &self.cache_link
    }

    /// Whether the cache currently pins this node.
    pub fn is_cached(&self) -> bool {
        self.cache_link.lock().expect("cache link lock").is_some()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // a node still threaded on the cache chain must not die
        assert!(
            self.cache_link.lock().expect("cache link lock").is_none(),
            "destroying a cache-resident node"
        );
        if let Some(lnode) = self.lnode {
            match self.kind {
                NodeKind::Normal => {
                    self.tree.clear_primary(lnode, self.token);
                    self.tree.ref_remove(lnode);
                }
                NodeKind::Proxy => self.tree.remove_proxy(lnode, self.token),
                NodeKind::Shadow => {}
            }
        }
    }
}

/// Derives the display name of the mirrored directory: everything
/// after the last slash that is not escaped by a backslash.
pub fn root_display_name(dir: &str) -> &str {
    let bytes = dir.as_bytes();
    let mut split = None;
    for (i, &b) in bytes.iter().enumerate().rev() {
        if b == b'/' {
            if i > 0 && bytes[i - 1] == b'\\' {
                continue;
            }
            split = Some(i + 1);
            break;
        }
    }
    match split {
        Some(pos) => &dir[pos..],
        None => dir,
    }
}

/// Initializes the root node's port to the underlying filesystem and
/// seeds the root light node's identity. Must run under the
/// underlying-filesystem lock.
pub async fn init_root(root: &Arc<Node>, tree: &Tree, dir: &str) -> Result<Stat> {
    let resolved = tokio::fs::canonicalize(dir).await.map_err(|err| {
        debug!(dir, "could not resolve the mirrored directory");
        Error::from(err)
    })?;
    let port = FilePort::open(resolved.clone(), OpenFlags::READ | OpenFlags::DIRECTORY).await?;
    let stat = port.stat().await?;
    debug!(dir, port = ?port.id(), "root port opened");

    let lnode = root.lnode().ok_or(Error::BadPort)?;
    let path = resolved.to_string_lossy().into_owned();
    let name = root_display_name(dir).to_owned();
    tree.init_root_identity(lnode, path, name);

    let mut state = root.state.lock().await;
    state.port = Some(Port::File(port));
    state.stat = Some(stat.clone());
    state.flags.insert(NodeFlags::ULFS_FIXED | NodeFlags::ULFS_UPTODATE);
    Ok(stat)
}

/// Refreshes `node`'s port against the underlying filesystem,
/// acquiring the root node lock first.
pub async fn update(node: &Arc<Node>, root: &Arc<Node>, underlying: &Stat) -> Result<()> {
    if Arc::ptr_eq(node, root) {
        return Ok(());
    }
    let root_state = root.state.lock().await;
    update_locked(node, &root_state, underlying).await
}

/// Like [`update`], but assumes the caller already holds the root
/// node lock and passes the guarded state in.
pub async fn update_locked(
    node: &Arc<Node>,
    root_state: &NodeState,
    underlying: &Stat,
) -> Result<()> {
    let Some(lnode) = node.lnode() else {
        return Ok(());
    };
    let path = node.tree().path_construct(lnode)?;
    let root_port = root_state.port.as_ref().and_then(Port::as_file).ok_or(Error::BadPort)?;

    let mut state = node.state.lock().await;
    if state.flags.contains(NodeFlags::ULFS_FIXED) {
        return Ok(());
    }
    // the stale port is released before the fresh lookups
    state.port = None;

    let untranslated = ulfs::file_lookup(
        Some(root_port),
        &path,
        OpenFlags::READ | OpenFlags::NOTRANS,
        OpenFlags::NOTRANS,
    )
    .await;
    let finish_flags = |state: &mut NodeState| {
        state.flags.remove(NodeFlags::INVALIDATE);
        state.flags.insert(NodeFlags::ULFS_UPTODATE);
    };

    let (_, probe_stat) = match untranslated {
        Ok(found) => found,
        Err(_) => {
            // transient failure: defer to the next use
            finish_flags(&mut state);
            return Ok(());
        }
    };

    if probe_stat.ino == underlying.ino && probe_stat.fsid == underlying.fsid {
        finish_flags(&mut state);
        debug!(path = path.as_str(), "lookup redirected back to the proxy root");
        return Err(Error::Loop);
    }

    match ulfs::file_lookup(Some(root_port), &path, OpenFlags::READ, OpenFlags::empty()).await {
        Ok((port, stat)) => {
            state.port = Some(Port::File(port));
            state.stat = Some(stat);
        }
        Err(_) => {
            state.port = None;
        }
    }
    finish_flags(&mut state);
    Ok(())
}

/// An owned directory entry of a proxied directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDirent {
    pub ino: u64,
    pub file_type: u8,
    /// Serialized record length, aligned up.
    pub reclen: usize,
    pub name: String,
}

/// Reads the directory entries behind `port`, excluding `.` and `..`.
pub async fn entries_get(port: &FilePort) -> Result<Vec<NodeDirent>> {
    let raw = ulfs::dir_entries_get(port).await?;
    let mut entries = Vec::with_capacity(raw.len());
    for dirent in raw {
        if dirent.name == "." || dirent.name == ".." {
            continue;
        }
        let reclen = dirent_len(dirent.name.len());
        entries.push(NodeDirent {
            ino: dirent.ino,
            file_type: dirent.file_type,
            reclen,
            name: dirent.name,
        });
    }
    Ok(entries)
}

/// Computes the serialized size of the directory behind `port`.
pub async fn get_size(port: &FilePort) -> Result<u64> {
    let entries = entries_get(port).await?;
    Ok(entries.iter().map(|entry| entry.reclen as u64).sum())
}

/// Validates that `name` exists under `dir` and forwards the removal
/// to the underlying filesystem. Only reachable when write delegation
/// is configured.
pub async fn unlink_file(dir: &FilePort, name: &str) -> Result<()> {
    let probe = dir.lookup_under(name, OpenFlags::NOTRANS).await?;
    let target: PathBuf = probe.path().to_path_buf();
    tokio::fs::remove_file(&target).await.map_err(Error::from)
}
