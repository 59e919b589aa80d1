//! The file-server surface driven by the outer RPC framework.
//!
//! The framework itself is an external collaborator; this trait is
//! the contract the proxy core exposes to it. Tests drive the trait
//! directly.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::node::Node;
use crate::trans::Control;
use crate::ulfs::{FileTime, OpenFlags, Port, Stat};

/// Identity of the client issuing a request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    /// The proxy process's own effective identity.
    pub fn current() -> Self {
        // SAFETY: geteuid and getegid cannot fail
        let uid = unsafe { libc::geteuid() };
        let gid = unsafe { libc::getegid() };
        Self { uid, gid }
    }

    pub fn root() -> Self {
        Self { uid: 0, gid: 0 }
    }
}

/// Result of a [`FileServer::dir_lookup`].
#[derive(Debug)]
pub enum Lookup {
    /// A node served by this proxy; the normal retry.
    Node(Arc<Node>),
    /// A direct port, typically into a freshly stacked translator
    /// chain.
    Port(Port),
    /// The client must retry the remaining path through the parent
    /// of this filesystem.
    ReauthParent { rest: String },
    /// The client must retry at an absolute path outside the proxy.
    Magical { path: String },
}

/// Handlers the proxy core exposes to the outer file-server library.
///
/// Mutation handlers default to [`Error::Unsupported`]; the proxy
/// overrides the few that write delegation makes meaningful.
#[async_trait]
pub trait FileServer: Send + Sync {
    /// Resolves `path` under `dir`, interpreting the magic `,,`
    /// syntax along the way.
    async fn dir_lookup(
        &self,
        cred: &Credentials,
        dir: &Arc<Node>,
        path: &str,
        flags: OpenFlags,
    ) -> Result<Lookup>;

    /// Refreshes and returns stat information for `node`.
    async fn validate_stat(&self, node: &Arc<Node>, cred: &Credentials) -> Result<Stat>;

    /// Returns an error if an open with `flags` must not complete.
    fn check_open_permissions(
        &self,
        cred: &Credentials,
        stat: &Stat,
        flags: OpenFlags,
    ) -> Result<()>;

    /// Serializes directory entries starting at the `first`-th,
    /// injecting synthetic `.` and `..` records. Returns the buffer
    /// and the number of entries added.
    async fn get_dirents(
        &self,
        dir: &Arc<Node>,
        first: usize,
        count: Option<usize>,
        max_len: Option<usize>,
    ) -> Result<(Vec<u8>, usize)>;

    /// Reads up to `len` bytes of `node` at `offset`.
    async fn attempt_read(&self, node: &Arc<Node>, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Writes through to the underlying filesystem when delegation
    /// is configured.
    async fn attempt_write(
        &self,
        cred: &Credentials,
        node: &Arc<Node>,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        let _ = (cred, node, offset, data);
        Err(Error::Unsupported)
    }

    /// Updates the node's timestamps.
    async fn attempt_utimes(
        &self,
        cred: &Credentials,
        node: &Arc<Node>,
        atime: Option<FileTime>,
        mtime: Option<FileTime>,
    ) -> Result<()>;

    /// The access kinds `cred` holds on `node`.
    async fn report_access(&self, cred: &Credentials, node: &Arc<Node>) -> Result<OpenFlags>;

    /// The control handle of the root's active translator.
    async fn get_translator_cntl(&self, node: &Arc<Node>) -> Result<Arc<Control>>;

    /// Removes `name` under `dir` when write delegation is
    /// configured.
    async fn attempt_unlink(&self, cred: &Credentials, dir: &Arc<Node>, name: &str) -> Result<()> {
        let _ = (cred, dir, name);
        Err(Error::Unsupported)
    }

    async fn attempt_create_file(
        &self,
        cred: &Credentials,
        dir: &Arc<Node>,
        name: &str,
        mode: u32,
    ) -> Result<Arc<Node>> {
        let _ = (cred, dir, name, mode);
        Err(Error::Unsupported)
    }

    async fn attempt_rename(
        &self,
        cred: &Credentials,
        from_dir: &Arc<Node>,
        from_name: &str,
        to_dir: &Arc<Node>,
        to_name: &str,
    ) -> Result<()> {
        let _ = (cred, from_dir, from_name, to_dir, to_name);
        Err(Error::Unsupported)
    }

    async fn attempt_mkdir(
        &self,
        cred: &Credentials,
        dir: &Arc<Node>,
        name: &str,
        mode: u32,
    ) -> Result<()> {
        let _ = (cred, dir, name, mode);
        Err(Error::Unsupported)
    }

    async fn attempt_rmdir(&self, cred: &Credentials, dir: &Arc<Node>, name: &str) -> Result<()> {
        let _ = (cred, dir, name);
        Err(Error::Unsupported)
    }

    async fn attempt_chmod(&self, cred: &Credentials, node: &Arc<Node>, mode: u32) -> Result<()> {
        let _ = (cred, node, mode);
        Err(Error::Unsupported)
    }

    async fn attempt_chown(
        &self,
        cred: &Credentials,
        node: &Arc<Node>,
        uid: u32,
        gid: u32,
    ) -> Result<()> {
        let _ = (cred, node, uid, gid);
        Err(Error::Unsupported)
    }

    async fn attempt_chauthor(
        &self,
        cred: &Credentials,
        node: &Arc<Node>,
        author: u32,
    ) -> Result<()> {
        let _ = (cred, node, author);
        Err(Error::Unsupported)
    }

    async fn attempt_chflags(&self, cred: &Credentials, node: &Arc<Node>, flags: u32) -> Result<()> {
        let _ = (cred, node, flags);
        Err(Error::Unsupported)
    }

    async fn attempt_set_size(&self, cred: &Credentials, node: &Arc<Node>, size: u64) -> Result<()> {
        let _ = (cred, node, size);
        Err(Error::Unsupported)
    }

    async fn attempt_statfs(&self, cred: &Credentials, node: &Arc<Node>) -> Result<()> {
        let _ = (cred, node);
        Err(Error::Unsupported)
    }

    async fn set_translator_record(
        &self,
        cred: &Credentials,
        node: &Arc<Node>,
        argz: &[String],
    ) -> Result<()> {
        let _ = (cred, node, argz);
        Err(Error::Unsupported)
    }

    async fn attempt_mksymlink(
        &self,
        cred: &Credentials,
        node: &Arc<Node>,
        target: &str,
    ) -> Result<()> {
        let _ = (cred, node, target);
        Err(Error::Unsupported)
    }

    async fn attempt_mkdev(
        &self,
        cred: &Credentials,
        node: &Arc<Node>,
        mode: u32,
        device: u64,
    ) -> Result<()> {
        let _ = (cred, node, mode, device);
        Err(Error::Unsupported)
    }

    async fn attempt_mkfile(&self, cred: &Credentials, dir: &Arc<Node>) -> Result<Arc<Node>> {
        let _ = (cred, dir);
        Err(Error::Unsupported)
    }

    async fn attempt_link(
        &self,
        cred: &Credentials,
        dir: &Arc<Node>,
        file: &Arc<Node>,
        name: &str,
    ) -> Result<()> {
        let _ = (cred, dir, file, name);
        Err(Error::Unsupported)
    }

    async fn attempt_readlink(&self, cred: &Credentials, node: &Arc<Node>) -> Result<String> {
        let _ = (cred, node);
        Err(Error::Unsupported)
    }
}
