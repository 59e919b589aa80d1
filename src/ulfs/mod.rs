//! Access to the underlying filesystem.
//!
//! The proxy never trades in raw paths above this module: every open
//! object is a [`Port`], either a capability onto the mirrored tree
//! ([`FilePort`]) or the root of a running translator chain
//! ([`StreamPort`]).


use std::ops::BitOr;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::ChildStdout;

use crate::error::{Error, Result};

/// Maximum length of a single name passed to lookup operations.
pub const MAX_NAME_LEN: usize = 255;

/// Open flags understood by the port layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct OpenFlags(u32);

impl OpenFlags {
    pub const READ: OpenFlags = OpenFlags(1 << 0);
    pub const WRITE: OpenFlags = OpenFlags(1 << 1);
    pub const EXEC: OpenFlags = OpenFlags(1 << 2);
    pub const DIRECTORY: OpenFlags = OpenFlags(1 << 3);
    pub const NOTRANS: OpenFlags = OpenFlags(1 << 4);
    pub const NOLINK: OpenFlags = OpenFlags(1 << 5);
    pub const CREAT: OpenFlags = OpenFlags(1 << 6);
    pub const EXCL: OpenFlags = OpenFlags(1 << 7);
    pub const NONBLOCK: OpenFlags = OpenFlags(1 << 8);

    /// The state modes that only matter to open itself, never to the
    /// node the open produces.
    pub const OPENONLY_STATE_MODES: OpenFlags = OpenFlags(
        Self::CREAT.0 | Self::EXCL.0 | Self::NOLINK.0 | Self::NOTRANS.0 | Self::NONBLOCK.0,
    );

    pub fn empty() -> Self {
        OpenFlags(0)
    }

    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: OpenFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: OpenFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: OpenFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

/// File timestamp.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FileTime {
    pub seconds: i64,
    pub nanos: u32,
}

impl FileTime {
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self { seconds: now.as_secs() as i64, nanos: now.subsec_nanos() }
    }
}

/// Node type as reported by the underlying filesystem.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    CharacterDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl FileType {
    /// The `d_type` code stored in serialized directory entries.
    pub fn dirent_code(self) -> u8 {
        match self {
            FileType::Regular => libc::DT_REG,
            FileType::Directory => libc::DT_DIR,
            FileType::Symlink => libc::DT_LNK,
            FileType::CharacterDevice => libc::DT_CHR,
            FileType::BlockDevice => libc::DT_BLK,
            FileType::Fifo => libc::DT_FIFO,
            FileType::Socket => libc::DT_SOCK,
        }
    }
}

/// Stat information for a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub file_type: FileType,
    pub ino: u64,
    pub fsid: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub rdev: u64,
    pub atime: FileTime,
    pub mtime: FileTime,
    pub ctime: FileTime,
}

impl Stat {
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        let host = meta.file_type();
        let file_type = if host.is_dir() {
            FileType::Directory
        } else if host.is_file() {
            FileType::Regular
        } else if host.is_symlink() {
            FileType::Symlink
        } else if host.is_char_device() {
            FileType::CharacterDevice
        } else if host.is_block_device() {
            FileType::BlockDevice
        } else if host.is_fifo() {
            FileType::Fifo
        } else if host.is_socket() {
            FileType::Socket
        } else {
            FileType::Regular
        };

        Self {
            file_type,
            ino: meta.ino(),
            fsid: meta.dev(),
            mode: meta.mode(),
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.size(),
            rdev: meta.rdev(),
            atime: FileTime { seconds: meta.atime(), nanos: meta.atime_nsec() as u32 },
            mtime: FileTime { seconds: meta.mtime(), nanos: meta.mtime_nsec() as u32 },
            ctime: FileTime { seconds: meta.ctime(), nanos: meta.ctime_nsec() as u32 },
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// True when `(uid, gid)` is granted every permission bit in
    /// `mask` (an `rwx` triple, `0o4`/`0o2`/`0o1`).
    pub fn permits(&self, uid: u32, gid: u32, mask: u32) -> bool {
        if uid == 0 {
            // root passes read and write checks outright; execute
            // still needs at least one execute bit somewhere
            if mask & 0o1 != 0 && self.mode & 0o111 == 0 && !self.is_dir() {
                return false;
            }
            return true;
        }
        let class_shift = if uid == self.uid {
            6
        } else if gid == self.gid {
            3
        } else {
            0
        };
        let granted = (self.mode >> class_shift) & 0o7;
        granted & mask == mask
    }
}

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a live port. Two lookups of the same file yield
/// distinct port ids.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PortId(u64);

impl PortId {
    fn fresh() -> Self {
        PortId(NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A capability onto a file of the mirrored tree.
#[derive(Debug)]
pub struct FilePort {
    id: PortId,
    path: PathBuf,
    flags: OpenFlags,
}

impl FilePort {
    /// Opens `path` with `flags`, verifying the object exists and has
    /// the demanded shape.
    pub async fn open(path: PathBuf, flags: OpenFlags) -> Result<Self> {
        let stat = stat_path(&path, flags).await?;
        if flags.contains(OpenFlags::DIRECTORY) && !stat.is_dir() {
            return Err(Error::NotDir);
        }
        Ok(Self { id: PortId::fresh(), path, flags })
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub async fn stat(&self) -> Result<Stat> {
        stat_path(&self.path, self.flags).await
    }

    /// Looks up `name` under this port. `name` must be a single path
    /// component unless it is absolute, in which case the port is
    /// bypassed the way the underlying filesystem would.
    pub async fn lookup_under(&self, name: &str, flags: OpenFlags) -> Result<FilePort> {
        let target = if name.starts_with('/') {
            PathBuf::from(name)
        } else {
            validate_component(name)?;
            self.path.join(name)
        };
        FilePort::open(target, flags).await
    }

    /// Reads up to `len` bytes at `offset`.
    pub async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(&self.path).await.map_err(Error::from)?;
        let size = file.metadata().await.map_err(Error::from)?.len();
        let want = if offset >= size { 0 } else { (size - offset).min(len as u64) as usize };
        let mut data = vec![0u8; want];
        if want > 0 {
            file.seek(std::io::SeekFrom::Start(offset)).await.map_err(Error::from)?;
            file.read_exact(&mut data).await.map_err(Error::from)?;
        }
        Ok(data)
    }

    /// Writes `data` at `offset`, used only when write delegation is
    /// configured.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(Error::from)?;
        file.seek(std::io::SeekFrom::Start(offset)).await.map_err(Error::from)?;
        file.write_all(data).await.map_err(Error::from)?;
        file.flush().await.map_err(Error::from)?;
        Ok(data.len())
    }

    pub async fn read_link(&self) -> Result<PathBuf> {
        tokio::fs::read_link(&self.path).await.map_err(Error::from)
    }

    /// Drops the caller's identity from the capability; the result is
    /// the unauthenticated port handed to translator startup.
    pub fn restrict(&self) -> FilePort {
        FilePort { id: PortId::fresh(), path: self.path.clone(), flags: OpenFlags::READ }
    }

    /// Opens the substrate end handed to a translator as its stdin.
    pub fn open_substrate(&self) -> Result<std::fs::File> {
        std::fs::File::open(&self.path).map_err(Error::from)
    }

    /// Like [`FilePort::open_substrate`], but never blocks on opens
    /// of FIFOs or devices.
    pub fn open_substrate_nonblocking(&self) -> Result<std::fs::File> {
        use std::os::unix::fs::OpenOptionsExt;
        std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
            .map_err(Error::from)
    }
}

/// The root of a running translator chain: the topmost translator's
/// output stream.
#[derive(Debug)]
pub struct StreamPort {
    id: PortId,
    stat: Stat,
    reader: tokio::sync::Mutex<Option<ChildStdout>>,
}

impl StreamPort {
    pub fn new(stdout: ChildStdout) -> Self {
        let now = FileTime::now();
        // streams have no underlying identity; synthesize one
        let stat = Stat {
            file_type: FileType::Fifo,
            ino: 0,
            fsid: 0,
            mode: libc::S_IFIFO | 0o444,
            nlink: 1,
            uid: 0,
            gid: 0,
            size: 0,
            rdev: 0,
            atime: now,
            mtime: now,
            ctime: now,
        };
        Self { id: PortId::fresh(), stat, reader: tokio::sync::Mutex::new(Some(stdout)) }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn stat(&self) -> Stat {
        self.stat.clone()
    }

    /// Reads the next chunk of the stream; offsets do not apply to a
    /// translator root.
    pub async fn read_next(&self, len: usize) -> Result<Vec<u8>> {
        let mut guard = self.reader.lock().await;
        let reader = match guard.as_mut() {
            Some(reader) => reader,
            None => return Ok(Vec::new()),
        };
        let mut data = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = reader.read(&mut data[filled..]).await.map_err(Error::from)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        data.truncate(filled);
        Ok(data)
    }

    /// Consumes the stream end, chaining it into the next translator's
    /// substrate.
    pub async fn take_stdout(&self) -> Option<ChildStdout> {
        self.reader.lock().await.take()
    }
}

/// A capability held by a heavy node.
#[derive(Debug)]
pub enum Port {
    File(FilePort),
    Stream(StreamPort),
}

impl Port {
    pub fn id(&self) -> PortId {
        match self {
            Port::File(port) => port.id(),
            Port::Stream(port) => port.id(),
        }
    }

    pub fn as_file(&self) -> Option<&FilePort> {
        match self {
            Port::File(port) => Some(port),
            Port::Stream(_) => None,
        }
    }

    pub fn as_stream(&self) -> Option<&StreamPort> {
        match self {
            Port::Stream(port) => Some(port),
            Port::File(_) => None,
        }
    }

    pub async fn stat(&self) -> Result<Stat> {
        match self {
            Port::File(port) => port.stat().await,
            Port::Stream(port) => Ok(port.stat()),
        }
    }

    pub async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        match self {
            Port::File(port) => port.read_at(offset, len).await,
            Port::Stream(port) => port.read_next(len).await,
        }
    }
}

async fn stat_path(path: &Path, flags: OpenFlags) -> Result<Stat> {
    let meta = if flags.contains(OpenFlags::NOTRANS) {
        tokio::fs::symlink_metadata(path).await.map_err(Error::from)?
    } else {
        tokio::fs::metadata(path).await.map_err(Error::from)?
    };
    Ok(Stat::from_metadata(&meta))
}

fn validate_component(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') {
        return Err(Error::NotFound);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::NameTooLong);
    }
    Ok(())
}

/// Looks up `name` under `dir`, falling back from `flags0` to
/// `flags1` when the first open fails, and returns the port together
/// with its stat.
pub async fn file_lookup(
    dir: Option<&FilePort>,
    name: &str,
    flags0: OpenFlags,
    flags1: OpenFlags,
) -> Result<(FilePort, Stat)> {
    let open = |flags: OpenFlags| async move {
        match dir {
            Some(dir) => dir.lookup_under(name, flags).await,
            None => FilePort::open(PathBuf::from(name), flags).await,
        }
    };

    let port = match open(flags0).await {
        Ok(port) => port,
        Err(_) => open(flags1).await?,
    };
    let stat = port.stat().await?;
    Ok((port, stat))
}

/// A raw directory entry as handed back by the underlying filesystem.
#[derive(Debug, Clone)]
pub struct RawDirent {
    pub ino: u64,
    pub file_type: u8,
    pub name: String,
}

/// Pulls the raw entries of the directory behind `port` in one batch.
pub async fn dir_entries_get(port: &FilePort) -> Result<Vec<RawDirent>> {
    let mut reader = tokio::fs::read_dir(port.path()).await.map_err(Error::from)?;
    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await.map_err(Error::from)? {
        let file_type = match entry.file_type().await {
            Ok(ft) => {
                if ft.is_dir() {
                    libc::DT_DIR
                } else if ft.is_symlink() {
                    libc::DT_LNK
                } else if ft.is_char_device() {
                    libc::DT_CHR
                } else if ft.is_block_device() {
                    libc::DT_BLK
                } else if ft.is_fifo() {
                    libc::DT_FIFO
                } else if ft.is_socket() {
                    libc::DT_SOCK
                } else {
                    libc::DT_REG
                }
            }
            Err(_) => libc::DT_UNKNOWN,
        };
        let ino = entry.ino();
        let name = entry.file_name().to_string_lossy().into_owned();
        entries.push(RawDirent { ino, file_type, name });
    }
    Ok(entries)
}

/// Byte offset of the name within a serialized directory entry.
pub const DIRENT_NAME_OFFS: usize = 12;

/// Serialized directory entries are padded to this alignment.
pub const DIRENT_ALIGN: usize = 4;

/// Size of a serialized directory entry carrying a name of
/// `name_len` bytes, including the terminating zero and padding.
pub fn dirent_len(name_len: usize) -> usize {
    (DIRENT_NAME_OFFS + name_len + 1 + DIRENT_ALIGN - 1) & !(DIRENT_ALIGN - 1)
}

/// Appends one entry to `buf` in the serialized dirent layout:
/// inode (u64 le), record length (u16 le), type code, name length,
/// then the zero-terminated name padded to alignment.
pub fn write_dirent(buf: &mut Vec<u8>, ino: u64, file_type: u8, name: &str) {
    let reclen = dirent_len(name.len());
    buf.extend_from_slice(&ino.to_le_bytes());
    buf.extend_from_slice(&(reclen as u16).to_le_bytes());
    buf.push(file_type);
    buf.push(name.len().min(u8::MAX as usize) as u8);
    buf.extend_from_slice(name.as_bytes());
    buf.push(0);
    while buf.len() % DIRENT_ALIGN != 0 {
        buf.push(0);
    }
}
