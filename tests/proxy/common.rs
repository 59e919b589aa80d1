use std::path::PathBuf;
use std::sync::Arc;

use nsmux::config::Config;
use nsmux::node::Node;
use nsmux::server::{Credentials, FileServer, Lookup};
use nsmux::ulfs::{OpenFlags, Port};
use nsmux::ProxyFs;
use tempfile::TempDir;

pub struct Fixture {
    pub tempdir: TempDir,
    pub fs: Arc<ProxyFs>,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_cache_size(size: usize) -> Self {
        Self::with_config(|config| config.settings.cache_size = size).await
    }

    pub async fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let tempdir = TempDir::new().expect("create temp dir");
        let mut config = Config::with_dir(tempdir.path().to_string_lossy().into_owned());
        tweak(&mut config);
        let fs = ProxyFs::new(config).await.expect("start proxy");
        Self { tempdir, fs }
    }

    pub fn root(&self) -> Arc<Node> {
        self.fs.root()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.tempdir.path().join(name)
    }

    pub fn write_file(&self, name: &str, data: &[u8]) {
        std::fs::write(self.path(name), data).expect("write fixture file");
    }

    pub fn create_dir(&self, name: &str) {
        std::fs::create_dir(self.path(name)).expect("create fixture dir");
    }

    pub fn symlink(&self, target: &str, name: &str) {
        std::os::unix::fs::symlink(target, self.path(name)).expect("create fixture symlink");
    }

    /// Resolves `path` from the root with read flags.
    pub async fn lookup(&self, path: &str) -> nsmux::Result<Lookup> {
        self.fs.dir_lookup(&cred(), &self.root(), path, OpenFlags::READ).await
    }

    /// Resolves `path` and demands a node result.
    pub async fn lookup_node(&self, path: &str) -> Arc<Node> {
        match self.lookup(path).await.expect("lookup succeeds") {
            Lookup::Node(node) => node,
            other => panic!("expected a node for {:?}, got {:?}", path, other),
        }
    }

    /// Resolves `path` and demands a direct port result.
    pub async fn lookup_port(&self, path: &str) -> Port {
        match self.lookup(path).await.expect("lookup succeeds") {
            Lookup::Port(port) => port,
            other => panic!("expected a port for {:?}, got {:?}", path, other),
        }
    }
}

pub fn cred() -> Credentials {
    Credentials::current()
}

/// Reads a whole translator stream.
pub async fn read_stream(port: &Port, len: usize) -> Vec<u8> {
    let stream = port.as_stream().expect("translator root is a stream");
    stream.read_next(len).await.expect("stream read")
}
