//! Minimal demonstration of the proxy core: mirror a directory,
//! list it, and read one file through the proxy - with a translator
//! stacked on it when the name carries the `,,` syntax.
//!
//!     cargo run --example mirror -- /tmp/demo 'notes.txt,,/bin/cat'

use nsmux::server::{Credentials, FileServer, Lookup};
use nsmux::ulfs::OpenFlags;
use nsmux::{Config, ProxyFs};

#[tokio::main]
async fn main() {
    let mut args = std::env::args().skip(1);
    let dir = args.next().expect("usage: mirror DIR [PATH]");
    let path = args.next();

    let fs = ProxyFs::new(Config::with_dir(dir)).await.expect("start proxy");
    let cred = Credentials::current();

    let (buf, added) =
        fs.get_dirents(&fs.root(), 0, None, None).await.expect("list root");
    println!("{} entries, {} bytes serialized", added, buf.len());

    let Some(path) = path else { return };
    match fs.dir_lookup(&cred, &fs.root(), &path, OpenFlags::READ).await.expect("lookup") {
        Lookup::Node(node) => {
            let data = fs.attempt_read(&node, 0, 4096).await.expect("read");
            println!("{}", String::from_utf8_lossy(&data));
        }
        Lookup::Port(port) => {
            let stream = port.as_stream().expect("translator root");
            let data = stream.read_next(4096).await.expect("read stream");
            println!("{}", String::from_utf8_lossy(&data));
        }
        other => println!("redirected: {:?}", other),
    }
}
