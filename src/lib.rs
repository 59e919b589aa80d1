//! nsmux - a filesystem proxy for namespace-based translator selection.
//!
//! The proxy mirrors a directory tree and interprets the magic `,,`
//! syntax during path lookup: `file,,T` resolves `file` and stacks
//! the translator `T` on it in the same lookup; `,,,` escapes a
//! literal pair of commas.

pub mod config;
pub mod error;
pub mod lnode;
pub mod magic;
pub mod ncache;
pub mod node;
pub mod proxy;
pub mod server;
pub mod trans;
pub mod ulfs;

pub use config::Config;
pub use error::{Error, Result};
pub use proxy::ProxyFs;
pub use server::{Credentials, FileServer, Lookup};
