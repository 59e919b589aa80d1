//! Keeping track of dynamic translators.
//!
//! A translator is a child process stacked on a node: its substrate
//! is its stdin, the root of the stack is its stdout. The registry
//! remembers every control handle the proxy has handed out so the
//! whole population can be shut down in reverse startup order.


use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::process::{ChildStdout, Command};
use tracing::debug;

use crate::error::{Error, Result};
use crate::ulfs::{Port, StreamPort};

/// Flags accepted by [`Control::goaway`] and
/// [`Registry::shutdown_all`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct GoawayFlags(u32);

impl GoawayFlags {
    /// Terminate the translator even if it objects.
    pub const FORCE: GoawayFlags = GoawayFlags(1 << 0);

    pub fn empty() -> Self {
        GoawayFlags(0)
    }

    pub fn contains(self, other: GoawayFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Control handle for a running translator.
#[derive(Debug)]
pub struct Control {
    pid: u32,
    child: tokio::sync::Mutex<Option<tokio::process::Child>>,
}

impl Control {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Asks the translator to go away. A graceful request sends
    /// SIGTERM and, when `wait` is set, reports [`Error::Busy`] if
    /// the process survives the grace period. A forced request kills
    /// outright.
    pub async fn goaway(&self, flags: GoawayFlags, wait: bool, grace: Duration) -> Result<()> {
        let mut guard = self.child.lock().await;
        let child = match guard.as_mut() {
            Some(child) => child,
            None => return Ok(()),
        };
        if let Ok(Some(_)) = child.try_wait() {
            *guard = None;
            return Ok(());
        }

        if flags.contains(GoawayFlags::FORCE) {
            let _ = child.start_kill();
            let _ = child.wait().await;
            *guard = None;
            return Ok(());
        }

        // graceful: ask politely first
        let killed = unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGTERM) };
        if killed != 0 {
            // the process is already gone
            let _ = child.wait().await;
            *guard = None;
            return Ok(());
        }

        if wait {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(_) => {
                    *guard = None;
                    Ok(())
                }
                Err(_) => {
                    debug!(pid = self.pid, "translator ignored the shutdown request");
                    Err(Error::Busy)
                }
            }
        } else {
            Ok(())
        }
    }
}

/// A running translator: its control handle and the port to the top
/// of the new stack.
#[derive(Debug)]
pub struct Started {
    pub control: Arc<Control>,
    pub pid: u32,
    pub root: Port,
}

/// The substrate end a translator is started over.
#[derive(Debug)]
pub enum Substrate {
    /// An opened file of the mirrored tree.
    File(std::fs::File),
    /// The root of the translator started before this one.
    Chained(ChildStdout),
}

/// Starts the translator described by `argv` over `substrate`.
/// Resolution of the translator binary is bounded by `timeout`.
pub async fn start(argv: &[String], substrate: Substrate, timeout: Duration) -> Result<Started> {
    let program = argv.first().ok_or(Error::NotFound)?;

    // a hung binary path (e.g. a dead automount) must not wedge the
    // lookup that started the translator
    match tokio::time::timeout(timeout, tokio::fs::metadata(program)).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => return Err(Error::from(err)),
        Err(_) => return Err(Error::Underlying(libc::ETIMEDOUT)),
    }

    let stdin = match substrate {
        Substrate::File(file) => Stdio::from(file),
        Substrate::Chained(stdout) => {
            let chained: Stdio = stdout.try_into().map_err(|_| Error::BadPort)?;
            chained
        }
    };

    let mut child = Command::new(program)
        .args(&argv[1..])
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(false)
        .spawn()
        .map_err(Error::from)?;

    let pid = child.id().ok_or(Error::BadPort)?;
    let stdout = child.stdout.take().ok_or(Error::BadPort)?;
    debug!(program = program.as_str(), pid, "translator started");

    Ok(Started {
        control: Arc::new(Control { pid, child: tokio::sync::Mutex::new(Some(child)) }),
        pid,
        root: Port::Stream(StreamPort::new(stdout)),
    })
}

/// Identity of a registry entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TransId(usize);

#[derive(Debug)]
struct El {
    control: Arc<Control>,
    pid: u32,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Default)]
struct RegState {
    slots: Vec<Option<El>>,
    free: Vec<usize>,
    head: Option<usize>,
}

impl RegState {
    fn unlink(&mut self, slot: usize) -> Option<El> {
        let el = self.slots.get_mut(slot)?.take()?;
        if let Some(prev) = el.prev {
            if let Some(p) = self.slots[prev].as_mut() {
                p.next = el.next;
            }
        } else if self.head == Some(slot) {
            self.head = el.next;
        }
        if let Some(next) = el.next {
            if let Some(n) = self.slots[next].as_mut() {
                n.prev = el.prev;
            }
        }
        self.free.push(slot);
        Some(el)
    }
}

/// The list of dynamic translators.
#[derive(Debug, Default)]
pub struct Registry {
    state: Mutex<RegState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a translator control handle at the head of the list. Use
    /// only this function to add an element.
    pub fn register(&self, control: Arc<Control>, pid: u32) -> TransId {
        let mut st = self.state.lock().expect("registry lock");
        let el = El { control, pid, prev: None, next: st.head };
        let slot = match st.free.pop() {
            Some(slot) => {
                st.slots[slot] = Some(el);
                slot
            }
            None => {
                st.slots.push(Some(el));
                st.slots.len() - 1
            }
        };
        if let Some(old) = st.head {
            if let Some(o) = st.slots[old].as_mut() {
                o.prev = Some(slot);
            }
        }
        st.head = Some(slot);
        TransId(slot)
    }

    /// Removes an entry from the list. This does not shut the
    /// translator down.
    pub fn unregister(&self, id: TransId) {
        let mut st = self.state.lock().expect("registry lock");
        st.unlink(id.0);
    }

    /// The control handle behind `id`, if still registered.
    pub fn control(&self, id: TransId) -> Option<Arc<Control>> {
        let st = self.state.lock().expect("registry lock");
        st.slots.get(id.0).and_then(Option::as_ref).map(|el| Arc::clone(&el.control))
    }

    pub fn len(&self) -> usize {
        let st = self.state.lock().expect("registry lock");
        st.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().expect("registry lock").head.is_none()
    }

    /// Pids currently registered, head first.
    pub fn pids(&self) -> Vec<u32> {
        let st = self.state.lock().expect("registry lock");
        let mut pids = Vec::new();
        let mut cursor = st.head;
        while let Some(slot) = cursor {
            let el = st.slots[slot].as_ref().expect("live registry entry");
            pids.push(el.pid);
            cursor = el.next;
        }
        pids
    }

    /// Shuts down every registered translator in list order. On an
    /// error the failed entry stays at the head so the next call
    /// resumes from it; on success the list is empty.
    pub async fn shutdown_all(&self, flags: GoawayFlags, wait: bool, grace: Duration) -> Result<()> {
        loop {
            let next = {
                let st = self.state.lock().expect("registry lock");
                st.head.map(|slot| {
                    let el = st.slots[slot].as_ref().expect("live registry entry");
                    (slot, Arc::clone(&el.control))
                })
            };
            let Some((slot, control)) = next else {
                return Ok(());
            };

            control.goaway(flags, wait, grace).await?;

            let mut st = self.state.lock().expect("registry lock");
            st.unlink(slot);
        }
    }
}
