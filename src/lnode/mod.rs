//! Management of cheap light nodes.
//!
//! A light node is the persistent identity of a name in the proxy
//! namespace. Light nodes live in an arena and refer to each other by
//! index; the sibling list under a directory is an intrusive
//! doubly-linked chain with O(1) removal. Reference counting is
//! explicit: a light node whose count reaches zero uninstalls itself
//! from its parent and is destroyed on the spot.


use std::sync::Mutex;
use std::sync::Weak;

use crate::error::{Error, Result};
use crate::node::Node;

/// Index of a light node in the arena.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LnodeId(usize);

/// A counted handle to a heavy node, held weakly so that destruction
/// order stays heavy-before-light.
#[derive(Debug, Clone)]
pub struct HeavyRef {
    pub token: u64,
    pub node: Weak<Node>,
}

#[derive(Debug)]
struct Lnode {
    /// Empty for the root.
    name: String,
    /// Cached absolute path within the underlying filesystem.
    path: Option<String>,
    /// Parent directory; `None` iff this is the root.
    dir: Option<LnodeId>,
    /// Head of the intrusive child list.
    entries: Option<LnodeId>,
    /// Sibling links.
    next: Option<LnodeId>,
    prev: Option<LnodeId>,
    references: usize,
    /// The current primary heavy node, if any.
    node: Option<HeavyRef>,
    /// Heavy proxy nodes currently representing this light node.
    proxies: Vec<HeavyRef>,
    /// The underlying object was a directory when last looked up.
    is_dir: bool,
}

#[derive(Debug, Default)]
struct TreeState {
    slots: Vec<Option<Lnode>>,
    free: Vec<usize>,
}

impl TreeState {
    fn get(&self, id: LnodeId) -> &Lnode {
        self.slots[id.0].as_ref().expect("live lnode")
    }

    fn get_mut(&mut self, id: LnodeId) -> &mut Lnode {
        self.slots[id.0].as_mut().expect("live lnode")
    }

    fn alloc(&mut self, lnode: Lnode) -> LnodeId {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(lnode);
                LnodeId(slot)
            }
            None => {
                self.slots.push(Some(lnode));
                LnodeId(self.slots.len() - 1)
            }
        }
    }

    /// Unhooks `id` from its parent's child list.
    fn splice_out(&mut self, id: LnodeId) {
        let (dir, prev, next) = {
            let n = self.get(id);
            (n.dir, n.prev, n.next)
        };
        match prev {
            Some(prev) => self.get_mut(prev).next = next,
            None => {
                if let Some(dir) = dir {
                    let dir = self.get_mut(dir);
                    if dir.entries == Some(id) {
                        dir.entries = next;
                    }
                }
            }
        }
        if let Some(next) = next {
            self.get_mut(next).prev = prev;
        }
        let n = self.get_mut(id);
        n.prev = None;
        n.next = None;
    }

    fn destroy(&mut self, id: LnodeId) {
        let lnode = self.slots[id.0].take().expect("live lnode");
        debug_assert!(lnode.entries.is_none(), "destroying a directory with live entries");
        self.free.push(id.0);
    }
}

/// The arena of light nodes.
#[derive(Debug, Default)]
pub struct Tree {
    state: Mutex<TreeState>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a detached light node carrying one reference owned by
    /// the caller. A `None` name creates the root.
    pub fn create(&self, name: Option<&str>) -> LnodeId {
        let mut st = self.state.lock().expect("lnode tree lock");
        st.alloc(Lnode {
            name: name.unwrap_or_default().to_owned(),
            path: None,
            dir: None,
            entries: None,
            next: None,
            prev: None,
            references: 1,
            node: None,
            proxies: Vec::new(),
            is_dir: false,
        })
    }

    /// Prepends `child` to `dir`'s entries and counts a reference on
    /// `dir` for the installation.
    pub fn install(&self, dir: LnodeId, child: LnodeId) {
        let mut st = self.state.lock().expect("lnode tree lock");
        self.install_locked(&mut st, dir, child);
    }

    fn install_locked(&self, st: &mut TreeState, dir: LnodeId, child: LnodeId) {
        let head = st.get(dir).entries;
        {
            let c = st.get_mut(child);
            c.next = head;
            c.prev = None;
            c.dir = Some(dir);
        }
        if let Some(head) = head {
            st.get_mut(head).prev = Some(child);
        }
        let d = st.get_mut(dir);
        d.entries = Some(child);
        d.references += 1;
    }

    pub fn ref_add(&self, id: LnodeId) {
        let mut st = self.state.lock().expect("lnode tree lock");
        st.get_mut(id).references += 1;
    }

    /// Removes a reference. On the transition to zero the node is
    /// uninstalled from its parent and destroyed; the removal of the
    /// installation reference may cascade up the tree.
    pub fn ref_remove(&self, id: LnodeId) {
        let mut st = self.state.lock().expect("lnode tree lock");
        let mut cursor = Some(id);
        while let Some(id) = cursor {
            let n = st.get_mut(id);
            assert!(n.references > 0, "unreferenced lnode");
            n.references -= 1;
            if n.references > 0 {
                break;
            }
            let parent = n.dir;
            st.splice_out(id);
            st.destroy(id);
            cursor = parent;
        }
    }

    /// Finds the child of `dir` called `name`, counting a new
    /// reference for the caller.
    pub fn get(&self, dir: LnodeId, name: &str) -> Result<LnodeId> {
        let mut st = self.state.lock().expect("lnode tree lock");
        let mut cursor = st.get(dir).entries;
        while let Some(id) = cursor {
            let (matches, next) = {
                let n = st.get(id);
                (n.name == name, n.next)
            };
            if matches {
                st.get_mut(id).references += 1;
                return Ok(id);
            }
            cursor = next;
        }
        Err(Error::NotFound)
    }

    /// Creates a child of `dir` called `name` and installs it,
    /// counting a reference for the caller.
    pub fn create_under(&self, dir: LnodeId, name: &str) -> LnodeId {
        let mut st = self.state.lock().expect("lnode tree lock");
        let child = st.alloc(Lnode {
            name: name.to_owned(),
            path: None,
            dir: None,
            entries: None,
            next: None,
            prev: None,
            references: 1,
            node: None,
            proxies: Vec::new(),
            is_dir: false,
        });
        self.install_locked(&mut st, dir, child);
        child
    }

    /// Builds the absolute path of `id` by walking parents up to the
    /// root, caches it in the light node and returns it.
    pub fn path_construct(&self, id: LnodeId) -> Result<String> {
        let mut st = self.state.lock().expect("lnode tree lock");
        let mut components = Vec::new();
        let mut cursor = id;
        while let Some(parent) = st.get(cursor).dir {
            components.push(st.get(cursor).name.clone());
            cursor = parent;
        }
        let root_path = st.get(cursor).path.clone().ok_or(Error::BadPort)?;

        let mut path = root_path;
        for name in components.iter().rev() {
            path.push('/');
            path.push_str(name);
        }
        st.get_mut(id).path = Some(path.clone());
        Ok(path)
    }

    /// The cached path, if one was built.
    pub fn cached_path(&self, id: LnodeId) -> Option<String> {
        let st = self.state.lock().expect("lnode tree lock");
        st.get(id).path.clone()
    }

    /// Seeds the root light node with the mirrored directory's path
    /// and display name.
    pub fn init_root_identity(&self, id: LnodeId, path: String, name: String) {
        let mut st = self.state.lock().expect("lnode tree lock");
        let n = st.get_mut(id);
        n.path = Some(path);
        n.name = name;
        n.is_dir = true;
    }

    pub fn name(&self, id: LnodeId) -> String {
        let st = self.state.lock().expect("lnode tree lock");
        st.get(id).name.clone()
    }

    pub fn parent(&self, id: LnodeId) -> Option<LnodeId> {
        let st = self.state.lock().expect("lnode tree lock");
        st.get(id).dir
    }

    pub fn is_dir(&self, id: LnodeId) -> bool {
        let st = self.state.lock().expect("lnode tree lock");
        st.get(id).is_dir
    }

    pub fn set_dir_flag(&self, id: LnodeId, is_dir: bool) {
        let mut st = self.state.lock().expect("lnode tree lock");
        st.get_mut(id).is_dir = is_dir;
    }

    /// Makes `heavy` the primary node of `id`, counting a reference.
    pub fn set_primary(&self, id: LnodeId, heavy: HeavyRef) {
        let mut st = self.state.lock().expect("lnode tree lock");
        let n = st.get_mut(id);
        n.node = Some(heavy);
        n.references += 1;
    }

    /// Drops the primary back-reference if it still belongs to
    /// `token`. Does not touch the reference count; the caller pairs
    /// this with [`Tree::ref_remove`].
    pub fn clear_primary(&self, id: LnodeId, token: u64) {
        let mut st = self.state.lock().expect("lnode tree lock");
        let n = st.get_mut(id);
        if n.node.as_ref().is_some_and(|heavy| heavy.token == token) {
            n.node = None;
        }
    }

    /// The current primary heavy node, if it is still alive.
    pub fn primary(&self, id: LnodeId) -> Option<std::sync::Arc<Node>> {
        let st = self.state.lock().expect("lnode tree lock");
        st.get(id).node.as_ref().and_then(|heavy| heavy.node.upgrade())
    }

    /// Inserts `heavy` at the head of `id`'s proxy collection and
    /// counts a reference.
    pub fn add_proxy(&self, id: LnodeId, heavy: HeavyRef) {
        let mut st = self.state.lock().expect("lnode tree lock");
        let n = st.get_mut(id);
        n.proxies.insert(0, heavy);
        n.references += 1;
    }

    /// Removes the proxy registered under `token` and releases its
    /// reference, which may destroy the light node.
    pub fn remove_proxy(&self, id: LnodeId, token: u64) {
        {
            let mut st = self.state.lock().expect("lnode tree lock");
            let n = st.get_mut(id);
            let before = n.proxies.len();
            n.proxies.retain(|heavy| heavy.token != token);
            if n.proxies.len() == before {
                return;
            }
        }
        self.ref_remove(id);
    }

    /// Number of live proxies registered on `id`.
    pub fn proxy_count(&self, id: LnodeId) -> usize {
        let st = self.state.lock().expect("lnode tree lock");
        st.get(id).proxies.len()
    }

    pub fn references(&self, id: LnodeId) -> usize {
        let st = self.state.lock().expect("lnode tree lock");
        st.get(id).references
    }

    /// Whether the slot behind `id` still holds a live light node.
    pub fn contains(&self, id: LnodeId) -> bool {
        let st = self.state.lock().expect("lnode tree lock");
        st.slots.get(id.0).map(Option::is_some).unwrap_or(false)
    }

    pub fn child_count(&self, dir: LnodeId) -> usize {
        let st = self.state.lock().expect("lnode tree lock");
        let mut count = 0;
        let mut cursor = st.get(dir).entries;
        while let Some(id) = cursor {
            count += 1;
            cursor = st.get(id).next;
        }
        count
    }

    pub fn live_count(&self) -> usize {
        let st = self.state.lock().expect("lnode tree lock");
        st.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Structural audit of the arena: sibling links must be mutual,
    /// parents must own their children, and every live node except a
    /// root must be reachable from its parent's entry list.
    pub fn audit(&self) -> std::result::Result<(), String> {
        let st = self.state.lock().expect("lnode tree lock");
        for (idx, slot) in st.slots.iter().enumerate() {
            let Some(n) = slot else { continue };
            let id = LnodeId(idx);
            if let Some(next) = n.next {
                let next_node =
                    st.slots.get(next.0).and_then(Option::as_ref).ok_or("dangling next link")?;
                if next_node.prev != Some(id) {
                    return Err(format!("next of {:?} does not point back", id));
                }
            }
            match (n.prev, n.dir) {
                (Some(prev), _) => {
                    let prev_node = st
                        .slots
                        .get(prev.0)
                        .and_then(Option::as_ref)
                        .ok_or("dangling prev link")?;
                    if prev_node.next != Some(id) {
                        return Err(format!("prev of {:?} does not point forward", id));
                    }
                }
                (None, Some(dir)) => {
                    let dir_node = st
                        .slots
                        .get(dir.0)
                        .and_then(Option::as_ref)
                        .ok_or("dangling parent link")?;
                    if dir_node.entries != Some(id) {
                        return Err(format!("{:?} is not the head of its parent's entries", id));
                    }
                }
                (None, None) => {}
            }
            if n.references == 0 {
                return Err(format!("{:?} is alive with zero references", id));
            }
        }
        Ok(())
    }
}
