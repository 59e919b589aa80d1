#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use nsmux::lnode::{HeavyRef, LnodeId, Tree};

#[derive(Debug, Arbitrary)]
enum Op {
    CreateUnder { parent: u8, name: u8 },
    Get { parent: u8, name: u8 },
    RefAdd { node: u8 },
    RefRemove { node: u8 },
    AddProxy { node: u8 },
    RemoveProxy { node: u8 },
    PathConstruct { node: u8 },
}

/// A node the driver still owes references to.
struct Tracked {
    id: LnodeId,
    owned: usize,
    proxies: Vec<u64>,
}

fuzz_target!(|ops: Vec<Op>| {
    let tree = Tree::new();
    let root = tree.create(None);
    tree.init_root_identity(root, "/fuzz".into(), "fuzz".into());

    let mut tracked: Vec<Tracked> = Vec::new();
    let mut next_token: u64 = 1;

    let pick = |tracked: &Vec<Tracked>, raw: u8| -> Option<usize> {
        if tracked.is_empty() {
            None
        } else {
            Some(raw as usize % tracked.len())
        }
    };

    for op in ops {
        match op {
            Op::CreateUnder { parent, name } => {
                if tracked.len() >= 64 {
                    continue;
                }
                let parent_id = match pick(&tracked, parent) {
                    Some(idx) => tracked[idx].id,
                    None => root,
                };
                let id = tree.create_under(parent_id, &format!("n{}", name % 8));
                tracked.push(Tracked { id, owned: 1, proxies: Vec::new() });
            }
            Op::Get { parent, name } => {
                let parent_id = match pick(&tracked, parent) {
                    Some(idx) => tracked[idx].id,
                    None => root,
                };
                if let Ok(found) = tree.get(parent_id, &format!("n{}", name % 8)) {
                    match tracked.iter_mut().find(|t| t.id == found) {
                        Some(t) => t.owned += 1,
                        None => tree.ref_remove(found),
                    }
                }
            }
            Op::RefAdd { node } => {
                if let Some(idx) = pick(&tracked, node) {
                    tree.ref_add(tracked[idx].id);
                    tracked[idx].owned += 1;
                }
            }
            Op::RefRemove { node } => {
                if let Some(idx) = pick(&tracked, node) {
                    if tracked[idx].owned > 0 {
                        tracked[idx].owned -= 1;
                        tree.ref_remove(tracked[idx].id);
                    }
                }
            }
            Op::AddProxy { node } => {
                if let Some(idx) = pick(&tracked, node) {
                    let token = next_token;
                    next_token += 1;
                    tree.add_proxy(
                        tracked[idx].id,
                        HeavyRef { token, node: std::sync::Weak::new() },
                    );
                    tracked[idx].proxies.push(token);
                }
            }
            Op::RemoveProxy { node } => {
                if let Some(idx) = pick(&tracked, node) {
                    if let Some(token) = tracked[idx].proxies.pop() {
                        tree.remove_proxy(tracked[idx].id, token);
                    }
                }
            }
            Op::PathConstruct { node } => {
                if let Some(idx) = pick(&tracked, node) {
                    let path = tree.path_construct(tracked[idx].id).expect("path builds");
                    assert!(path.starts_with("/fuzz"));
                }
            }
        }

        // dead entries drop out of the driver's books
        tracked.retain(|t| tree.contains(t.id));
        tree.audit().expect("tree stays consistent");
    }

    // release everything the driver still owns; only the root and
    // nodes kept alive by descendants may remain, and releasing in
    // any order must converge to the root alone
    loop {
        let mut released = false;
        for idx in 0..tracked.len() {
            let t = &mut tracked[idx];
            if !tree.contains(t.id) {
                continue;
            }
            while let Some(token) = t.proxies.pop() {
                tree.remove_proxy(t.id, token);
                released = true;
                if !tree.contains(t.id) {
                    break;
                }
            }
            if tree.contains(t.id) {
                while t.owned > 0 {
                    t.owned -= 1;
                    tree.ref_remove(t.id);
                    released = true;
                    if !tree.contains(t.id) {
                        break;
                    }
                }
            }
        }
        tracked.retain(|t| tree.contains(t.id));
        if !released || tracked.is_empty() {
            break;
        }
    }
    tree.audit().expect("tree stays consistent");
    assert_eq!(tree.live_count(), 1, "everything but the root is destroyed");
});
