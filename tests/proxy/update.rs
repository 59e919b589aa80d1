use nsmux::node::{self, NodeFlags};
use nsmux::server::{FileServer, Lookup};
use nsmux::ulfs::{FilePort, OpenFlags, Port};
use nsmux::Error;

use crate::common::{cred, Fixture};

#[tokio::test]
async fn a_stale_node_is_refreshed_against_the_underlying_tree() {
    let fixture = Fixture::new().await;
    fixture.write_file("f", b"first");

    let node = fixture.lookup_node("f").await;
    let old_port = {
        let mut state = node.state.lock().await;
        state.flags.remove(NodeFlags::ULFS_UPTODATE);
        state.flags.insert(NodeFlags::INVALIDATE);
        state.port.as_ref().map(|port| port.id())
    };

    let stat = fixture.fs.validate_stat(&node, &cred()).await.expect("stat after refresh");
    assert_eq!(stat.size, 5);

    let state = node.state.lock().await;
    assert!(state.flags.contains(NodeFlags::ULFS_UPTODATE));
    assert!(!state.flags.contains(NodeFlags::INVALIDATE));
    assert_ne!(state.port.as_ref().map(|port| port.id()), old_port, "the port was reopened");
}

#[tokio::test]
async fn a_vanished_file_defers_the_failure_to_the_next_use() {
    let fixture = Fixture::new().await;
    fixture.write_file("gone", b"x");

    let node = fixture.lookup_node("gone").await;
    std::fs::remove_file(fixture.path("gone")).expect("remove behind the proxy");
    node.state.lock().await.flags.remove(NodeFlags::ULFS_UPTODATE);

    // the refresh itself succeeds and leaves a null port behind
    node::update(&node, &fixture.root(), fixture.fs.underlying())
        .await
        .expect("update defers the failure");
    {
        let state = node.state.lock().await;
        assert!(state.port.is_none());
        assert!(state.flags.contains(NodeFlags::ULFS_UPTODATE));
    }

    // the next use reports the failure
    assert_eq!(fixture.fs.attempt_read(&node, 0, 4).await.unwrap_err(), Error::NotFound);
}

#[tokio::test]
async fn the_root_is_never_refreshed() {
    let fixture = Fixture::new().await;
    let root = fixture.root();
    let before = {
        let state = root.state.lock().await;
        state.port.as_ref().map(|port| port.id())
    };

    node::update(&root, &root, fixture.fs.underlying()).await.expect("no-op");

    let state = root.state.lock().await;
    assert_eq!(state.port.as_ref().map(|port| port.id()), before);
    assert!(state.flags.contains(NodeFlags::ULFS_FIXED));
}

#[tokio::test]
async fn dot_dot_on_a_shadow_node_redirects_to_the_parent() {
    let fixture = Fixture::new().await;
    let port = FilePort::open(
        fixture.tempdir.path().to_path_buf(),
        OpenFlags::READ | OpenFlags::DIRECTORY,
    )
    .await
    .expect("open substrate dir");
    let shadow = nsmux::node::Node::create_from_port(fixture.fs.tree(), Port::File(port));

    match fixture
        .fs
        .dir_lookup(&cred(), &shadow, "../somewhere", OpenFlags::READ)
        .await
        .expect("lookup")
    {
        Lookup::ReauthParent { rest } => assert_eq!(rest, "somewhere"),
        other => panic!("expected a reauth redirect, got {:?}", other),
    }
}

#[tokio::test]
async fn symlink_chains_up_to_the_bound_resolve() {
    let fixture = Fixture::new().await;
    fixture.write_file("target", b"end of the chain");

    // twelve hops end on the file
    fixture.symlink("target", "l1");
    for i in 2..=12 {
        fixture.symlink(&format!("l{}", i - 1), &format!("l{}", i));
    }

    let node = fixture.lookup_node("l12").await;
    let data = fixture.fs.attempt_read(&node, 0, 32).await.expect("read");
    assert_eq!(data, b"end of the chain");

    // a thirteenth hop crosses the bound
    fixture.symlink("l12", "l13");
    assert_eq!(fixture.lookup("l13").await.unwrap_err(), Error::Loop);
}
