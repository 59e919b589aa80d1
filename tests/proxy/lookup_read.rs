use std::os::unix::fs::MetadataExt;

use nsmux::server::{FileServer, Lookup};
use nsmux::ulfs::{FileType, OpenFlags};
use nsmux::Error;

use crate::common::{cred, Fixture};

#[tokio::test]
async fn plain_mirror_returns_identical_bytes_and_mode() {
    let fixture = Fixture::new().await;
    fixture.write_file("a.txt", b"hello\n");

    let node = fixture.lookup_node("a.txt").await;
    let data = fixture.fs.attempt_read(&node, 0, 6).await.expect("read");
    assert_eq!(data, b"hello\n");

    let stat = fixture.fs.validate_stat(&node, &cred()).await.expect("stat");
    let source = std::fs::metadata(fixture.path("a.txt")).expect("source stat");
    assert_eq!(stat.mode, source.mode());
    assert_eq!(stat.size, 6);
    assert_eq!(stat.file_type, FileType::Regular);
}

#[tokio::test]
async fn nested_lookup_walks_directories() {
    let fixture = Fixture::new().await;
    fixture.create_dir("sub");
    fixture.create_dir("sub/deeper");
    std::fs::write(fixture.path("sub/deeper/leaf"), b"leaf data").expect("fixture");

    let node = fixture.lookup_node("sub/deeper/leaf").await;
    let data = fixture.fs.attempt_read(&node, 5, 4).await.expect("read at offset");
    assert_eq!(data, b"data");
}

#[tokio::test]
async fn missing_entries_are_not_found() {
    let fixture = Fixture::new().await;
    assert_eq!(fixture.lookup("absent").await.unwrap_err(), Error::NotFound);
    assert_eq!(fixture.lookup("no/such/path").await.unwrap_err(), Error::NotFound);
}

#[tokio::test]
async fn files_cannot_be_walked_through() {
    let fixture = Fixture::new().await;
    fixture.write_file("plain", b"x");
    assert_eq!(fixture.lookup("plain/inner").await.unwrap_err(), Error::NotDir);
}

#[tokio::test]
async fn trailing_slash_demands_a_directory() {
    let fixture = Fixture::new().await;
    fixture.write_file("plain", b"x");
    fixture.create_dir("sub");

    assert_eq!(fixture.lookup("plain/").await.unwrap_err(), Error::NotDir);
    let node = fixture.lookup_node("sub/").await;
    let stat = fixture.fs.validate_stat(&node, &cred()).await.expect("stat");
    assert!(stat.is_dir());
}

#[tokio::test]
async fn dot_resolves_to_the_directory_itself() {
    let fixture = Fixture::new().await;
    let root = fixture.root();
    let node = fixture.lookup_node(".").await;
    assert!(std::sync::Arc::ptr_eq(&node, &root));

    let node = fixture.lookup_node("").await;
    assert!(std::sync::Arc::ptr_eq(&node, &root));
}

#[tokio::test]
async fn dot_dot_at_the_root_redirects_to_the_parent() {
    let fixture = Fixture::new().await;
    match fixture.lookup("..").await.expect("lookup") {
        Lookup::ReauthParent { rest } => assert!(rest.is_empty()),
        other => panic!("expected a reauth redirect, got {:?}", other),
    }
}

#[tokio::test]
async fn dot_dot_walks_back_to_the_parent_directory() {
    let fixture = Fixture::new().await;
    fixture.create_dir("sub");
    fixture.write_file("marker", b"here");

    let node = fixture.lookup_node("sub/../marker").await;
    let data = fixture.fs.attempt_read(&node, 0, 4).await.expect("read");
    assert_eq!(data, b"here");
}

#[tokio::test]
async fn escaped_commas_are_ordinary_names() {
    let fixture = Fixture::new().await;
    // the on-disk name carries two literal commas
    fixture.write_file("x,,y", b"literal");

    let node = fixture.lookup_node("x,,,y").await;
    let data = fixture.fs.attempt_read(&node, 0, 16).await.expect("read");
    assert_eq!(data, b"literal");
    assert!(fixture.fs.registry().is_empty(), "no translator was started");
}

#[tokio::test]
async fn relative_symlinks_are_chased() {
    let fixture = Fixture::new().await;
    fixture.write_file("target", b"behind the link");
    fixture.symlink("target", "link");

    let node = fixture.lookup_node("link").await;
    let data = fixture.fs.attempt_read(&node, 0, 32).await.expect("read");
    assert_eq!(data, b"behind the link");
}

#[tokio::test]
async fn symlinks_in_the_middle_of_a_path_are_chased() {
    let fixture = Fixture::new().await;
    fixture.create_dir("real");
    std::fs::write(fixture.path("real/leaf"), b"deep").expect("fixture");
    fixture.symlink("real", "alias");

    let node = fixture.lookup_node("alias/leaf").await;
    let data = fixture.fs.attempt_read(&node, 0, 8).await.expect("read");
    assert_eq!(data, b"deep");
}

#[tokio::test]
async fn absolute_symlinks_redirect_outside_the_proxy() {
    let fixture = Fixture::new().await;
    fixture.symlink("/etc/hostname", "away");

    match fixture.lookup("away").await.expect("lookup") {
        Lookup::Magical { path } => assert_eq!(path, "/etc/hostname"),
        other => panic!("expected a magical redirect, got {:?}", other),
    }
}

#[tokio::test]
async fn a_symlink_loop_is_detected() {
    let fixture = Fixture::new().await;
    fixture.symlink("s", "s");
    assert_eq!(fixture.lookup("s").await.unwrap_err(), Error::Loop);
}

#[tokio::test]
async fn symlink_nodes_are_returned_verbatim_with_nolink() {
    let fixture = Fixture::new().await;
    fixture.write_file("target", b"x");
    fixture.symlink("target", "link");

    let result = fixture
        .fs
        .dir_lookup(
            &cred(),
            &fixture.root(),
            "link",
            OpenFlags::READ | OpenFlags::NOLINK | OpenFlags::NOTRANS,
        )
        .await
        .expect("lookup");
    match result {
        Lookup::Node(node) => {
            let state = node.state.lock().await;
            assert_eq!(
                state.stat.as_ref().expect("stat present").file_type,
                FileType::Symlink
            );
        }
        other => panic!("expected the link node itself, got {:?}", other),
    }
}
