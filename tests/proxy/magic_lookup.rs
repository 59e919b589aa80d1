use std::time::Duration;

use nsmux::server::FileServer;
use nsmux::trans::GoawayFlags;
use nsmux::Error;

use crate::common::{read_stream, Fixture};

#[tokio::test]
async fn a_single_translator_is_stacked_on_the_file() {
    let fixture = Fixture::new().await;
    fixture.write_file("f", b"plain contents\n");

    let port = fixture.lookup_port("f,,/bin/cat").await;
    assert_eq!(fixture.fs.registry().len(), 1, "exactly one translator is registered");

    let data = read_stream(&port, 64).await;
    assert_eq!(data, b"plain contents\n");

    fixture
        .fs
        .registry()
        .shutdown_all(GoawayFlags::empty(), true, Duration::from_secs(5))
        .await
        .expect("translators exit");
}

#[tokio::test]
async fn stacked_translators_chain_through_each_other() {
    let fixture = Fixture::new().await;
    fixture.write_file("f", b"twice through cat\n");

    let port = fixture.lookup_port("f,,/bin/cat,,/bin/cat").await;
    assert_eq!(fixture.fs.registry().len(), 2, "both translators are registered");

    let data = read_stream(&port, 64).await;
    assert_eq!(data, b"twice through cat\n");

    fixture
        .fs
        .registry()
        .shutdown_all(GoawayFlags::empty(), true, Duration::from_secs(5))
        .await
        .expect("translators exit");
}

#[tokio::test]
async fn translator_arguments_are_split_on_spaces() {
    let fixture = Fixture::new().await;
    fixture.write_file("f", b"zeros\n");

    // `head -c 3` receives its argument through the argz split
    let port = fixture.lookup_port("f,,/usr/bin/head -c 3").await;
    let data = read_stream(&port, 64).await;
    assert_eq!(data, b"zer");

    fixture
        .fs
        .registry()
        .shutdown_all(GoawayFlags::empty(), true, Duration::from_secs(5))
        .await
        .expect("translators exit");
}

#[tokio::test]
async fn a_leading_separator_is_an_error() {
    let fixture = Fixture::new().await;
    fixture.write_file("f", b"x");
    assert_eq!(fixture.lookup(",,/bin/cat").await.unwrap_err(), Error::NotFound);
}

#[tokio::test]
async fn magic_on_a_missing_file_fails_without_starting_anything() {
    let fixture = Fixture::new().await;
    assert_eq!(fixture.lookup("absent,,/bin/cat").await.unwrap_err(), Error::NotFound);
    assert!(fixture.fs.registry().is_empty());
}

#[tokio::test]
async fn an_unresolvable_translator_fails_the_lookup() {
    let fixture = Fixture::new().await;
    fixture.write_file("f", b"x");

    // a relative name gains the /hurd/ prefix, which does not exist
    // on the test host
    let err = fixture.lookup("f,,gzip -dc").await.unwrap_err();
    assert_eq!(err, Error::NotFound);
    assert!(fixture.fs.registry().is_empty());
}

#[tokio::test]
async fn magic_lookups_create_proxies_not_primaries() {
    let fixture = Fixture::new().await;
    fixture.write_file("f", b"x");

    // a plain lookup first, so the name has a primary heavy node
    let node = fixture.lookup_node("f").await;
    let lnode = node.lnode().expect("normal node has an lnode");
    let tree = fixture.fs.tree();

    let _port = fixture.lookup_port("f,,/bin/cat").await;

    // the stacking went through a proxy; the primary is untouched
    let primary = tree.primary(lnode).expect("primary survives the magic lookup");
    assert!(std::sync::Arc::ptr_eq(&primary, &node));
    assert_eq!(tree.proxy_count(lnode), 0, "the per-lookup proxy is gone again");

    fixture
        .fs
        .registry()
        .shutdown_all(GoawayFlags::FORCE, true, Duration::from_secs(5))
        .await
        .expect("teardown");
}

#[tokio::test]
async fn magic_and_plain_lookups_coexist_on_one_name() {
    let fixture = Fixture::new().await;
    fixture.write_file("f", b"payload");

    let node = fixture.lookup_node("f").await;
    let port = fixture.lookup_port("f,,/bin/cat").await;

    let direct = fixture.fs.attempt_read(&node, 0, 16).await.expect("direct read");
    assert_eq!(direct, b"payload");
    let streamed = read_stream(&port, 16).await;
    assert_eq!(streamed, b"payload");

    fixture
        .fs
        .registry()
        .shutdown_all(GoawayFlags::empty(), true, Duration::from_secs(5))
        .await
        .expect("teardown");
}
