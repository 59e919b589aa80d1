use std::time::Duration;

use nsmux::trans::{start, GoawayFlags, Registry, Substrate};
use nsmux::Error;

use crate::common::Fixture;

fn substrate(fixture: &Fixture, name: &str) -> Substrate {
    Substrate::File(std::fs::File::open(fixture.path(name)).expect("open substrate"))
}

#[tokio::test]
async fn long_running_translators_terminate_gracefully() {
    let fixture = Fixture::new().await;
    fixture.write_file("f", b"x");

    let port = fixture.lookup_port("f,,/bin/sleep 30").await;
    assert_eq!(fixture.fs.registry().len(), 1);

    fixture
        .fs
        .registry()
        .shutdown_all(GoawayFlags::empty(), true, Duration::from_secs(5))
        .await
        .expect("sleep dies on SIGTERM");
    assert!(fixture.fs.registry().is_empty());
    drop(port);
}

#[tokio::test]
async fn shutdown_walks_newest_first_and_resumes_after_errors() {
    let fixture = Fixture::new().await;
    fixture.write_file("f", b"x");
    let registry = Registry::new();

    // a translator that ignores the polite request
    let stubborn = start(
        &["/bin/sh".into(), "-c".into(), "trap '' TERM; sleep 30".into()],
        substrate(&fixture, "f"),
        Duration::from_secs(5),
    )
    .await
    .expect("start stubborn translator");
    registry.register(stubborn.control.clone(), stubborn.pid);

    let polite = start(
        &["/bin/sleep".into(), "30".into()],
        substrate(&fixture, "f"),
        Duration::from_secs(5),
    )
    .await
    .expect("start polite translator");
    registry.register(polite.control.clone(), polite.pid);

    // give the shell a moment to install its trap
    tokio::time::sleep(Duration::from_millis(200)).await;

    // newest first: the polite one dies, the stubborn one blocks the walk
    let err = registry
        .shutdown_all(GoawayFlags::empty(), true, Duration::from_millis(500))
        .await
        .unwrap_err();
    assert_eq!(err, Error::Busy);
    assert_eq!(registry.pids(), vec![stubborn.pid], "the walk resumes at the failure");

    // the forced retry clears the rest
    registry
        .shutdown_all(GoawayFlags::FORCE, true, Duration::from_secs(5))
        .await
        .expect("forced shutdown");
    assert!(registry.is_empty());
}

#[tokio::test]
async fn unregister_leaves_the_translator_running() {
    let fixture = Fixture::new().await;
    fixture.write_file("f", b"x");
    let registry = Registry::new();

    let started = start(
        &["/bin/sleep".into(), "30".into()],
        substrate(&fixture, "f"),
        Duration::from_secs(5),
    )
    .await
    .expect("start translator");
    let id = registry.register(started.control.clone(), started.pid);

    registry.unregister(id);
    assert!(registry.is_empty());

    // still alive: a graceful goaway finds a process to terminate
    started
        .control
        .goaway(GoawayFlags::empty(), true, Duration::from_secs(5))
        .await
        .expect("terminate directly");
}
