use nsmux::server::{Credentials, FileServer};
use nsmux::ulfs::{FileTime, OpenFlags};
use nsmux::Error;

use crate::common::{cred, Fixture};

#[tokio::test]
async fn mutations_are_unsupported() {
    let fixture = Fixture::new().await;
    fixture.write_file("f", b"x");
    let root = fixture.root();
    let node = fixture.lookup_node("f").await;
    let user = cred();

    assert_eq!(
        fixture.fs.attempt_create_file(&user, &root, "new", 0o644).await.unwrap_err(),
        Error::Unsupported
    );
    assert_eq!(fixture.fs.attempt_unlink(&user, &root, "f").await.unwrap_err(), Error::Unsupported);
    assert_eq!(
        fixture.fs.attempt_rename(&user, &root, "f", &root, "g").await.unwrap_err(),
        Error::Unsupported
    );
    assert_eq!(
        fixture.fs.attempt_mkdir(&user, &root, "d", 0o755).await.unwrap_err(),
        Error::Unsupported
    );
    assert_eq!(fixture.fs.attempt_rmdir(&user, &root, "d").await.unwrap_err(), Error::Unsupported);
    assert_eq!(
        fixture.fs.attempt_chmod(&user, &node, 0o600).await.unwrap_err(),
        Error::Unsupported
    );
    assert_eq!(
        fixture.fs.attempt_chown(&user, &node, 1, 1).await.unwrap_err(),
        Error::Unsupported
    );
    assert_eq!(
        fixture.fs.attempt_set_size(&user, &node, 0).await.unwrap_err(),
        Error::Unsupported
    );
    assert_eq!(fixture.fs.attempt_statfs(&user, &node).await.unwrap_err(), Error::Unsupported);
    assert_eq!(
        fixture.fs.attempt_mksymlink(&user, &node, "target").await.unwrap_err(),
        Error::Unsupported
    );
    assert_eq!(
        fixture.fs.attempt_write(&user, &node, 0, b"data").await.unwrap_err(),
        Error::Unsupported
    );
    assert_eq!(fixture.fs.attempt_readlink(&user, &node).await.unwrap_err(), Error::Unsupported);
}

#[tokio::test]
async fn write_delegation_is_opt_in() {
    let fixture = Fixture::with_config(|config| config.settings.delegate_writes = true).await;
    fixture.write_file("f", b"before!");

    let node = fixture.lookup_node("f").await;
    let written =
        fixture.fs.attempt_write(&cred(), &node, 0, b"after.").await.expect("delegated write");
    assert_eq!(written, 6);
    assert_eq!(std::fs::read(fixture.path("f")).expect("reread"), b"after.!");
}

#[tokio::test]
async fn unlink_delegation_is_opt_in() {
    let fixture = Fixture::with_config(|config| config.settings.delegate_writes = true).await;
    fixture.write_file("doomed", b"x");

    fixture
        .fs
        .attempt_unlink(&cred(), &fixture.root(), "doomed")
        .await
        .expect("delegated unlink");
    assert!(!fixture.path("doomed").exists());

    assert_eq!(
        fixture.fs.attempt_unlink(&cred(), &fixture.root(), "doomed").await.unwrap_err(),
        Error::NotFound
    );
}

#[tokio::test]
async fn report_access_reflects_the_mode() {
    let fixture = Fixture::new().await;
    fixture.write_file("f", b"x");
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(fixture.path("f"), std::fs::Permissions::from_mode(0o400))
        .expect("chmod fixture");

    let node = fixture.lookup_node("f").await;
    let access = fixture.fs.report_access(&cred(), &node).await.expect("access");
    if cred().uid == 0 {
        assert!(access.contains(OpenFlags::READ | OpenFlags::WRITE));
    } else {
        assert!(access.contains(OpenFlags::READ));
        assert!(!access.contains(OpenFlags::WRITE));
        assert!(!access.contains(OpenFlags::EXEC));
    }
}

#[tokio::test]
async fn open_permission_checks_iterate_the_flag_triple() {
    let fixture = Fixture::new().await;
    fixture.write_file("f", b"x");
    let node = fixture.lookup_node("f").await;
    let stat = fixture.fs.validate_stat(&node, &cred()).await.expect("stat");

    assert!(fixture.fs.check_open_permissions(&cred(), &stat, OpenFlags::READ).is_ok());
    let nobody = Credentials { uid: stat.uid + 1, gid: stat.gid + 1 };
    assert_eq!(
        fixture.fs.check_open_permissions(&nobody, &stat, OpenFlags::EXEC).unwrap_err(),
        Error::Permission
    );
}

#[tokio::test]
async fn utimes_touch_the_cached_stat() {
    let fixture = Fixture::new().await;
    fixture.write_file("f", b"x");
    let node = fixture.lookup_node("f").await;
    // populate the cached stat first
    fixture.fs.validate_stat(&node, &cred()).await.expect("stat");

    let stamp = FileTime { seconds: 1_000_000, nanos: 42 };
    fixture
        .fs
        .attempt_utimes(&cred(), &node, Some(stamp), None)
        .await
        .expect("utimes");

    let state = node.state.lock().await;
    let stat = state.stat.as_ref().expect("stat cached");
    assert_eq!(stat.atime, stamp);
    assert!(stat.mtime.seconds >= stamp.seconds, "mtime fell back to now");
}

#[tokio::test]
async fn utimes_require_ownership() {
    let fixture = Fixture::new().await;
    fixture.write_file("f", b"x");
    let node = fixture.lookup_node("f").await;
    fixture.fs.validate_stat(&node, &cred()).await.expect("stat");

    let stranger = Credentials { uid: cred().uid + 1, gid: cred().gid };
    assert_eq!(
        fixture.fs.attempt_utimes(&stranger, &node, None, None).await.unwrap_err(),
        Error::Permission
    );
}

#[tokio::test]
async fn translator_cntl_is_unsupported_without_a_translator() {
    let fixture = Fixture::new().await;
    fixture.write_file("f", b"x");
    let node = fixture.lookup_node("f").await;

    assert_eq!(
        fixture.fs.get_translator_cntl(&fixture.root()).await.unwrap_err(),
        Error::Unsupported
    );
    assert_eq!(fixture.fs.get_translator_cntl(&node).await.unwrap_err(), Error::Unsupported);
}
