// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;

use super::{Mount, MountState, ServerHandle, UnmountCommands, UnmountMode, UnmountSignal};
use crate::fixtures::*;

/// A command that leaves a marker file next to the mount path
fn marker(suffix: &str) -> Vec<String> {
    vec![
        "sh".into(),
        "-c".into(),
        format!("touch \"$0.{suffix}\""),
    ]
}

/// A command that hangs like an unmount of a busy filesystem
fn blocking() -> Vec<String> {
    vec!["sh".into(), "-c".into(), "sleep 30".into()]
}

fn failing() -> Vec<String> {
    vec!["false".into()]
}

fn fake_server(_path: &Path) -> crate::Result<ServerHandle> {
    Ok(tokio::spawn(async { Ok(()) }))
}

fn new_mount(root: &Path, graceful: Vec<String>, force: Vec<String>) -> Mount {
    Mount::new(
        "service",
        root.join("service"),
        0o770,
        UnmountCommands { graceful, force },
    )
}

#[rstest]
#[tokio::test]
async fn test_mount_creates_directory(tmpdir: tempfile::TempDir) {
    let mount = new_mount(tmpdir.path(), marker("graceful"), marker("forced"));
    assert_eq!(mount.state(), MountState::Unmounted);
    assert_eq!(mount.fs_name(), "packfs-service");
    mount.mount_with(fake_server).await.unwrap();
    assert_eq!(mount.state(), MountState::Mounted);
    let meta = std::fs::metadata(mount.path()).unwrap();
    assert!(meta.is_dir());
    // the process umask may remove bits, but never add them
    assert_eq!(meta.permissions().mode() & !0o770 & 0o777, 0);

    let res = mount.mount_with(fake_server).await;
    assert!(res.is_err(), "should not mount twice");
}

#[rstest]
#[tokio::test]
async fn test_graceful_unmount(tmpdir: tempfile::TempDir) {
    let mount = new_mount(tmpdir.path(), marker("graceful"), marker("forced"));
    mount.mount_with(fake_server).await.unwrap();
    mount.unmount().await;
    assert_eq!(mount.state(), MountState::Unmounted);
    assert!(!mount.path().exists());
    assert!(tmpdir.path().join("service.graceful").exists());
    assert!(!tmpdir.path().join("service.forced").exists());
}

#[rstest]
#[tokio::test]
async fn test_busy_unmount_escalates(tmpdir: tempfile::TempDir) {
    let mount = new_mount(tmpdir.path(), failing(), marker("forced"));
    mount.mount_with(fake_server).await.unwrap();
    mount.unmount().await;
    assert_eq!(mount.state(), MountState::Unmounted);
    assert!(!mount.path().exists());
    assert!(tmpdir.path().join("service.forced").exists());
}

#[rstest]
#[tokio::test]
async fn test_failed_forced_unmount_still_completes(tmpdir: tempfile::TempDir) {
    let mount = new_mount(tmpdir.path(), failing(), failing());
    mount.mount_with(fake_server).await.unwrap();
    mount.unmount().await;
    assert_eq!(mount.state(), MountState::Unmounted);
    assert!(!mount.path().exists());
}

#[rstest]
#[tokio::test]
async fn test_force_unmount_skips_graceful(tmpdir: tempfile::TempDir) {
    let mount = new_mount(tmpdir.path(), marker("graceful"), marker("forced"));
    mount.mount_with(fake_server).await.unwrap();
    mount.force_unmount().await;
    assert_eq!(mount.state(), MountState::Unmounted);
    assert!(!mount.path().exists());
    assert!(!tmpdir.path().join("service.graceful").exists());
    assert!(tmpdir.path().join("service.forced").exists());
}

#[rstest]
#[tokio::test]
async fn test_unmount_is_idempotent(tmpdir: tempfile::TempDir) {
    let mount = new_mount(tmpdir.path(), failing(), marker("forced"));
    // never mounted, nothing runs
    mount.unmount().await;
    mount.force_unmount().await;
    assert!(!tmpdir.path().join("service.forced").exists());

    mount.mount_with(fake_server).await.unwrap();
    mount.force_unmount().await;
    std::fs::remove_file(tmpdir.path().join("service.forced")).unwrap();
    mount.unmount().await;
    mount.force_unmount().await;
    assert!(!tmpdir.path().join("service.forced").exists());
    assert_eq!(mount.state(), MountState::Unmounted);
}

#[rstest]
#[tokio::test]
async fn test_failed_mount_removes_directory(tmpdir: tempfile::TempDir) {
    let mount = new_mount(tmpdir.path(), marker("graceful"), marker("forced"));
    let res = mount
        .mount_with(|_| Err(crate::Error::String("no fuse here".into())))
        .await;
    assert!(res.is_err());
    assert_eq!(mount.state(), MountState::Unmounted);
    assert!(!mount.path().exists());
}

#[rstest]
#[tokio::test]
async fn test_missing_parent_is_an_error(tmpdir: tempfile::TempDir) {
    let mount = Mount::new(
        "static",
        tmpdir.path().join("missing/static"),
        0o770,
        UnmountCommands::default(),
    );
    let res = mount.mount_with(fake_server).await;
    assert!(matches!(res, Err(crate::Error::MountDirError(..))));
    assert_eq!(mount.state(), MountState::Unmounted);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn test_unmount_signal_forces_unmount(tmpdir: tempfile::TempDir) {
    let mount = Arc::new(new_mount(
        tmpdir.path(),
        marker("graceful"),
        marker("forced"),
    ));
    mount.mount_with(fake_server).await.unwrap();

    let signal = UnmountSignal::bind().await.unwrap();
    let port = signal.port();
    let listener = tokio::spawn(signal.serve(Arc::clone(&mount)));

    UnmountSignal::trigger(port).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), mount.unmounted())
        .await
        .expect("mount should be detached");
    assert!(!mount.path().exists());
    assert!(tmpdir.path().join("service.forced").exists());
    assert!(!tmpdir.path().join("service.graceful").exists());

    // further triggers are accepted and ignored
    std::fs::remove_file(tmpdir.path().join("service.forced")).unwrap();
    UnmountSignal::trigger(port).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!tmpdir.path().join("service.forced").exists());
    listener.abort();
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn test_unmount_signal_preempts_blocked_graceful_unmount(tmpdir: tempfile::TempDir) {
    init_logging();
    let mount = Arc::new(new_mount(tmpdir.path(), blocking(), marker("forced")));
    mount.mount_with(fake_server).await.unwrap();

    let signal = UnmountSignal::bind().await.unwrap();
    let port = signal.port();
    let listener = tokio::spawn(signal.serve(Arc::clone(&mount)));

    let mut state = mount.subscribe();
    let graceful = tokio::spawn({
        let mount = Arc::clone(&mount);
        async move { mount.unmount().await }
    });
    state
        .wait_for(|s| *s == MountState::Unmounting(UnmountMode::Graceful))
        .await
        .unwrap();

    UnmountSignal::trigger(port).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), mount.unmounted())
        .await
        .expect("forced unmount should not wait for the graceful one");
    assert!(tmpdir.path().join("service.forced").exists());
    assert!(!mount.path().exists());

    // the abandoned graceful attempt returns once the mount is detached
    tokio::time::timeout(Duration::from_secs(5), graceful)
        .await
        .expect("graceful unmount should be abandoned")
        .unwrap();
    assert_eq!(mount.state(), MountState::Unmounted);
    listener.abort();
}

#[rstest]
#[tokio::test]
async fn test_unmount_waits_for_forced_unmount_in_progress(tmpdir: tempfile::TempDir) {
    // the forced command is slow enough for a second caller to arrive
    let slow_force = vec![
        "sh".into(),
        "-c".into(),
        "sleep 0.2; touch \"$0.forced\"".into(),
    ];
    let mount = Arc::new(new_mount(tmpdir.path(), marker("graceful"), slow_force));
    mount.mount_with(fake_server).await.unwrap();

    let mut state = mount.subscribe();
    let forced = tokio::spawn({
        let mount = Arc::clone(&mount);
        async move { mount.force_unmount().await }
    });
    state
        .wait_for(|s| *s == MountState::Unmounting(UnmountMode::Forced))
        .await
        .unwrap();
    mount.unmount().await;
    assert_eq!(mount.state(), MountState::Unmounted);
    assert!(tmpdir.path().join("service.forced").exists());
    assert!(!tmpdir.path().join("service.graceful").exists());
    forced.await.unwrap();
}
