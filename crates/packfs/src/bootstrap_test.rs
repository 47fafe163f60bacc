// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;
use std::sync::Arc;

use rstest::rstest;

use super::{BootstrapEnv, PRELUDE, build_bootstrap_spec, build_script, launch_hook};
use crate::fixtures::*;
use crate::supervisor::{Exit, NoHook, Program, Supervisor};

fn test_env(root: &Path) -> BootstrapEnv {
    BootstrapEnv {
        cwd: "/home/user".into(),
        mount_root: root.to_owned(),
        service_dir: root.join("service"),
        static_dir: root.join("static"),
        umnt_service_port: 4001,
        umnt_static_port: 4002,
    }
}

#[rstest]
fn test_script_starts_with_prelude() {
    let script = build_script(b"echo main\n");
    assert!(script.starts_with(PRELUDE.as_bytes()));
    assert!(script.ends_with(b"echo main\n"));
}

#[rstest]
fn test_bootstrap_spec(tmpdir: tempfile::TempDir) {
    let env = test_env(tmpdir.path());
    let spec = build_bootstrap_spec(&env, b"exit 0\n", ["one", "two"]);
    assert!(spec.new_process_group);
    assert_eq!(spec.current_dir.as_deref(), Some(tmpdir.path()));
    match &spec.program {
        Program::Script { args, .. } => assert_eq!(args, &["one", "two"]),
        other => panic!("expected a script, got {other:?}"),
    }
    let keys: Vec<_> = spec
        .env
        .iter()
        .map(|(k, _)| k.to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        keys,
        vec![
            "cwd",
            "service_dir",
            "static_dir",
            "umnt_service_port",
            "umnt_static_port"
        ]
    );
}

#[rstest]
fn test_launch_hook_vars() {
    let hook = launch_hook(1234, Path::new("/usr/bin/packfs"));
    let vars: Vec<_> = hook
        .vars()
        .map(|(k, v)| (k.to_string_lossy().into_owned(), v.to_string_lossy().into_owned()))
        .collect();
    assert_eq!(
        vars,
        vec![
            ("start_child_port".to_string(), "1234".to_string()),
            ("exe".to_string(), "/usr/bin/packfs".to_string()),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn test_bootstrap_runs_main(tmpdir: tempfile::TempDir) {
    let env = test_env(tmpdir.path());
    let main = br#"
for fn in prep_term handle_term wait_term start_child start_script force_umount; do
    command -v "$fn" >/dev/null || exit 10
done
[ "$1" = hello ] || exit 11
[ "$umnt_static_port" = 4002 ] || exit 12
[ "$(pwd -P)" = "$2" ] || exit 13
exit 5
"#;
    let root = tmpdir.path().canonicalize().unwrap();
    let spec = build_bootstrap_spec(&env, main, [std::ffi::OsString::from("hello"), root.into()]);
    let supervisor = Arc::new(Supervisor::new(NoHook));
    let process = supervisor.start(spec).await.unwrap();
    assert_eq!(process.wait().await, Exit::Code(5));
}
