// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

//! Build the bootstrap process that runs a bundle's entry script.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use bytes::{BufMut, Bytes, BytesMut};

use crate::supervisor::{EnvHook, ProcessSpec};

#[cfg(test)]
#[path = "./bootstrap_test.rs"]
mod bootstrap_test;

/// The entry script, found at the root of every bundle
pub const MAIN_SCRIPT: &str = "main.sh";

/// The port of the spawn service, given to every process
pub const START_CHILD_PORT_VAR: &str = "start_child_port";
/// The running packfs executable, given to every process
pub const EXE_VAR: &str = "exe";
pub const CWD_VAR: &str = "cwd";
pub const SERVICE_DIR_VAR: &str = "service_dir";
pub const STATIC_DIR_VAR: &str = "static_dir";
pub const UMNT_SERVICE_PORT_VAR: &str = "umnt_service_port";
pub const UMNT_STATIC_PORT_VAR: &str = "umnt_static_port";

/// Shell functions made available to the entry script.
pub const PRELUDE: &str = r#"# forward TERM and INT to a single tracked child
prep_term()
{
    unset term_child_pid
    unset term_kill_needed
    trap 'handle_term' TERM INT
}

handle_term()
{
    if [ "${term_child_pid}" ]; then
        kill -TERM "${term_child_pid}" 2>/dev/null
    else
        term_kill_needed="yes"
    fi
}

wait_term()
{
    if [ "${term_kill_needed}" ]; then
        kill -TERM "${term_child_pid}" 2>/dev/null
    fi
    wait ${term_child_pid} 2>/dev/null
    trap - TERM INT
    wait ${term_child_pid} 2>/dev/null
}

# run a supervised command, printing its pid
start_child()
{
    "$exe" '!cmd' "$start_child_port" "$@"
}

# run a supervised script read from stdin, printing its pid
start_script()
{
    "$exe" '!script' "$start_child_port"
}

# detach a busy mount, given one of the umnt_*_port values
force_umount()
{
    "$exe" '!umount' "$1"
}

"#;

/// Everything the bootstrap needs to know about its surroundings.
#[derive(Debug, Clone)]
pub struct BootstrapEnv {
    /// The directory that packfs was started from
    pub cwd: PathBuf,
    /// The temporary directory holding both mounts
    pub mount_root: PathBuf,
    pub service_dir: PathBuf,
    pub static_dir: PathBuf,
    pub umnt_service_port: u16,
    pub umnt_static_port: u16,
}

impl BootstrapEnv {
    fn vars(&self) -> Vec<(&'static str, OsString)> {
        vec![
            (CWD_VAR, self.cwd.clone().into_os_string()),
            (SERVICE_DIR_VAR, self.service_dir.clone().into_os_string()),
            (STATIC_DIR_VAR, self.static_dir.clone().into_os_string()),
            (UMNT_SERVICE_PORT_VAR, self.umnt_service_port.to_string().into()),
            (UMNT_STATIC_PORT_VAR, self.umnt_static_port.to_string().into()),
        ]
    }
}

/// Prepend the prelude to the given entry script
pub fn build_script(main: &[u8]) -> Bytes {
    let mut script = BytesMut::with_capacity(PRELUDE.len() + main.len());
    script.put_slice(PRELUDE.as_bytes());
    script.put_slice(main);
    script.freeze()
}

/// Describe the bootstrap process for an entry script.
///
/// The bootstrap leads its own process group, works from the mount
/// root and receives the trailing command line arguments as its
/// positional parameters.
pub fn build_bootstrap_spec<I, A>(env: &BootstrapEnv, main: &[u8], args: I) -> ProcessSpec
where
    I: IntoIterator<Item = A>,
    A: Into<OsString>,
{
    let mut spec = ProcessSpec::script(build_script(main))
        .with_script_args(args)
        .with_current_dir(&env.mount_root)
        .in_new_process_group();
    for (key, value) in env.vars() {
        spec = spec.with_env(key, value);
    }
    spec
}

/// The launch hook that lets every supervised process reach
/// back to the spawn service through the packfs executable.
pub fn launch_hook(spawn_port: u16, exe: &Path) -> EnvHook {
    EnvHook::new()
        .with_var(START_CHILD_PORT_VAR, spawn_port.to_string())
        .with_var(EXE_VAR, exe)
}
