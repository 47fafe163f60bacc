// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

use std::ffi::OsString;

/// Adjusts every command before the supervisor launches it.
pub trait LaunchHook: Send + Sync {
    fn prepare(&self, cmd: &mut tokio::process::Command);
}

/// A hook that leaves commands untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHook;

impl LaunchHook for NoHook {
    fn prepare(&self, _cmd: &mut tokio::process::Command) {}
}

/// Injects a fixed set of environment variables into every command.
#[derive(Debug, Default, Clone)]
pub struct EnvHook {
    vars: Vec<(OsString, OsString)>,
}

impl EnvHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var<K: Into<OsString>, V: Into<OsString>>(mut self, key: K, value: V) -> Self {
        self.vars.push((key.into(), value.into()));
        self
    }

    pub fn vars(&self) -> impl Iterator<Item = (&OsString, &OsString)> {
        self.vars.iter().map(|(k, v)| (k, v))
    }
}

impl LaunchHook for EnvHook {
    fn prepare(&self, cmd: &mut tokio::process::Command) {
        cmd.envs(self.vars());
    }
}
