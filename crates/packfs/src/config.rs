// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Deserializer, Serialize};

use crate::Result;

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

static CONFIG: OnceCell<RwLock<Arc<Config>>> = OnceCell::new();

/// The permissions given to a newly created mount directory
pub const DEFAULT_DIR_MODE: u32 = 0o770;
/// The permissions reported for directories inside a mount
pub const DEFAULT_ROOT_MODE: u32 = 0o555;

#[derive(Clone, Default, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Bundle {
    /// The tar archive or directory to serve when none is
    /// given on the command line
    pub path: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Mount {
    /// The directory under which the temporary mount root is created,
    /// defaults to the system temporary directory
    pub temp_root: Option<PathBuf>,

    /// Permission bits for each mount directory
    pub dir_mode: u32,

    /// Permission bits reported for directories in a mounted tree
    pub root_mode: u32,
}

impl Default for Mount {
    fn default() -> Self {
        Self {
            temp_root: None,
            dir_mode: DEFAULT_DIR_MODE,
            root_mode: DEFAULT_ROOT_MODE,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Process {
    /// The shell used to run script bodies
    pub shell: String,
}

impl Default for Process {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

/// Commands used to detach a mount, each is
/// given the mount path as its final argument.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Unmount {
    #[serde(deserialize_with = "command_line")]
    pub graceful_command: Vec<String>,

    #[serde(deserialize_with = "command_line")]
    pub force_command: Vec<String>,
}

impl Default for Unmount {
    fn default() -> Self {
        Self {
            graceful_command: vec!["fusermount".into(), "-u".into()],
            force_command: vec!["sudo".into(), "umount".into(), "-l".into()],
        }
    }
}

/// Accept a command either as a list of arguments or as a single
/// whitespace-separated string, which is all that environment
/// variables can express.
fn command_line<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum CommandLine {
        Args(Vec<String>),
        Line(String),
    }

    Ok(match CommandLine::deserialize(deserializer)? {
        CommandLine::Args(args) => args,
        CommandLine::Line(line) => line.split_whitespace().map(String::from).collect(),
    })
}

/// Configuration values for packfs.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    // These sub-types should aim to only have one level of
    // values within them, otherwise they become impossible to address
    // with environment variables.
    pub bundle: Bundle,
    pub mount: Mount,
    pub process: Process,
    pub unmount: Unmount,
}

impl Config {
    /// Get the current loaded config, loading it if needed
    pub fn current() -> Result<Arc<Self>> {
        get_config()
    }

    /// Load the config from disk, even if it's already been loaded before
    pub fn load() -> Result<Self> {
        load_config()
    }

    /// Load a config from a toml string, without any other sources
    pub fn load_string<S: AsRef<str>>(conf: S) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(
                conf.as_ref(),
                config::FileFormat::Toml,
            ))
            .build()?;
        Ok(Self::deserialize(config)?)
    }

    /// Make this config the current global one
    pub fn make_current(self) -> Result<Arc<Self>> {
        // Note we don't know if we won the race to set the value here,
        // so we still need to try to update it.
        let config = CONFIG.get_or_try_init(|| -> Result<RwLock<Arc<Config>>> {
            Ok(RwLock::new(Arc::new(self.clone())))
        })?;

        let mut lock = config
            .write()
            .map_err(|err| crate::Error::LockPoisonedWrite(err.to_string()))?;
        *Arc::make_mut(&mut lock) = self;
        Ok(Arc::clone(&lock))
    }

    /// The directory in which temporary mount roots are created
    pub fn temp_root(&self) -> PathBuf {
        self.mount
            .temp_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

/// Get the current packfs config, fetching it from disk if needed.
pub fn get_config() -> Result<Arc<Config>> {
    let config = CONFIG.get_or_try_init(|| -> Result<RwLock<Arc<Config>>> {
        Ok(RwLock::new(Arc::new(load_config()?)))
    })?;
    let lock = config
        .read()
        .map_err(|err| crate::Error::LockPoisonedRead(err.to_string()))?;
    Ok(Arc::clone(&*lock))
}

/// Load the packfs configuration from disk, even if it has already been loaded.
///
/// This includes the default, user, and system configurations (if they exist),
/// followed by any `PACKFS_<SECTION>_<NAME>` environment variables.
pub fn load_config() -> Result<Config> {
    use config::{Config as RawConfig, File};

    let mut config_builder = RawConfig::builder()
        // the system config can also be in any support format: toml, yaml, json, ini, etc
        .add_source(File::with_name("/etc/packfs").required(false));
    if let Some(user_config) = dirs::config_dir().map(|dir| dir.join("packfs").join("packfs")) {
        config_builder = config_builder
            .add_source(File::with_name(&format!("{}", user_config.display())).required(false));
    }

    for (var, value) in std::env::vars() {
        let Some(tail) = var.strip_prefix("PACKFS_") else {
            continue;
        };
        let Some((section, name)) = tail.split_once('_') else {
            // a value with no section is not a configuration
            // value, and can be skipped (eg: PACKFS_LOG)
            continue;
        };

        let key = format!("{}.{}", section.to_lowercase(), name.to_lowercase());
        config_builder = config_builder.set_override(key, value)?;
    }

    let config = config_builder.build()?;
    Ok(Config::deserialize(config)?)
}
