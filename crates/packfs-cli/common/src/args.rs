// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

use tracing_subscriber::prelude::*;

#[cfg(test)]
#[path = "./args_test.rs"]
mod args_test;

const PACKFS_LOG: &str = "PACKFS_LOG";
/// Setting this variable to `1` raises the verbosity by one level
const DEBUG_VAR: &str = "debug";

/// Command line flags for configuring log output
#[derive(Debug, Clone, Default, clap::Args)]
pub struct Logging {
    /// Make output more verbose, can be specified more than once
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Logging {
    /// The effective verbosity, including the `debug=1` convention
    pub fn verbosity(&self) -> usize {
        let debug = std::env::var(DEBUG_VAR).is_ok_and(|v| v == "1");
        self.verbose as usize + usize::from(debug)
    }
}

/// The filter directives used for a verbosity level.
///
/// An existing `PACKFS_LOG` value is only respected at the
/// default level, any explicit verbosity replaces it.
pub fn log_directives(verbosity: usize, existing: Option<String>) -> String {
    match verbosity {
        0 => existing.unwrap_or_else(|| "packfs=info,warn".to_string()),
        1 => "packfs=debug,info".to_string(),
        2 => "packfs=trace,info".to_string(),
        3 => "packfs=trace,debug".to_string(),
        _ => "trace".to_string(),
    }
}

/// Install the global tracing subscriber.
///
/// The chosen directives are exported as `PACKFS_LOG` so that
/// re-executed children log the same way. This must be called
/// before any other threads are started.
pub fn configure_logging(verbosity: usize) {
    let mut config = log_directives(verbosity, std::env::var(PACKFS_LOG).ok());
    // Safety: called once at startup, before the runtime exists
    unsafe { std::env::set_var(PACKFS_LOG, &config) };
    if let Ok(overrides) = std::env::var("RUST_LOG") {
        config.push(',');
        config.push_str(&overrides);
    }
    let env_filter = tracing_subscriber::filter::EnvFilter::from(config);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(verbosity > 2);
    let sub = tracing_subscriber::registry().with(fmt_layer.with_filter(env_filter));
    if let Err(err) = tracing::subscriber::set_global_default(sub) {
        eprintln!("Failed to set default logger: {err}");
    }
}

/// Run a fallible command body to completion, logging
/// any error and turning it into an exit code.
#[macro_export]
macro_rules! handle_result {
    ($result:expr) => {{
        match $result {
            Err(err) => {
                tracing::error!("{err:?}");
                1
            }
            Ok(code) => code,
        }
    }};
}

/// Build the multi-threaded runtime that commands run on,
/// returning early with exit code 1 if it cannot be created.
#[macro_export]
macro_rules! runtime {
    () => {{
        match tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
        {
            Err(err) => {
                tracing::error!("Failed to establish runtime: {:?}", err);
                return 1;
            }
            Ok(rt) => rt,
        }
    }};
}
