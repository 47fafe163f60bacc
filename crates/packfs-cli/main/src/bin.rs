// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use packfs_cli_common as cli;

mod cmd_client;
mod cmd_run;

use cmd_client::Marker;
use cmd_run::CmdRun;

fn main() {
    // because this function exits right away it does not
    // properly handle destruction of data, so we put the actual
    // logic into a separate function/scope
    std::process::exit(main2())
}

fn main2() -> i32 {
    let args: Vec<String> = std::env::args_os()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    if let Some(marker) = Marker::parse(&args) {
        cli::configure_logging(cli::Logging::default().verbosity());
        let rt = cli::runtime!();
        let result = match marker {
            Ok(marker) => rt.block_on(marker.run()),
            Err(err) => Err(err),
        };
        return cli::handle_result!(result);
    }

    let opt = CmdRun::parse();
    cli::configure_logging(opt.logging.verbosity());
    let config = match packfs::get_config() {
        Err(err) => {
            tracing::error!(err = ?err, "failed to load config");
            return 1;
        }
        Ok(config) => config,
    };

    let rt = cli::runtime!();
    let result = rt.block_on(opt.run(&config));
    // stray tasks, such as a lazily detached filesystem server,
    // must not keep the process alive once the run is complete
    rt.shutdown_timeout(std::time::Duration::from_millis(250));
    cli::handle_result!(result)
}
