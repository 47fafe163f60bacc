// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use miette::{Context, IntoDiagnostic, Result, miette};
use nix::sys::signal::Signal;
use packfs::Config;
use packfs::bootstrap::{BootstrapEnv, MAIN_SCRIPT, build_bootstrap_spec, launch_hook};
use packfs::content::{ContentSource, Subtree, open_bundle};
use packfs::mount::{Mount, UnmountCommands, UnmountSignal};
use packfs::spawn::SpawnService;
use packfs::supervisor::{Exit, Snapshot, Supervisor};
use packfs_cli_common as cli;
use relative_path::RelativePath;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

#[cfg(test)]
#[path = "./cmd_run_test.rs"]
mod cmd_run_test;

/// Mount a bundle and run its main.sh against it.
///
/// The service/ and static/ directories of the bundle are each
/// mounted read-only under a new temporary directory, which is
/// also where main.sh is started. Everything is unmounted again
/// once main.sh and every process started through it have exited.
#[derive(Debug, Parser)]
#[clap(name = "packfs", version = packfs::VERSION)]
pub struct CmdRun {
    #[clap(flatten)]
    pub logging: cli::Logging,

    /// The tar archive or directory to serve, defaults
    /// to the bundle.path config value
    #[clap(long, env = "PACKFS_BUNDLE")]
    pub bundle: Option<PathBuf>,

    /// Arguments given to main.sh
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl CmdRun {
    pub async fn run(&self, config: &Config) -> Result<i32> {
        let bundle_path = self
            .bundle
            .clone()
            .or_else(|| config.bundle.path.clone())
            .ok_or_else(|| {
                miette!(
                    help = "Use --bundle or set bundle.path in the packfs config",
                    "No bundle to serve"
                )
            })?;
        let bundle = open_bundle(&bundle_path)?;
        let main = bundle
            .read(RelativePath::new(MAIN_SCRIPT))
            .wrap_err_with(|| format!("Bundle {bundle_path:?} cannot be started"))?;

        let temp_root = config.temp_root();
        let root = tempfile::Builder::new()
            .prefix("packfs-")
            .tempdir_in(&temp_root)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to create mount root in {temp_root:?}"))?;

        let mounts = Mounts::new(
            root.path(),
            config.mount.dir_mode,
            UnmountCommands::from(config.unmount.clone()),
        );

        let result = self
            .run_mounted(config, &bundle, &main, &mounts, root.path())
            .await;

        mounts.unmount().await;
        if let Err(err) = root.close() {
            tracing::warn!(%err, "failed to remove mount root");
        }
        result
    }

    async fn run_mounted(
        &self,
        config: &Config,
        bundle: &Arc<dyn ContentSource>,
        main: &[u8],
        mounts: &Mounts,
        root: &Path,
    ) -> Result<i32> {
        attach(&mounts.service, bundle, config.mount.root_mode).await?;
        attach(&mounts.static_, bundle, config.mount.root_mode).await?;
        tracing::info!("Bundle mounted into {root:?}");

        // every listener is stopped when this set is dropped
        let mut listeners = JoinSet::new();
        let umnt_service = UnmountSignal::bind().await?;
        let umnt_static = UnmountSignal::bind().await?;
        let env = BootstrapEnv {
            cwd: std::env::current_dir()
                .into_diagnostic()
                .wrap_err("Failed to read the current directory")?,
            mount_root: root.to_owned(),
            service_dir: mounts.service.path().to_owned(),
            static_dir: mounts.static_.path().to_owned(),
            umnt_service_port: umnt_service.port(),
            umnt_static_port: umnt_static.port(),
        };
        listeners.spawn(umnt_service.serve(Arc::clone(&mounts.service)));
        listeners.spawn(umnt_static.serve(Arc::clone(&mounts.static_)));

        let exe = std::env::current_exe()
            .into_diagnostic()
            .wrap_err("Failed to locate the packfs executable")?;
        let spawn_service = SpawnService::bind().await?;
        tracing::debug!(port = spawn_service.port(), "spawn service listening");
        let supervisor = Arc::new(
            Supervisor::new(launch_hook(spawn_service.port(), &exe))
                .with_shell(config.process.shell.as_str()),
        );
        listeners.spawn(spawn_service.serve(Arc::clone(&supervisor)));

        // registered before anything is started so that no signal
        // can terminate us ahead of the processes we supervise
        let mut signals = termination_signals(&mut listeners)?;

        let spec = build_bootstrap_spec(&env, main, &self.args);
        let bootstrap = supervisor
            .start(spec)
            .await
            .wrap_err("Failed to start the bootstrap script")?;
        tracing::info!("Press CTRL+C or send SIGINT or SIGTERM to stop");

        supervise(&supervisor, &mut signals).await;
        let exit = bootstrap.wait().await;
        let snapshot = supervisor.snapshot();
        tracing::debug!(?snapshot, %exit, "all processes have exited");
        listeners.shutdown().await;
        Ok(exit_code(snapshot, &exit))
    }
}

struct Mounts {
    service: Arc<Mount>,
    static_: Arc<Mount>,
}

impl Mounts {
    fn new(root: &Path, dir_mode: u32, commands: UnmountCommands) -> Self {
        Self {
            service: Arc::new(Mount::new(
                "service",
                root.join("service"),
                dir_mode,
                commands.clone(),
            )),
            static_: Arc::new(Mount::new("static", root.join("static"), dir_mode, commands)),
        }
    }

    /// Detach the service mount and then the static one.
    ///
    /// Mounts that were never established are left alone.
    async fn unmount(&self) {
        self.service.unmount().await;
        self.static_.unmount().await;
    }
}

/// Listen for SIGINT and SIGTERM, delivering each to the returned
/// channel until the task set is dropped
fn termination_signals(tasks: &mut JoinSet<()>) -> Result<mpsc::UnboundedReceiver<Signal>> {
    let (send, recv) = mpsc::unbounded_channel();
    for (kind, sig) in [
        (SignalKind::interrupt(), Signal::SIGINT),
        (SignalKind::terminate(), Signal::SIGTERM),
    ] {
        let mut stream = signal(kind)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to listen for {}", sig.as_str()))?;
        let send = send.clone();
        tasks.spawn(async move {
            while stream.recv().await.is_some() {
                if send.send(sig).is_err() {
                    break;
                }
            }
        });
    }
    Ok(recv)
}

/// Relay signals to every supervised process until all of them have exited
async fn supervise(supervisor: &Supervisor, signals: &mut mpsc::UnboundedReceiver<Signal>) {
    let drained = supervisor.wait_all();
    tokio::pin!(drained);
    loop {
        tokio::select! {
            _ = &mut drained => break,
            Some(signal) = signals.recv() => forward(supervisor, signal),
        }
    }
}

/// Serve the directory of the bundle that shares a name with the mount
async fn attach(mount: &Mount, bundle: &Arc<dyn ContentSource>, root_mode: u32) -> Result<()> {
    let source: Arc<dyn ContentSource> = Arc::new(Subtree::new(Arc::clone(bundle), mount.name()));
    let opts = packfs_vfs::Config::for_mount(&mount.fs_name(), root_mode);
    let fs = packfs_vfs::Filesystem::build(source, opts)?;
    tracing::debug!(name = %mount.name(), inodes = fs.len(), "mounting");
    mount
        .mount_with(|path| packfs_vfs::mount(fs, path).map_err(|err| core_error(mount.name(), err)))
        .await?;
    Ok(())
}

fn core_error(name: &str, err: packfs_vfs::Error) -> packfs::Error {
    match err {
        packfs_vfs::Error::Content(err) => err,
        packfs_vfs::Error::Mount(_, err) => packfs::Error::MountError(name.to_string(), err),
        packfs_vfs::Error::String(msg) => packfs::Error::String(msg),
    }
}

fn forward(supervisor: &Supervisor, signal: Signal) {
    tracing::info!(?signal, "received signal");
    supervisor.broadcast(signal);
}

/// The exit code for the whole run.
///
/// A lone bootstrap passes its own code through, otherwise
/// only whether every process succeeded is reported.
pub fn exit_code(snapshot: Snapshot, bootstrap: &Exit) -> i32 {
    match snapshot.started {
        1 => bootstrap.code(),
        _ if snapshot.failed == 0 => 0,
        _ => 1,
    }
}
