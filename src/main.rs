//! Command-line entry point.
//!
//! Exit codes: 0 on success, 1 on any operational or configuration
//! failure, 10 on a backend panic, and the signal number when terminated
//! by SIGHUP, SIGINT or SIGTERM.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use vixdump::backend::local::LocalBackend;
use vixdump::backend::{Backend, ConnectOptions, ACCESS_IDENTITY};
use vixdump::error::{DumpError, Result};
use vixdump::session::{self, SessionOptions};
use vixdump::workfile::WorkFile;

#[derive(Parser)]
#[command(
    name = "vixdump",
    version,
    about = "Dump and restore VM disk images as a framed backup stream over stdio"
)]
struct Cli {
    /// Create the local clone disk; disables the size check.
    #[arg(short = 'C')]
    create_disk: bool,

    /// Do not check disk geometry on restore.
    #[arg(short = 'c')]
    no_check_size: bool,

    /// Run backend cleanup after disconnect.
    #[arg(short = 'D')]
    cleanup_on_disconnect: bool,

    /// Local clone disk path; on restore this overrides the work file's
    /// target disk.
    #[arg(short = 'd', value_name = "PATH")]
    disk_name: Option<String>,

    /// Force a specific backend transport.
    #[arg(short = 'f', value_name = "TRANSPORT")]
    force_transport: Option<String>,

    /// Operate on a local image instead of a remote VM disk.
    #[arg(short = 'l')]
    local: bool,

    /// Save disk metadata on dump.
    #[arg(short = 'M')]
    save_metadata: bool,

    /// Overlap backend I/O with stream I/O (copy pipeline).
    #[arg(short = 'm')]
    multi_threaded: bool,

    /// Restore disk metadata on restore.
    #[arg(short = 'R')]
    restore_metadata: bool,

    /// Also mirror the dump payload into a raw image file.
    #[arg(short = 'r', value_name = "PATH")]
    raw_disk: Option<PathBuf>,

    /// Run backend cleanup before the session starts.
    #[arg(short = 'S')]
    cleanup_on_start: bool,

    /// Sectors to move per backend call.
    #[arg(short = 's', value_name = "N")]
    sectors_per_call: Option<i64>,

    /// Do not query allocated blocks; treat the whole disk as allocated.
    #[arg(short = 'Q')]
    no_query_allocated: bool,

    /// Chunk size (sectors) for the allocated-block query.
    #[arg(short = 'k', value_name = "N")]
    chunk_size: Option<u64>,

    /// Disk type for a locally created clone disk.
    #[arg(short = 't', value_name = "TYPE")]
    disk_type: Option<String>,

    /// Verbose diagnostics on standard error.
    #[arg(short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Save a disk as a backup stream on standard output.
    Dump { workfile: PathBuf },
    /// Replay a backup stream from standard input into a disk.
    Restore { workfile: PathBuf },
    /// Read a backup stream from standard input and validate its framing.
    Show,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    #[cfg(unix)]
    install_signal_handlers();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Terminate with the signal number as exit code on the signals the
/// orchestrator may send.
#[cfg(unix)]
fn install_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    for (kind, signo) in [
        (SignalKind::hangup(), 1),
        (SignalKind::interrupt(), 2),
        (SignalKind::terminate(), 15),
    ] {
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    std::process::exit(signo);
                });
            }
            Err(e) => tracing::warn!("failed to install signal handler: {e}"),
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let opts = session_options(&cli)?;

    match &cli.action {
        Action::Dump { workfile } => {
            let work = WorkFile::load(workfile).await?;
            if !opts.local {
                require_snapshot(&work)?;
            }
            let backend = connect(&work, &cli, &opts, true).await?;
            let stats = session::dump(backend, &work, &opts, tokio::io::stdout()).await?;
            tracing::debug!(
                changed_bytes = stats.changed_bytes,
                saved_bytes = stats.saved_bytes,
                "dump complete"
            );
            Ok(())
        }
        Action::Restore { workfile } => {
            let work = WorkFile::load(workfile).await?;
            let backend = connect(&work, &cli, &opts, false).await?;
            session::restore(backend, &work, &opts, tokio::io::stdin()).await
        }
        Action::Show => session::show(tokio::io::stdin(), &opts).await,
    }
}

async fn connect(
    work: &WorkFile,
    cli: &Cli,
    opts: &SessionOptions,
    read_only: bool,
) -> Result<LocalBackend> {
    if !opts.local {
        if let Some(conn) = &work.conn {
            // Advisory: announce the session before connecting.
            if let Err(e) = LocalBackend::prepare_for_access(conn, ACCESS_IDENTITY).await {
                tracing::warn!(error = %e, "failed to prepare backend access");
            }
        }
    }

    let conn_opts = ConnectOptions {
        read_only,
        snapshot_ref: read_only
            .then(|| work.conn.as_ref().and_then(|c| c.snapshot_moref.clone()))
            .flatten(),
        force_transport: cli.force_transport.clone(),
        local: opts.local,
    };

    LocalBackend::connect(work.conn.as_ref(), &conn_opts).await
}

/// Dumps read from a snapshot; a remote work file without one is
/// unusable.
fn require_snapshot(work: &WorkFile) -> Result<()> {
    let has_snapshot = work
        .conn
        .as_ref()
        .and_then(|c| c.snapshot_moref.as_deref())
        .is_some();
    if has_snapshot {
        Ok(())
    } else {
        Err(DumpError::Config(
            "work file has no VsphereSnapshotMoRef in ConnParams".to_string(),
        ))
    }
}

fn session_options(cli: &Cli) -> Result<SessionOptions> {
    let mut opts = SessionOptions::default();

    if let Some(s) = cli.sectors_per_call {
        if s <= 0 {
            return Err(DumpError::Config(format!(
                "sectors_per_call has to be a number > 0 (got {s})"
            )));
        }
        opts.sectors_per_call = s as u64;
    }
    if let Some(k) = cli.chunk_size {
        opts.chunk_sectors = k;
    }
    if let Some(t) = &cli.disk_type {
        opts.disk_type = t.parse()?;
    }

    opts.query_allocated = !cli.no_query_allocated;
    opts.save_metadata = cli.save_metadata;
    opts.restore_metadata = cli.restore_metadata;
    opts.pipelined = cli.multi_threaded;
    // Creating the disk implies the size check cannot match.
    opts.check_size = !(cli.no_check_size || cli.create_disk);
    opts.create_disk = cli.create_disk;
    opts.local = cli.local;
    opts.clone_disk_path = cli.disk_name.clone();
    opts.raw_image_path = cli.raw_disk.clone();
    opts.cleanup_before = cli.cleanup_on_start;
    opts.cleanup_after = cli.cleanup_on_disconnect;

    Ok(opts)
}
