//! repo-cp: copy objects between repositories.
//!
//! Source and destination are names of sections in the config file
//! (`$HOME/.repocpcfg` unless `--config` says otherwise). A name that is not
//! in the config but is an existing directory is used as an airlock: objects
//! are written to it as FOXML files, or read back from it.
//!
//! # Usage
//!
//! ```bash
//! repo-cp qa-fedora dev-fedora pid:1 pid:2 pid:3
//!
//! # show transfer progress, use a migrate export
//! repo-cp qa-fedora dev-fedora pid:1 --export-context migrate --progress
//!
//! # archive export with managed content pulled by URL from the source
//! repo-cp qa-fedora dev-fedora pid:1 --archive-xml --requires-auth
//!
//! # through a directory
//! repo-cp qa-fedora path/to/airlock pid:1
//! repo-cp path/to/airlock dev-fedora pid:1
//! ```

mod config;

use anyhow::{Context, Result, bail};
use clap::Parser;
use config::{Config, RepositoryConfig};
use fedsync_core::{
    AirlockRepository, DEFAULT_READ_TIMEOUT_SECS, ExportContext, HttpOptions, HttpRepository, SyncEndpoint,
    SyncEngine, SyncOptions, TransferProgress, format_size,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "repo-cp")]
#[command(author = "fedsync Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Copy objects from one repository to another")]
struct Cli {
    /// Source repository: a name in the config file, or a directory
    source: String,

    /// Destination repository: a name in the config file, or a directory
    destination: String,

    /// Pids of the objects to copy
    pids: Vec<String>,

    /// Config file with repository definitions
    #[arg(long)]
    config: Option<PathBuf>,

    /// Export context requested from the source (archive, migrate, public)
    #[arg(long, default_value = "archive")]
    export_context: ExportContext,

    /// Archive export with managed content (except XML) replaced by URLs
    /// the destination pulls from the source
    #[arg(long)]
    archive_xml: bool,

    /// Put the source credentials into the content URLs of --archive-xml
    #[arg(long, requires = "archive_xml")]
    requires_auth: bool,

    /// Seconds to wait for a server to send more data; 0 waits forever
    #[arg(long, default_value_t = DEFAULT_READ_TIMEOUT_SECS)]
    read_timeout: u64,

    /// Print transfer progress to stderr
    #[arg(long)]
    progress: bool,
}

impl Cli {
    fn http_options(&self) -> HttpOptions {
        let read_timeout = (self.read_timeout > 0).then(|| Duration::from_secs(self.read_timeout));
        HttpOptions::default().with_read_timeout(read_timeout)
    }
}

/// A resolved repository name
enum Target<'a> {
    Configured(&'a RepositoryConfig),
    Airlock(PathBuf),
}

impl<'a> Target<'a> {
    /// Config entries win over directories of the same name
    fn resolve(config: &'a Config, name: &str) -> Result<Self> {
        if let Some(repo) = config.get(name) {
            return Ok(Target::Configured(repo));
        }
        let path = Path::new(name);
        if path.is_dir() {
            return Ok(Target::Airlock(path.to_path_buf()));
        }
        Err(config.unknown(name).into())
    }

    fn allow_overwrite(&self) -> bool {
        match self {
            Target::Configured(repo) => repo.allow_overwrite,
            Target::Airlock(_) => false,
        }
    }

    fn strip_digests(&self) -> Option<&[String]> {
        match self {
            Target::Configured(repo) => repo.strip_digests.as_deref(),
            Target::Airlock(_) => None,
        }
    }

    fn endpoint(&self, name: &str, options: &HttpOptions) -> Result<SyncEndpoint> {
        match self {
            Target::Configured(repo) => {
                let client = HttpRepository::with_options(
                    &repo.fedora_root,
                    repo.fedora_user.as_deref(),
                    repo.fedora_password.as_deref(),
                    options.clone(),
                )
                .with_context(|| format!("Failed to set up a client for {}", name))?;
                Ok(SyncEndpoint::new(name, Arc::new(client)))
            }
            Target::Airlock(dir) => {
                let airlock = AirlockRepository::new(dir)
                    .with_context(|| format!("Failed to open airlock {}", dir.display()))?;
                Ok(SyncEndpoint::new(name, Arc::new(airlock)))
            }
        }
    }
}

fn sync_options(cli: &Cli, destination: &Target<'_>) -> SyncOptions {
    let mut options = SyncOptions::default()
        .with_overwrite(destination.allow_overwrite())
        .with_export_context(cli.export_context)
        .with_log_message(format!("Copied from {} by repo-cp", cli.source));
    if cli.archive_xml {
        options = options.with_archive_xml(cli.requires_auth);
    }
    if let Some(ids) = destination.strip_digests() {
        options = options.with_strip_digests(ids.iter().cloned());
    }
    options
}

fn show_progress(progress: &TransferProgress<'_>) {
    let mut err = std::io::stderr();
    let _ = match progress.estimated {
        Some(estimated) => write!(
            err,
            "\r{}: {} of ~{}    ",
            progress.pid,
            format_size(progress.transferred),
            format_size(estimated)
        ),
        None => write!(err, "\r{}: {}    ", progress.pid, format_size(progress.transferred)),
    };
    let _ = err.flush();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("repo_cp=info".parse()?))
        .init();

    let cli = Cli::parse();
    if cli.source == cli.destination {
        bail!("Source and destination are both {}", cli.source);
    }

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load(&Config::default_path()?)?,
    };
    let source = Target::resolve(&config, &cli.source)?;
    let destination = Target::resolve(&config, &cli.destination)?;
    if cli.archive_xml && matches!(source, Target::Airlock(_)) {
        bail!("--archive-xml needs a repository as the source, not a directory");
    }

    let http = cli.http_options();
    let mut engine = SyncEngine::new(
        source.endpoint(&cli.source, &http)?,
        destination.endpoint(&cli.destination, &http)?,
        sync_options(&cli, &destination),
    );
    if cli.progress {
        engine = engine.with_progress(Arc::new(show_progress));
    }

    let mut out = std::io::stdout();
    let report = engine.run(&cli.pids, &mut out).await;
    if cli.progress {
        eprintln!();
    }
    tracing::info!("{}", report.summary());
    Ok(())
}
