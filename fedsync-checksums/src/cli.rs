//! Arguments and setup shared by the checksum tools

use anyhow::{Context, Result};
use clap::Args;
use fedsync_core::{DEFAULT_READ_TIMEOUT_SECS, HttpOptions, HttpRepository, StopToken};
use std::time::Duration;

/// How to reach the repository
#[derive(Args, Debug)]
pub struct ConnectionArgs {
    /// Root URL of the repository
    #[arg(long)]
    pub fedora_root: String,

    #[arg(long)]
    pub fedora_user: Option<String>,

    #[arg(long, env = "FEDORA_PASSWORD", hide_env_values = true)]
    pub fedora_password: Option<String>,

    /// Seconds to wait for the server to send more data; 0 waits forever
    #[arg(long, default_value_t = DEFAULT_READ_TIMEOUT_SECS)]
    pub read_timeout: u64,
}

impl ConnectionArgs {
    pub fn http_options(&self) -> HttpOptions {
        let read_timeout = (self.read_timeout > 0).then(|| Duration::from_secs(self.read_timeout));
        HttpOptions::default().with_read_timeout(read_timeout)
    }

    pub fn client(&self) -> Result<HttpRepository> {
        HttpRepository::with_options(
            &self.fedora_root,
            self.fedora_user.as_deref(),
            self.fedora_password.as_deref(),
            self.http_options(),
        )
        .with_context(|| format!("Failed to set up a client for {}", self.fedora_root))
    }
}

pub fn init_logging(directive: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();
    Ok(())
}

/// Translate Ctrl-C presses into stop requests
pub fn watch_interrupts(stop: StopToken) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            match stop.signal() {
                1 => eprintln!("Stopping after the current object (Ctrl-C again to stop now)"),
                _ => {
                    eprintln!("Stopping now");
                    return;
                }
            }
        }
    });
}
