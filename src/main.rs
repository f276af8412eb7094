pub mod action_config;
pub mod api;
pub mod cache;
pub mod cancel;
pub mod error;
pub mod git;
pub mod progress;
pub mod pull;
pub mod push;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_support;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::api::GitHubClient;
use crate::cache::{CacheDirectory, CachePaths};
use crate::cancel::CancellationToken;
use crate::error::{ErrorKind, SyncError};
use crate::git::GitRemote;
use crate::push::PushSettings;
use crate::transport::TransportConfig;
use crate::types::{RepoKey, Visibility};

/// Tool version, also written to the cache's version marker.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(
    name = "action-sync",
    version = VERSION,
    about = "Sync the CodeQL Action from GitHub.com to GitHub Enterprise Server"
)]
struct Cli {
    /// Local directory to cache the Action in
    #[arg(long, global = true, default_value_os_t = CachePaths::default().root().to_path_buf())]
    cache_dir: PathBuf,

    /// Accept invalid TLS certificates and host names
    #[arg(long, global = true)]
    insecure: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct PullArgs {
    /// Token for GitHub.com, to avoid anonymous rate limits
    #[arg(long, env = "ACTION_SYNC_SOURCE_TOKEN", hide_env_values = true)]
    source_token: Option<String>,
}

#[derive(Args)]
struct PushArgs {
    /// URL of the GitHub Enterprise Server instance to push to
    #[arg(long)]
    destination_url: String,

    /// Token for the API of the GitHub Enterprise Server instance
    #[arg(long, env = "ACTION_SYNC_DESTINATION_TOKEN", hide_env_values = true)]
    destination_token: String,

    /// Repository to create on GitHub Enterprise Server
    #[arg(long, default_value = "github/codeql-action")]
    destination_repository: RepoKey,

    /// User to impersonate when the token's owner is not a member of the destination organization
    #[arg(long)]
    actions_admin_user: Option<String>,

    /// Visibility of the destination repository
    #[arg(long, value_enum, default_value_t = Visibility::Public)]
    destination_visibility: Visibility,

    /// Push even if the destination repository was not created by this tool
    #[arg(long)]
    force: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Pull the CodeQL Action from GitHub.com to the local cache
    Pull(PullArgs),

    /// Push the CodeQL Action from the local cache to GitHub Enterprise Server
    Push(PushArgs),

    /// Pull, then push
    Sync {
        #[command(flatten)]
        pull: PullArgs,
        #[command(flatten)]
        push: PushArgs,
    },

    /// Print the version
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let cache = CacheDirectory::new(&cli.cache_dir);
    let transport = TransportConfig::default().insecure(cli.insecure);
    let cancel = cancellation();

    let result = match cli.command {
        Commands::Pull(args) => cmd_pull(&cache, &transport, &cancel, args),
        Commands::Push(args) => cmd_push(&cache, &transport, &cancel, args),
        Commands::Sync { pull, push } => cmd_pull(&cache, &transport, &cancel, pull)
            .and_then(|()| cmd_push(&cache, &transport, &cancel, push)),
        Commands::Version => {
            println!("action-sync {}", VERSION);
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        if e.kind() == ErrorKind::Transient {
            eprintln!();
            eprintln!("Hint: This looks like a temporary failure. Re-run the command to resume.");
        }
        std::process::exit(1);
    }
}

fn cancellation() -> CancellationToken {
    CancellationToken::from_ctrlc().unwrap_or_else(|e| {
        log::warn!("Could not install interrupt handler: {}", e);
        CancellationToken::new()
    })
}

fn cmd_pull(
    cache: &CacheDirectory,
    transport: &TransportConfig,
    cancel: &CancellationToken,
    args: PullArgs,
) -> Result<(), SyncError> {
    let api = GitHubClient::github_dot_com(args.source_token.clone(), transport, cancel.clone())?;
    let remote = GitRemote::new(pull::SOURCE_GIT_URL, cancel.clone())
        .with_token(args.source_token)
        .insecure(transport.insecure);
    pull::pull(cache, remote, api, cancel.clone())?;
    Ok(())
}

fn cmd_push(
    cache: &CacheDirectory,
    transport: &TransportConfig,
    cancel: &CancellationToken,
    args: PushArgs,
) -> Result<(), SyncError> {
    let api = GitHubClient::enterprise(
        &args.destination_url,
        args.destination_token.clone(),
        transport,
        cancel.clone(),
    )?;
    let settings = PushSettings {
        destination: args.destination_repository,
        token: args.destination_token,
        visibility: args.destination_visibility,
        force: args.force,
        actions_admin_user: args.actions_admin_user,
        insecure: transport.insecure,
    };
    push::push(cache, api, settings, cancel.clone())?;
    Ok(())
}
