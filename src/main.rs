//! session-sync CLI
//!
//! Drives one "tab" of the session core against a real Supabase project.
//! Storage is a JSON file in the data directory, so a session created by
//! `sign-in` is picked up by later invocations and by a concurrent `watch`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use directories::ProjectDirs;

use session_sync::auth::RemoteSignOut;
use session_sync::billing::HttpEntitlementApi;
use session_sync::integrations::SupabaseAuth;
use session_sync::storage::SharedStorage;
use session_sync::{SessionConfig, SessionManager, SessionSnapshot};

#[derive(Parser, Debug)]
#[command(name = "session-sync", version, about = "Authenticated session sync harness")]
struct Cli {
    /// Config file (default: <config dir>/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Shared storage file (default: <data dir>/storage.json)
    #[arg(long, global = true)]
    storage: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the current session and subscription state
    Status,
    /// Sign in with email and password
    SignIn {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Register with email and password
    SignUp {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Print the Google OAuth URL
    OauthUrl,
    /// Sign out locally and at the provider
    SignOut,
    /// Check the signed-in user's subscription status
    Subscription {
        /// Skip the local cache
        #[arg(long)]
        no_cache: bool,
    },
    /// Print every state change until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "session_sync=debug"
    } else {
        "session_sync=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let manager = build_manager(&cli)?;
    manager.start();
    wait_until_loaded(&manager).await;

    let result = run(&cli.command, &manager).await;
    manager.shutdown();
    result
}

fn project_dirs() -> anyhow::Result<ProjectDirs> {
    ProjectDirs::from("dev", "session-sync", "session-sync")
        .context("could not determine a home directory")
}

fn build_manager(cli: &Cli) -> anyhow::Result<Arc<SessionManager>> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => project_dirs()?.config_dir().join("config.toml"),
    };
    let config = SessionConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if config.api_base_url.trim().is_empty() {
        tracing::warn!("api_base_url is not set; subscription checks will fail");
    }

    let storage_path = match &cli.storage {
        Some(path) => path.clone(),
        None => project_dirs()?.data_dir().join("storage.json"),
    };
    let shared = SharedStorage::open(&storage_path)
        .with_context(|| format!("opening {}", storage_path.display()))?;
    let tab = shared.tab();

    let provider = Arc::new(SupabaseAuth::new(&config, tab.clone())?);
    let entitlements = Arc::new(HttpEntitlementApi::new(
        &config.api_base_url,
        config.http_timeout(),
    )?);
    Ok(SessionManager::new(config, provider, entitlements, tab))
}

async fn wait_until_loaded(manager: &SessionManager) {
    let mut rx = manager.subscribe();
    // Only fails if the store is gone, which cannot happen while we hold it.
    let _ = rx.wait_for(|snapshot| !snapshot.loading).await;
}

async fn run(command: &Command, manager: &Arc<SessionManager>) -> anyhow::Result<()> {
    match command {
        Command::Status => {
            if manager.user().is_some() {
                // Let the cached or fetched status land before printing.
                let mut rx = manager.subscribe();
                let _ = tokio::time::timeout(
                    std::time::Duration::from_secs(5),
                    rx.wait_for(|s| !s.subscription_loading),
                )
                .await;
            }
            print_snapshot(&manager.snapshot());
        }
        Command::SignIn { email, password } => {
            let session = manager.sign_in_with_email(email, password).await?;
            let who = session.user.email.as_deref().unwrap_or(&session.user.id);
            println!("Signed in as {who}");
        }
        Command::SignUp {
            email,
            password,
            name,
        } => {
            let outcome = manager
                .sign_up_with_email(email, password, name.as_deref())
                .await?;
            if outcome.needs_confirmation() {
                println!("Check {email} to confirm the account");
            } else {
                println!("Signed up and signed in as {}", outcome.user.id);
            }
        }
        Command::OauthUrl => {
            println!("{}", manager.sign_in_with_google().await?);
        }
        Command::SignOut => {
            let outcome = manager.sign_out().await;
            match outcome.remote {
                RemoteSignOut::Confirmed => println!("Signed out"),
                RemoteSignOut::Failed(reason) => {
                    println!("Signed out locally; provider sign-out failed: {reason}");
                }
                RemoteSignOut::TimedOut => {
                    println!("Signed out locally; provider sign-out still pending");
                }
            }
            println!("Redirect: {}", outcome.redirect_to);
        }
        Command::Subscription { no_cache } => {
            let user = manager.user().context("not signed in")?;
            let status = manager
                .check_subscription_status(&user.id, !no_cache)
                .await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Watch => watch(manager).await,
    }
    Ok(())
}

async fn watch(manager: &SessionManager) {
    let mut rx = manager.subscribe();
    print_snapshot(&rx.borrow_and_update());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = rx.borrow_and_update().clone();
                print_snapshot(&snapshot);
            }
        }
    }
    manager.page_unload();
}

fn print_snapshot(snapshot: &SessionSnapshot) {
    let summary = serde_json::json!({
        "user_id": snapshot.user_id(),
        "email": snapshot.user.as_ref().and_then(|u| u.email.clone()),
        "loading": snapshot.loading,
        "expires_at": snapshot.session.as_ref().and_then(|s| s.expires_at),
        "subscription": snapshot.subscription_status,
        "subscription_loading": snapshot.subscription_loading,
        "verifying_sign_out": snapshot.is_verifying_sign_out,
    });
    println!("{summary}");
}
