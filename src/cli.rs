use std::path::PathBuf;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use url::Url;

use crate::config::ConsoleConfig;
use crate::error::Result;
use crate::navigation::NavigationContext;
use crate::profile::ConnectionProfile;

#[derive(Parser, Debug)]
#[command(name = "jolokia-session")]
#[command(version)]
#[command(about = "Discover, authenticate to and query a Jolokia agent")]
pub struct Args {
    /// TOML configuration file (defaults apply when it does not exist)
    #[arg(long, default_value = "jolokia-session.toml")]
    pub config: PathBuf,

    /// Override the console page URL that relative agent paths resolve against
    #[arg(long)]
    pub page_url: Option<String>,

    /// SQLite file for profiles and settings (overrides the config file)
    #[arg(long)]
    pub storage: Option<PathBuf>,

    /// Connect through this stored profile instead of discovering the agent
    #[arg(long, short = 'c')]
    pub connection: Option<String>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(long, short, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Resolve the agent, build a session, probe it and print the result as JSON
    Connect,

    /// Manage stored connection profiles
    Profiles {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Read one attribute
    Read {
        /// MBean name, e.g. java.lang:type=Memory
        mbean: String,
        /// Attribute name, e.g. HeapMemoryUsage
        attribute: String,
    },

    /// Poll one attribute and print each changed value
    Poll {
        mbean: String,
        attribute: String,
        /// Polling interval in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
        /// Stop after this many changed values
        #[arg(long, default_value = "10")]
        count: usize,
        /// Give up when no changed value arrives within this many milliseconds
        #[arg(long, default_value = "60000")]
        wait_ms: u64,
    },
}

#[derive(Subcommand, Debug)]
pub enum ProfileAction {
    /// List stored profiles, most recently used first
    List,
    /// Show one profile (secrets redacted)
    Show { name: String },
    /// Store a profile for an agent URL
    Add(AddProfile),
    /// Remove a stored profile
    Remove { name: String },
}

#[derive(ClapArgs, Debug)]
pub struct AddProfile {
    pub name: String,
    /// Full agent URL, e.g. http://app01:8778/jolokia
    #[arg(long)]
    pub url: String,
    /// Bearer token (takes precedence over --user/--password)
    #[arg(long)]
    pub token: Option<String>,
    #[arg(long, requires = "password")]
    pub user: Option<String>,
    #[arg(long, requires = "user")]
    pub password: Option<String>,
    /// Route requests through the console proxy
    #[arg(long)]
    pub proxy: bool,
}

/// Load the configuration file and apply command-line overrides.
pub fn load_config(args: &Args) -> Result<ConsoleConfig> {
    let mut config = ConsoleConfig::load(&args.config)?;
    if let Some(page_url) = &args.page_url {
        config = config.with_page_url(page_url.clone());
    }
    if let Some(storage) = &args.storage {
        config = config.with_storage_path(storage.clone());
    }
    config.validate()?;
    Ok(config)
}

/// The navigation context the CLI connects from.
pub fn navigation(config: &ConsoleConfig, connection: Option<&str>) -> Result<NavigationContext> {
    let nav = config.navigation()?;
    Ok(match connection {
        Some(name) => nav.with_query("con", name),
        None => nav,
    })
}

/// Turn `profiles add` arguments into a profile.
pub fn profile_from_args(add: &AddProfile) -> Result<ConnectionProfile> {
    let url = Url::parse(&add.url)?;
    let mut profile = ConnectionProfile::from_url(add.name.clone(), &url);
    profile.jolokia_url = Some(add.url.clone());
    profile.use_proxy = add.proxy;
    if let Some(token) = &add.token {
        profile = profile.with_token(token.clone());
    } else if let (Some(user), Some(password)) = (&add.user, &add.password) {
        profile = profile.with_basic_auth(user.clone(), password.clone());
    }
    Ok(profile)
}

/// Next changed value from a poll subscription.
///
/// `None` when nothing arrives within `wait` or the subscription is gone.
pub async fn next_change(rx: &mut UnboundedReceiver<Value>, wait: Duration) -> Option<Value> {
    tokio::time::timeout(wait, rx.recv()).await.ok().flatten()
}

/// Render a value for terminal output: bare strings unquoted, everything else as JSON.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}
