use std::time::Duration;

use clap::Parser;
use colored::*;
use tokio::sync::mpsc;

use jolokia_session::cli::{self, Args, Command, ProfileAction};
use jolokia_session::logging::init_logging;
use jolokia_session::{AgentRequest, ConnectError, Connection, ConnectionContext, Result};

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn connect(ctx: &ConnectionContext, connection: Option<&str>) -> Result<Connection> {
    let nav = cli::navigation(ctx.config(), connection)?;
    let conn = ctx.connect(nav).await;

    let status = if conn.is_connected() {
        let pid = conn.session.process_id().await.ok().flatten().unwrap_or_default();
        format!(
            "connected to {} {} [{}]",
            conn.session.url().map(|u| u.as_str()).unwrap_or(""),
            pid,
            conn.capability
        )
        .green()
    } else {
        "no agent found, running disconnected".yellow()
    };
    eprintln!("{status}");
    Ok(conn)
}

async fn require_agent(ctx: &ConnectionContext, connection: Option<&str>) -> Result<Connection> {
    let conn = connect(ctx, connection).await?;
    if conn.is_connected() {
        Ok(conn)
    } else {
        Err(ConnectError::NoAgent)
    }
}

fn profiles(ctx: &ConnectionContext, action: ProfileAction) -> Result<()> {
    let store = ctx.profiles();
    match action {
        ProfileAction::List => {
            let recent = store.recent();
            let all = store.load_all();
            let mut names: Vec<&String> = recent.iter().filter(|n| all.contains_key(*n)).collect();
            names.extend(all.keys().filter(|n| !recent.contains(*n)));
            for name in names {
                println!("{:<24} {}", name.bold(), all[name].server_url());
            }
        }
        ProfileAction::Show { name } => match store.load(&name) {
            Some(profile) => {
                println!("{profile:#?}");
                println!("{} {}", "url:".dimmed(), profile.server_url());
            }
            None => eprintln!("{} no profile named '{name}'", "warning:".yellow()),
        },
        ProfileAction::Add(add) => {
            let profile = cli::profile_from_args(&add)?;
            println!("saved {}", profile.name.bold());
            store.save(profile);
        }
        ProfileAction::Remove { name } => {
            if store.remove(&name) {
                println!("removed {}", name.bold());
            } else {
                eprintln!("{} no profile named '{name}'", "warning:".yellow());
            }
        }
    }
    Ok(())
}

async fn poll(
    conn: Connection,
    mbean: String,
    attribute: String,
    interval: Duration,
    count: usize,
    wait: Duration,
) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = conn.session.register(AgentRequest::read(mbean, attribute), move |response| {
        let _ = tx.send(response.value.clone());
    });
    conn.session.start(interval);

    for _ in 0..count {
        match cli::next_change(&mut rx, wait).await {
            Some(value) => println!("{}", cli::format_value(&value)),
            None => {
                eprintln!(
                    "{} no new value within {}ms, stopping",
                    "warning:".yellow(),
                    wait.as_millis()
                );
                break;
            }
        }
    }

    conn.session.stop();
    conn.session.unregister(handle);
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let config = cli::load_config(&args)?;
    let ctx = ConnectionContext::from_config(config)?;
    let connection = args.connection.as_deref();

    match args.command {
        Command::Connect => {
            let conn = connect(&ctx, connection).await?;
            println!("{}", serde_json::to_string_pretty(&conn.report())?);
        }
        Command::Profiles { action } => profiles(&ctx, action)?,
        Command::Read { mbean, attribute } => {
            let conn = require_agent(&ctx, connection).await?;
            match conn.session.get_attribute(&mbean, &attribute).await? {
                Some(value) => println!("{}", cli::format_value(&value)),
                None => println!("{}", "null".dimmed()),
            }
        }
        Command::Poll {
            mbean,
            attribute,
            interval_ms,
            count,
            wait_ms,
        } => {
            let conn = require_agent(&ctx, connection).await?;
            let interval = Duration::from_millis(interval_ms);
            poll(conn, mbean, attribute, interval, count, Duration::from_millis(wait_ms)).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = run(args).await {
        eprintln!("{} {e}", "error:".red().bold());
        std::process::exit(1);
    }
}
