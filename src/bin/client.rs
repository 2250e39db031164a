//! Voting client binary — one per participant
//!
//! Connects to the server over TLS, runs the protocol, and prints the
//! recovered tally. The vote comes from `--always-vote` when given,
//! otherwise from an interactive prompt that accepts case-insensitive
//! "yes"/"no". Exits nonzero on proof rejection or connection loss.

#![forbid(unsafe_code)]

use std::io::Write;
use std::path::Path;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ovnet::client::parse_vote;
use ovnet::{run_voter, tls, ClientConfig, Vote};

#[derive(Parser)]
#[command(about = "Open Vote Network participant")]
struct Args {
    /// Always cast this vote instead of prompting.
    #[arg(long, value_enum)]
    always_vote: Option<AlwaysVote>,
}

#[derive(Clone, Copy, ValueEnum)]
enum AlwaysVote {
    Yes,
    No,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = ClientConfig::from_env()?;
    init_logging(&config.logfile_path)?;
    println!("CLIENT IS ALIVE");
    info!("client is alive");

    let url = format!("wss://{}:{}", config.hostname, config.port);
    let connector = tls::client_connector(&config.cert_path)?;
    info!(%url, "connecting to the server");
    let (ws, _) =
        tokio_tungstenite::connect_async_tls_with_config(url.as_str(), None, false, Some(connector))
            .await
            .context("connect to the server")?;
    info!("connected; running login");

    let fixed = args.always_vote.map(|v| match v {
        AlwaysVote::Yes => Vote::Yes,
        AlwaysVote::No => Vote::No,
    });
    let outcome = run_voter(ws, Some(config.participants), move |question| {
        println!("{question}");
        match fixed {
            Some(vote) => vote,
            None => prompt_vote(),
        }
    })
    .await?;

    println!(
        "{} of {} participants voted yes",
        outcome.yes_votes, outcome.participants
    );
    Ok(())
}

fn prompt_vote() -> Vote {
    loop {
        print!("Your vote:");
        std::io::stdout().flush().ok();
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) | Err(_) => {
                eprintln!("stdin closed before a vote was entered");
                std::process::exit(2);
            }
            Ok(_) => match parse_vote(&line) {
                Some(vote) => return vote,
                None => println!("Type 'yes' or 'no'."),
            },
        }
    }
}

fn init_logging(path: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("create log file {}", path.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}
