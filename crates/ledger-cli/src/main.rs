use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ledger_core::{chain::validate_chain, constants::DEFAULT_DIFFICULTY, Block, FieldValue};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "ledger-cli")]
#[command(about = "CLI client for the proof-of-work ledger node")]
struct Cli {
    /// Node API base URL
    #[arg(long, global = true, default_value = "http://127.0.0.1:5000/api")]
    node: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a transaction
    Submit {
        /// Transaction field as key=value (repeatable)
        #[arg(long = "field", short = 'f', value_parser = parse_field, required = true)]
        fields: Vec<(String, FieldValue)>,
    },
    /// Mine pending transactions into a block
    Mine {
        /// Start a background job and poll it instead of waiting on one request
        #[arg(long)]
        background: bool,
    },
    /// Print the full chain
    Chain,
    /// Print pending transactions
    Pending,
    /// Download the chain and re-verify every block locally
    Verify {
        #[arg(long, default_value_t = DEFAULT_DIFFICULTY)]
        difficulty: usize,
    },
    /// Tally a transaction field across all mined blocks
    Results {
        #[arg(long, default_value = "party")]
        field: String,
    },
}

#[derive(Deserialize)]
struct ChainView {
    length: usize,
    chain: Vec<Block>,
}

/// `key=value`; values that parse as bool, integer or float keep that type.
fn parse_field(raw: &str) -> std::result::Result<(String, FieldValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    if key.is_empty() {
        return Err(format!("empty key in `{raw}`"));
    }
    let value = if let Ok(b) = value.parse::<bool>() {
        FieldValue::Bool(b)
    } else if let Ok(i) = value.parse::<i64>() {
        FieldValue::Int(i)
    } else if let Some(x) = value.parse::<f64>().ok().filter(|x| x.is_finite()) {
        FieldValue::Float(x)
    } else {
        FieldValue::Str(value.to_owned())
    };
    Ok((key.to_owned(), value))
}

fn tally(chain: &[Block], field: &str) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for tx in chain.iter().flat_map(|b| &b.transactions) {
        if let Some(value) = tx.get(field).filter(|v| !v.is_empty()) {
            *counts.entry(value.to_string()).or_insert(0) += 1;
        }
    }
    counts
}

async fn print_response(res: reqwest::Response) -> Result<()> {
    let status = res.status();
    let body = res.text().await?;
    println!("status: {}", status);
    println!("{body}");
    Ok(())
}

async fn fetch_chain(client: &reqwest::Client, node: &str) -> Result<ChainView> {
    let view: ChainView = client
        .get(format!("{node}/chain"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await
        .context("decoding chain")?;
    debug!(length = view.length, "chain fetched");
    Ok(view)
}

async fn mine_in_background(client: &reqwest::Client, node: &str) -> Result<()> {
    let started: Value = client
        .post(format!("{node}/mine/jobs"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let job = started["job"].as_u64().context("node did not return a job id")?;
    println!("mining job {job} started");
    loop {
        let status: Value = client
            .get(format!("{node}/mine/jobs/{job}"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if status["status"] != "running" {
            println!("{status}");
            return Ok(());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .pretty()
        .init();

    let cli = Cli::parse();
    let node = cli.node.trim_end_matches('/');
    let client = reqwest::Client::new();
    match cli.cmd {
        Command::Submit { fields } => {
            let body: BTreeMap<String, FieldValue> = fields.into_iter().collect();
            let res = client
                .post(format!("{node}/new_transaction"))
                .json(&body)
                .send()
                .await?;
            print_response(res).await?;
        }
        Command::Mine { background: false } => {
            let res = client.get(format!("{node}/mine")).send().await?;
            print_response(res).await?;
        }
        Command::Mine { background: true } => mine_in_background(&client, node).await?,
        Command::Chain => {
            let res = client.get(format!("{node}/chain")).send().await?;
            print_response(res).await?;
        }
        Command::Pending => {
            let res = client.get(format!("{node}/pending_tx")).send().await?;
            print_response(res).await?;
        }
        Command::Verify { difficulty } => {
            let view = fetch_chain(&client, node).await?;
            if view.length != view.chain.len() {
                bail!("node reported length {} but sent {} blocks", view.length, view.chain.len());
            }
            match validate_chain(&view.chain, difficulty) {
                Ok(()) => println!("chain of {} blocks verified", view.length),
                Err(violation) => bail!("chain invalid: {violation}"),
            }
        }
        Command::Results { field } => {
            let view = fetch_chain(&client, node).await?;
            let counts = tally(&view.chain, &field);
            let total: usize = counts.values().sum();
            for (value, count) in &counts {
                println!("{value}: {count}");
            }
            println!("total: {total}");
        }
    }
    Ok(())
}
