//! kksend - offline planning for KeepKey UTXO sends
//!
//! Builds the exact unsigned transaction a send would hand to the device,
//! from an xpub and a JSON dump of its UTXOs, without touching the device or
//! the network.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, Table};
use std::path::PathBuf;
use std::sync::Arc;

use keepkey_send::chains::bitcoin::derive_change_address;
use keepkey_send::logging::init_logging;
use keepkey_send::send_flow::describe_change;
use keepkey_send::sources::{StaticFeeOracle, XpubChangeDeriver};
use keepkey_send::{
    ExtendedKey, FeeChoice, FeeRates, KeyRegistry, SendAmount, SendConfig, SendPlan, SendPlanner, SendRequest, Utxo,
    UtxoSource,
};

const BTC_CAIP: &str = "bip122:000000000019d6689c085ae165831e93/slip44:0";

#[derive(Parser)]
#[command(name = "kksend", version, about = "Plan KeepKey Bitcoin sends offline")]
struct Cli {
    /// Config file (defaults to ~/.keepkey/send.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show what an extended public key is and where its change goes
    InspectKey {
        xpub: String,
        /// Change index to derive
        #[arg(long, default_value_t = 0)]
        change_index: u32,
    },
    /// Select coins and assemble the unsigned transaction
    Plan(PlanArgs),
}

#[derive(Args)]
struct PlanArgs {
    /// Account xpub/ypub/zpub; repeat for several script types
    #[arg(long = "xpub", required = true)]
    xpubs: Vec<String>,
    /// JSON array of UTXOs
    #[arg(long)]
    utxos: PathBuf,
    /// Destination address
    #[arg(long)]
    to: String,
    /// Amount in sats
    #[arg(long, conflicts_with = "max", required_unless_present = "max")]
    amount: Option<u64>,
    /// Send everything
    #[arg(long)]
    max: bool,
    /// sat/vB
    #[arg(long, default_value_t = 10)]
    fee_rate: u64,
    #[arg(long, default_value = BTC_CAIP)]
    caip: String,
    /// Next unused change index
    #[arg(long, default_value_t = 0)]
    change_index: u32,
}

/// UTXOs read from a file, handed out per owning key
struct FileUtxoSource {
    utxos: Vec<Utxo>,
}

#[async_trait]
impl UtxoSource for FileUtxoSource {
    async fn list_unspent(&self, key: &ExtendedKey) -> keepkey_send::Result<Vec<Utxo>> {
        Ok(self.utxos.iter().filter(|u| u.xpub == key.xpub()).cloned().collect())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SendConfig::load_from(path)?,
        None => SendConfig::load()?,
    };

    match cli.command {
        Command::InspectKey { xpub, change_index } => inspect_key(&xpub, change_index),
        Command::Plan(args) => plan(args, config).await,
    }
}

fn inspect_key(xpub: &str, change_index: u32) -> Result<()> {
    let key = ExtendedKey::parse(BTC_CAIP, xpub, None)?;
    let change = derive_change_address(&key, change_index)?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Field", "Value"]);
    table.add_row(vec!["Script type".to_string(), key.script_type().to_string()]);
    table.add_row(vec!["Network".to_string(), key.network().to_string()]);
    table.add_row(vec!["Account path".to_string(), key.path().to_string()]);
    table.add_row(vec![format!("Change #{}", change_index), describe_change(&change)]);
    println!("{table}");
    Ok(())
}

async fn plan(args: PlanArgs, config: SendConfig) -> Result<()> {
    let mut registry = KeyRegistry::new();
    for xpub in &args.xpubs {
        let key = ExtendedKey::parse(&args.caip, xpub, None).with_context(|| format!("bad key {}", xpub))?;
        registry.register(key);
    }

    let text = std::fs::read_to_string(&args.utxos)
        .with_context(|| format!("failed to read {}", args.utxos.display()))?;
    let utxos: Vec<Utxo> = serde_json::from_str(&text).context("UTXO file is not a JSON array of UTXOs")?;

    let mut change = XpubChangeDeriver::new();
    for xpub in &args.xpubs {
        change = change.with_index(xpub, args.change_index);
    }

    let rates = FeeRates {
        slow: args.fee_rate,
        medium: args.fee_rate,
        fast: args.fee_rate,
    };
    let planner = SendPlanner::new(
        registry,
        Arc::new(FileUtxoSource { utxos }),
        Arc::new(StaticFeeOracle(rates)),
        Arc::new(change),
        config,
    );

    let amount = match (args.amount, args.max) {
        (_, true) => SendAmount::Drain,
        (Some(amount), false) => SendAmount::Exact(amount),
        (None, false) => return Err(anyhow!("either --amount or --max is required")),
    };
    let request = SendRequest {
        caip: args.caip,
        destination: args.to,
        amount,
        fee: Some(FeeChoice::Rate(args.fee_rate)),
    };

    let plan = planner.build(&request).await?;
    print_plan(&plan);
    println!("{}", serde_json::to_string_pretty(&plan.unsigned)?);
    Ok(())
}

fn print_plan(plan: &SendPlan) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["", "Outpoint / Address", "Type", "Sats"]);

    for utxo in &plan.selection.inputs {
        table.add_row(vec![
            Cell::new("in"),
            Cell::new(utxo.outpoint()),
            Cell::new(utxo.script_type),
            Cell::new(utxo.value),
        ]);
    }
    for output in &plan.selection.outputs {
        let label = if output.is_change { "change" } else { "out" };
        table.add_row(vec![
            Cell::new(label),
            Cell::new(&output.address),
            Cell::new(""),
            Cell::new(output.amount),
        ]);
    }
    table.add_row(vec![
        Cell::new("fee"),
        Cell::new(format!("{} sat/vB", plan.fee_rate)),
        Cell::new(""),
        Cell::new(plan.selection.fee),
    ]);
    println!("{table}");

    if plan.selection.folded_dust > 0 {
        println!("{} sats of dust change added to the fee", plan.selection.folded_dust);
    }
}
