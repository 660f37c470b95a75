//! # AVS Operator
//!
//! Command-line entry point: run the operator service, submit tasks as the AI
//! identity, or check a signature offline.

mod config;
mod telemetry;

use anyhow::{Context, Result};
use avs_core::{content_hash, verify, EthLedger, Journal, Ledger, Operator, TaskSubmitter, Verdict};
use clap::{Args, Parser, Subcommand};
use config::{AiArgs, LedgerArgs, OperatorArgs};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "avs-operator", version, about = "AI AVS task submitter and operator service")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "AVS_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch for tasks, verify them and submit responses until interrupted
    Run {
        #[command(flatten)]
        ledger: LedgerArgs,
        #[command(flatten)]
        operator: OperatorArgs,
    },

    /// Hash and sign content with the AI key and submit it as a task
    CreateTask {
        /// Content to attest
        #[arg(long)]
        content: String,
        #[command(flatten)]
        ledger: LedgerArgs,
        #[command(flatten)]
        ai: AiArgs,
    },

    /// Check a task signature against an address without touching the chain
    Verify(VerifyArgs),
}

#[derive(Args, Debug)]
struct VerifyArgs {
    /// Content whose hash was signed
    #[arg(long, conflicts_with = "hash", required_unless_present = "hash")]
    content: Option<String>,

    /// Signed 32-byte hash (hex)
    #[arg(long)]
    hash: Option<String>,

    /// 65-byte signature (hex)
    #[arg(long)]
    signature: String,

    /// Expected signer address
    #[arg(long)]
    address: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = telemetry::init_tracing(cli.log_json) {
        eprintln!("Failed to initialise logging: {:#}", e);
        return ExitCode::FAILURE;
    }

    match execute(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Command) -> Result<ExitCode> {
    match command {
        Command::Run { ledger, operator } => run_operator(ledger, operator).await,
        Command::CreateTask { content, ledger, ai } => create_task(content, ledger, ai).await,
        Command::Verify(args) => {
            let verdict = verify_signature(args)?;
            println!("{}", verdict);
            Ok(if verdict.is_verified() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
    }
}

async fn run_operator(ledger_args: LedgerArgs, operator_args: OperatorArgs) -> Result<ExitCode> {
    let signer = operator_args.signer()?;
    let ledger_config = ledger_args.ledger_config()?;
    let operator_config = operator_args.operator_config(&ledger_args)?;
    let journal = Journal::open(&operator_args.journal)
        .with_context(|| format!("opening journal {}", operator_args.journal.display()))?;

    let ledger = Arc::new(EthLedger::open(ledger_config, &signer).await?);

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(shutdown.clone()));

    let mut operator = Operator::new(ledger.clone(), signer, journal, operator_config);
    let result = operator.run(shutdown).await;
    drop(operator);

    match Arc::try_unwrap(ledger) {
        Ok(ledger) => ledger.close(),
        Err(_) => tracing::debug!("Ledger still shared at shutdown"),
    }

    result?;
    Ok(ExitCode::SUCCESS)
}

async fn create_task(content: String, ledger_args: LedgerArgs, ai_args: AiArgs) -> Result<ExitCode> {
    let signer = ai_args.signer()?;
    let ledger_config = ledger_args.ledger_config()?;

    let ledger = Arc::new(EthLedger::open(ledger_config, &signer).await?);
    let submitter = TaskSubmitter::new(ledger.clone(), signer)
        .with_confirmation_timeout(ledger_args.confirmation_timeout());

    let submitted = submitter.submit_task(&content).await?;
    drop(submitter);

    println!("Task submitted to {}", ledger.name());
    println!("  tx:        {:?}", submitted.tx_hash);
    match submitted.task_index {
        Some(index) => println!("  index:     {}", index),
        None => println!("  index:     unknown"),
    }
    println!("  hash:      0x{}", hex::encode(submitted.hash_before_sign));
    println!("  signature: {}", submitted.signature);

    if let Ok(ledger) = Arc::try_unwrap(ledger) {
        ledger.close();
    }
    Ok(ExitCode::SUCCESS)
}

fn verify_signature(args: VerifyArgs) -> Result<Verdict> {
    let hash = match (&args.content, &args.hash) {
        (Some(content), _) => content_hash(content),
        (None, Some(hash)) => parse_hash(hash)?,
        (None, None) => anyhow::bail!("either --content or --hash is required"),
    };
    let signature = hex::decode(args.signature.trim_start_matches("0x"))
        .context("signature is not valid hex")?;
    let address = config::parse_address("--address", &args.address)?;

    Ok(Verdict::from(verify(&hash, &signature, address)))
}

fn parse_hash(value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value.trim_start_matches("0x")).context("hash is not valid hex")?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| anyhow::anyhow!("hash must be 32 bytes, got {}", bytes.len()))
}

async fn cancel_on_ctrl_c(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Interrupt received, shutting down");
            shutdown.cancel();
        }
        Err(e) => tracing::warn!("Unable to listen for interrupt: {}", e),
    }
}
