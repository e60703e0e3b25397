//! ssc-cli - Smartcard Self-Service Command Line Interface

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use ssc::{
    CardReport, CardStatusResponse, InputKind, Outcome, SelfService, SoftwareToken, SscConfig,
    StatusCode, StatusDetail, StatusReport, TokenDriver, UserProfile, reconcile,
};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Self-service backend URL
    #[arg(short, long, env = "SSC_SERVER_URL")]
    url: Option<String>,

    /// Drive an in-memory software token with this token id instead of a hardware driver
    #[arg(long, env = "SSC_SOFTWARE_TOKEN")]
    software_token: Option<String>,

    /// Print status reports as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check the inserted card and show the next required action
    Status,

    /// Run (or resume) personalization of the inserted card
    Personalize {
        /// Account to use when the backend offers several
        #[arg(long)]
        account: Option<String>,
    },

    /// Dual-authorization PIN unblock
    #[command(subcommand)]
    Unblock(UnblockCommands),

    /// Decide the next action offline from a saved card status response
    Reconcile {
        /// JSON file holding a get_card_status response
        #[arg(long)]
        file: PathBuf,

        /// Token id the decision is made for
        #[arg(long)]
        token_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum UnblockCommands {
    /// Name the two authorizers
    Start {
        #[arg(long)]
        email1: String,

        #[arg(long)]
        email2: String,
    },

    /// Present both authorization codes and set the new PIN
    Verify {
        #[arg(long, env = "SSC_NEW_PIN", hide_env_values = true)]
        new_pin: String,

        #[arg(long)]
        code1: String,

        #[arg(long)]
        code2: String,
    },
}

fn print_report(report: &StatusReport, json: bool) {
    if json {
        match serde_json::to_string(report) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("{}", format!("Failed to encode report: {}", e).red()),
        }
        return;
    }

    let code = report.code.as_str();
    let label = match report.code {
        StatusCode::Success | StatusCode::ShowStatus => code.green().bold(),
        StatusCode::Error
        | StatusCode::CardBlocked
        | StatusCode::PinPolicy
        | StatusCode::TokenRemoved
        | StatusCode::CardUnknown
        | StatusCode::CardInitial
        | StatusCode::CardDeactivated => code.red().bold(),
        _ => code.yellow().bold(),
    };
    println!("Status: {}", label);

    match &report.detail {
        Some(StatusDetail::SupportCode(support)) => {
            println!("  Support code: {}", support.to_string().cyan());
        }
        Some(StatusDetail::InvalidFields(flags)) => {
            if flags & 1 != 0 {
                println!("  {}", "First authorizer is invalid".red());
            }
            if flags & 2 != 0 {
                println!("  {}", "Second authorizer is invalid".red());
            }
        }
        Some(StatusDetail::Accounts(accounts)) => {
            println!("  Accounts (choose one with --account):");
            for account in accounts {
                println!("    {}", account.cyan());
            }
        }
        Some(StatusDetail::AuthEmails { auth1, auth2 }) => {
            println!("  Codes sent to:");
            println!("    {}", auth1.as_deref().unwrap_or("-"));
            println!("    {}", auth2.as_deref().unwrap_or("-"));
        }
        Some(StatusDetail::Action(action)) => {
            println!("  Next: {}", action.as_str().cyan());
        }
        None => {}
    }
}

fn print_profile(report: &CardReport) {
    let profile = &report.profile;
    println!();
    println!(
        "{}",
        format!("Card of {} {}", profile.given_name, profile.surname)
            .cyan()
            .bold()
    );
    println!("  Card status: {}", profile.card_status.as_str());
    println!("  Health:      {:?}", profile.health);
    println!("  Accounts:    {}", profile.accounts.join(", "));
    for cert in &profile.certificates {
        let health = match cert.health {
            ssc::CertificateHealth::Green => "valid".green(),
            ssc::CertificateHealth::Amber => "expiring".yellow(),
            ssc::CertificateHealth::Red => "invalid".red(),
        };
        println!(
            "  {:?} {} until {} [{}]",
            cert.cert_type,
            cert.serial,
            cert.not_after.format("%Y-%m-%d"),
            health
        );
    }
    if profile.pending_activation {
        println!("  {}", "Activation pending".yellow());
    }
}

fn driver(cli: &Cli) -> Result<Arc<dyn TokenDriver>> {
    match &cli.software_token {
        Some(token_id) => Ok(Arc::new(SoftwareToken::new(token_id))),
        None => bail!("No token driver available. Use --software-token <TOKEN_ID>."),
    }
}

fn service(cli: &Cli) -> Result<SelfService> {
    let config = match &cli.url {
        Some(url) => SscConfig::from_lookup(|key| match key {
            "SSC_SERVER_URL" => Some(url.clone()),
            other => std::env::var(other).ok(),
        }),
        None => SscConfig::from_env(),
    }
    .context("Invalid configuration")?;
    debug!(server_url = %config.server_url, "Loaded configuration");
    Ok(SelfService::from_config(&config, driver(cli)?))
}

fn finish(outcome: &Outcome) -> Result<()> {
    match outcome {
        Outcome::Failed(kind) => bail!("Failed with support code {}", kind.support_code()),
        _ => Ok(()),
    }
}

async fn cmd_status(cli: &Cli) -> Result<()> {
    let mut service = service(cli)?;
    let json = cli.json;
    let report = service
        .check_status(&mut |r: &StatusReport| print_report(r, json))
        .await;
    match report {
        Ok(report) => {
            if !json {
                print_profile(&report);
            }
            Ok(())
        }
        Err(kind) => bail!("Status check failed with support code {}", kind.support_code()),
    }
}

async fn cmd_personalize(cli: &Cli, account: Option<&str>) -> Result<()> {
    let mut service = service(cli)?;
    let json = cli.json;
    let mut print = |r: &StatusReport| print_report(r, json);

    if !json {
        println!("{}", "Personalizing token...".green());
    }
    let mut outcome = service.personalize(&mut print).await;

    if let (Outcome::AwaitingInput(InputKind::SelectAccount { .. }), Some(account)) =
        (&outcome, account)
    {
        outcome = service.select_account(account, &mut print).await;
    }
    finish(&outcome)
}

async fn cmd_unblock_start(cli: &Cli, email1: &str, email2: &str) -> Result<()> {
    let mut service = service(cli)?;
    let json = cli.json;
    let outcome = service
        .start_unblock(email1, email2, &mut |r: &StatusReport| print_report(r, json))
        .await;
    finish(&outcome)
}

async fn cmd_unblock_verify(cli: &Cli, new_pin: &str, code1: &str, code2: &str) -> Result<()> {
    let mut service = service(cli)?;
    let json = cli.json;

    // A fresh process knows nothing of the workflow; the card status names it.
    service
        .check_status(&mut |_: &StatusReport| {})
        .await
        .map_err(|kind| {
            anyhow::anyhow!("Status check failed with support code {}", kind.support_code())
        })?;

    let outcome = service
        .verify_unblock(new_pin, code1, code2, &mut |r: &StatusReport| {
            print_report(r, json)
        })
        .await;
    finish(&outcome)
}

fn cmd_reconcile(cli: &Cli, file: &Path, token_id: &str) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let status: CardStatusResponse =
        serde_json::from_str(&raw).context("Failed to parse card status")?;

    let mut profile = UserProfile::from_record(
        status.user,
        status.card_status,
        status.overall_status,
        Utc::now(),
    );
    let decision = reconcile(&mut profile, &status.workflows, token_id);

    print_report(&StatusReport::from(&decision.action), cli.json);
    if !cli.json {
        println!(
            "  First personalization: {}",
            decision.first_time_personalization
        );
        println!("  Pending activation:    {}", decision.pending_activation);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ssc=info,ssc_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Status => cmd_status(&cli).await,
        Commands::Personalize { account } => cmd_personalize(&cli, account.as_deref()).await,
        Commands::Unblock(unblock_cmd) => match unblock_cmd {
            UnblockCommands::Start { email1, email2 } => {
                cmd_unblock_start(&cli, email1, email2).await
            }
            UnblockCommands::Verify {
                new_pin,
                code1,
                code2,
            } => cmd_unblock_verify(&cli, new_pin, code1, code2).await,
        },
        Commands::Reconcile { file, token_id } => cmd_reconcile(&cli, file, token_id),
    }
}
