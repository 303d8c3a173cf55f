//! ALFA Identity Vault - CLI
//!
//! Command-line interface for enrollment, verification and sync. Face
//! detection runs elsewhere: commands take embeddings as JSON float arrays.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use secrecy::SecretString;

use alfa_identity_vault::config::CONFIG_FILE;
use alfa_identity_vault::{
    Embedding, IdentityConfig, IdentityError, IdentityResult, IdentityVault, SyncOutcome, SyncReport,
};

/// Environment variable consulted when `--passphrase` is not given
const PASSPHRASE_ENV: &str = "ALFA_IDENTITY_PASSPHRASE";

/// Exit code for a completed check that did not pass
const EXIT_NO_MATCH: i32 = 2;

#[derive(Parser)]
#[command(name = "alfa-identity")]
#[command(author = "Karen Tonoyan")]
#[command(version = alfa_identity_vault::VERSION)]
#[command(about = "ALFA Identity Vault - Biometric template protection with offline-first sync")]
struct Cli {
    /// Data directory
    #[arg(short, long, default_value = "./identity")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new identity vault
    Init {
        #[arg(short, long)]
        passphrase: Option<String>,

        /// Use Argon2id instead of PBKDF2 for the master key
        #[arg(long)]
        argon2: bool,
    },

    /// Enroll an embedding (JSON array of floats)
    Enroll {
        embedding: PathBuf,

        /// Raw sample image stored next to the record
        #[arg(short, long)]
        sample: Option<PathBuf>,

        #[arg(short, long)]
        label: Option<String>,

        #[arg(short, long)]
        passphrase: Option<String>,
    },

    /// List stored records
    List,

    /// Verify a record: commitment check plus template match
    Verify {
        id: String,

        /// Probe embedding (JSON array of floats)
        embedding: PathBuf,

        /// Override the configured match tolerance
        #[arg(short, long)]
        tolerance: Option<f64>,

        #[arg(short, long)]
        passphrase: Option<String>,
    },

    /// Find the closest enrolled record for a probe embedding
    Identify {
        embedding: PathBuf,

        #[arg(short, long)]
        tolerance: Option<f64>,

        #[arg(short, long)]
        passphrase: Option<String>,
    },

    /// Upload pending records (all, or one by id)
    Sync { id: Option<String> },

    /// Commit uploaded records to the ledger (all, or one by id)
    Commit { id: Option<String> },

    /// Delete a record and its sample
    Delete { id: String },

    /// Restore a record from the content store
    Restore { pointer: String },

    /// Show the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    // The vault (and its master key) is dropped inside `run`, before exit
    match run(cli).await {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e.user_message());
            std::process::exit(1);
        }
    }
}

fn passphrase(arg: Option<String>) -> IdentityResult<SecretString> {
    arg.or_else(|| std::env::var(PASSPHRASE_ENV).ok())
        .map(SecretString::new)
        .ok_or_else(|| {
            IdentityError::WeakInput(format!("passphrase required (--passphrase or {})", PASSPHRASE_ENV))
        })
}

fn read_embedding(path: &Path) -> IdentityResult<Embedding> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

async fn unlocked(data_dir: &Path, arg: Option<String>) -> IdentityResult<IdentityVault> {
    let vault = IdentityVault::open(data_dir)?;
    vault.unlock(passphrase(arg)?).await?;
    Ok(vault)
}

fn print_outcomes(outcomes: &[SyncOutcome]) {
    for outcome in outcomes {
        match &outcome.result {
            Ok(record) => println!(
                "  ✅ {} -> {}",
                outcome.id,
                record.remote_pointer.as_deref().unwrap_or("-")
            ),
            Err(e) => {
                let hint = if e.is_retryable() { " (will retry)" } else { "" };
                println!("  ❌ {}: {}{}", outcome.id, e, hint);
            }
        }
    }

    let report = SyncReport::from_outcomes(outcomes);
    println!("{:-<50}", "");
    println!("Total: {}  OK: {}  Failed: {}", report.total, report.synced, report.failed);
}

/// Runs one command; returns the process exit code
async fn run(cli: Cli) -> IdentityResult<i32> {
    let data_dir = cli.data_dir;

    match cli.command {
        Commands::Init { passphrase: arg, argon2 } => {
            println!("🔐 Creating ALFA Identity Vault...");
            let mut config = IdentityConfig::for_dir(&data_dir);
            if argon2 {
                config.kdf = alfa_identity_vault::crypto::KdfParams::argon2id_default();
            }
            let kdf_name = config.kdf.name();
            IdentityVault::create(config, passphrase(arg)?).await?;

            println!("✅ Vault created at: {}", data_dir.display());
            println!("   Master key: {}", kdf_name);
            println!("📁 Structure:");
            println!("   manifest.json  - salt + passphrase verifier");
            println!("   records.db     - encrypted records");
            println!("   samples/       - sample images");
            println!("   remote/        - local content store");
        }

        Commands::Enroll {
            embedding,
            sample,
            label,
            passphrase: arg,
        } => {
            let probe = read_embedding(&embedding)?;
            let sample_bytes = sample.as_deref().map(std::fs::read).transpose()?;

            let vault = unlocked(&data_dir, arg).await?;
            let record = vault.enroll(&probe, label, sample_bytes.as_deref())?;

            println!("✅ Enrolled record: {}", record.id);
            println!("   Commitment: {}", record.identity_commitment);
            println!("   State:      {}", record.state);
        }

        Commands::List => {
            let vault = IdentityVault::open(&data_dir)?;
            let records = vault.list()?;

            if records.is_empty() {
                println!("📭 No records");
            } else {
                println!("🪪 Records ({}):", records.len());
                println!("{:-<90}", "");
                for record in &records {
                    let committed = if record.ledger_receipt.is_some() { "⛓" } else { " " };
                    println!(
                        "{} {} {:<8} {} {}",
                        committed,
                        record.id,
                        record.state.as_str(),
                        record.identity_commitment,
                        record.label.as_deref().unwrap_or("")
                    );
                }
                let stats = vault.stats()?;
                println!("{:-<90}", "");
                println!(
                    "pending: {}  uploaded: {}  committed: {}",
                    stats.pending, stats.uploaded, stats.committed
                );
            }
        }

        Commands::Verify {
            id,
            embedding,
            tolerance,
            passphrase: arg,
        } => {
            let probe = read_embedding(&embedding)?;
            let vault = unlocked(&data_dir, arg).await?;

            let commitment_ok = vault.verify_commitment(&id)?;
            let outcome = vault.verify(&id, &probe, tolerance)?;

            println!("🔎 Record {}", id);
            println!("   Commitment check: {}", if commitment_ok { "✅ valid" } else { "❌ mismatch" });
            println!(
                "   Template match:   {} (distance {:.4}, tolerance {})",
                if outcome.matched { "✅ match" } else { "❌ no match" },
                outcome.distance,
                outcome.tolerance
            );

            if !commitment_ok || !outcome.matched {
                return Ok(EXIT_NO_MATCH);
            }
        }

        Commands::Identify {
            embedding,
            tolerance,
            passphrase: arg,
        } => {
            let probe = read_embedding(&embedding)?;
            let vault = unlocked(&data_dir, arg).await?;

            let result = vault.identify(&probe, tolerance)?;
            if !result.skipped.is_empty() {
                println!("⚠️ {} record(s) could not be read:", result.skipped.len());
                for id in &result.skipped {
                    println!("   {}", id);
                }
            }

            match result.found {
                Some(found) => println!(
                    "✅ Identified {} {} (distance {:.4})",
                    found.record_id,
                    found.label.as_deref().unwrap_or(""),
                    found.outcome.distance
                ),
                None => {
                    println!("❓ No enrolled record within tolerance");
                    return Ok(EXIT_NO_MATCH);
                }
            }
        }

        Commands::Sync { id } => {
            let vault = IdentityVault::open(&data_dir)?;
            match id {
                Some(id) => {
                    let record = vault.sync_one(&id).await?;
                    println!(
                        "✅ {} uploaded as {}",
                        record.id,
                        record.remote_pointer.as_deref().unwrap_or("-")
                    );
                }
                None => {
                    println!("☁️ Syncing pending records...");
                    let outcomes = vault.sync_all().await?;
                    if outcomes.is_empty() {
                        println!("✅ Nothing to sync");
                    } else {
                        print_outcomes(&outcomes);
                    }
                }
            }
        }

        Commands::Commit { id } => {
            let vault = IdentityVault::open(&data_dir)?;
            match id {
                Some(id) => {
                    let record = vault.commit(&id).await?;
                    if let Some(receipt) = record.ledger_receipt {
                        println!("⛓ Committed {} tx {} block {}", record.id, receipt.tx_hash, receipt.block_ref);
                    }
                }
                None => {
                    let outcomes = vault.commit_all().await?;
                    if outcomes.is_empty() {
                        println!("✅ Nothing to commit");
                    } else {
                        print_outcomes(&outcomes);
                    }
                }
            }
        }

        Commands::Delete { id } => {
            let vault = IdentityVault::open(&data_dir)?;
            if vault.delete(&id)? {
                println!("🗑️ Record {} deleted", id);
            } else {
                println!("📭 No record {}", id);
            }
        }

        Commands::Restore { pointer } => {
            let vault = IdentityVault::open(&data_dir)?;
            let record = vault.restore(&pointer).await?;
            println!("✅ Restored record {} ({})", record.id, record.identity_commitment);
        }

        Commands::ShowConfig => {
            let mut config = IdentityConfig::load(&data_dir.join(CONFIG_FILE))?;
            config.data_dir = data_dir;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(0)
}
