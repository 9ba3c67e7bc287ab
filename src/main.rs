//! identity-vault - operator CLI
//!
//! Opens the configured SQLite database with the configured key pair and runs
//! one command. Results are printed to stdout as JSON; logs go to stderr.

use std::sync::Arc;

use anyhow::{ensure, Context};
use clap::Parser;
use serde_json::json;
use tracing::{error, info};

use identity_vault::{
    config::{Args, Command},
    crypto::SecretBox,
    db::schema::SCHEMA_VERSION,
    logging, IdentityVault, ResolveRequest, SqliteStore, UserId,
};

fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    logging::init_tracing(&args.log_level, args.log_format)
        .context("failed to initialize logging")?;

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    match &args.command {
        Command::Migrate => migrate(&args),
        Command::Resolve {
            transport,
            external_id,
            chat_id,
        } => resolve(&args, transport, external_id, *chat_id),
        Command::Reveal { user_id, transport } => reveal(&args, UserId(*user_id), transport),
        Command::Status => status(&args),
        Command::Selftest => selftest(&args),
    }
}

fn open_store(args: &Args) -> anyhow::Result<Arc<SqliteStore>> {
    let store = SqliteStore::open(&args.store_config()).with_context(|| {
        format!(
            "failed to open identity database at {}",
            args.database_path.display()
        )
    })?;
    Ok(Arc::new(store))
}

fn open_vault(args: &Args) -> anyhow::Result<IdentityVault> {
    let ring = args.key_ring()?;
    let store = open_store(args)?;
    info!(
        hash_key_id = ?ring.hash_key_id(),
        enc_key_id = ?ring.enc_key_id(),
        "Key ring configured"
    );
    Ok(IdentityVault::new(store, ring).with_tx_timeout(args.tx_timeout()))
}

fn migrate(args: &Args) -> anyhow::Result<()> {
    open_store(args)?;
    println!(
        "{}",
        json!({
            "database": args.database_path.display().to_string(),
            "schema_version": SCHEMA_VERSION,
        })
    );
    Ok(())
}

fn resolve(
    args: &Args,
    transport: &str,
    external_id: &str,
    chat_id: Option<i64>,
) -> anyhow::Result<()> {
    let vault = open_vault(args)?;

    let mut request = ResolveRequest::new(transport, external_id);
    if let Some(chat_id) = chat_id {
        request = request.with_chat_id(chat_id);
    }

    let resolution = vault.resolve_with(request)?;
    println!("{}", serde_json::to_string(&resolution)?);
    Ok(())
}

fn reveal(args: &Args, user_id: UserId, transport: &str) -> anyhow::Result<()> {
    let vault = open_vault(args)?;
    let chat_id = vault.read_chat_id(user_id, &transport.to_lowercase())?;
    println!("{}", json!({ "user_id": user_id, "chat_id": chat_id }));
    Ok(())
}

fn status(args: &Args) -> anyhow::Result<()> {
    let vault = open_vault(args)?;
    let stats = vault.store_stats()?;
    let ring = vault.key_ring();
    println!(
        "{}",
        json!({
            "database": args.database_path.display().to_string(),
            "hash_key_id": ring.hash_key_id(),
            "enc_key_id": ring.enc_key_id(),
            "users": stats.users,
            "identities": stats.identities,
            "attributes": stats.attributes,
        })
    );
    Ok(())
}

fn selftest(args: &Args) -> anyhow::Result<()> {
    let key = args.aead_key_bytes().map_err(anyhow::Error::msg)?;
    let secret_box = SecretBox::new(&key)?;

    let context = b"selftest";
    let plaintext = b"identity-vault self-test";

    // Roundtrip
    let sealed = secret_box.seal(plaintext, context)?;
    let opened = secret_box.open(&sealed, context)?;
    ensure!(opened == plaintext, "roundtrip mismatch");

    // Every flipped byte must be rejected
    for i in 0..sealed.len() {
        let mut tampered = sealed.clone();
        tampered[i] ^= 0x01;
        ensure!(
            secret_box.open(&tampered, context).is_err(),
            "tampered byte {} was accepted",
            i
        );
    }

    // A different context must be rejected
    ensure!(
        secret_box.open(&sealed, b"other-context").is_err(),
        "box opened under a different context"
    );

    // Integer attributes
    let sealed_id = secret_box.seal_i64(555555, context)?;
    ensure!(
        secret_box.open_i64(&sealed_id, context)? == 555555,
        "integer roundtrip mismatch"
    );

    info!(box_len = sealed.len(), "Self-test passed");
    println!("OK: AES-256-GCM secret box self-test passed");
    Ok(())
}
