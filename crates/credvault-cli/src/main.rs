mod cli;
mod config;
mod storage;
mod unlock;
mod users;

use std::time::Duration;

use crate::cli::ConfigCommand;
use clap::Parser;
use color_eyre::Result;
use credvault_core::storage::{BackingStore, RowMetadata};
use credvault_storage::key_provider::SecureKeyProvider;
use credvault_users::SecureUserStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Entry point wiring the CLI to the encrypted user store.
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    match cli.command.unwrap_or(cli::Command::Status) {
        cli::Command::Version => print_version(),
        cli::Command::Health => run_health_check(&config)?,
        cli::Command::Status => run_status(&config)?,
        cli::Command::Unlock { wait } => run_unlock(&config, wait).await?,
        cli::Command::Config(ConfigCommand::Init) => init_config(&config)?,
        cli::Command::User(cmd) => users::handle(cmd, &storage::store_from_config(&config)?)?,
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info to avoid noisy stdout.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("credvault {}", env!("CARGO_PKG_VERSION"));
}

/// Runs a quick health check of the row store and the envelope cipher.
fn run_health_check(config: &config::Config) -> Result<()> {
    let store = storage::store_from_config(config)?;
    run_store_health(&store)?;
    println!("Storage: ok");
    println!("Envelope cipher: ok ({})", store.cipher().strategy());
    Ok(())
}

fn run_store_health<B, P>(store: &SecureUserStore<B, P>) -> Result<()>
where
    B: BackingStore,
    P: SecureKeyProvider,
{
    let probe_key = "health/probe";
    let payload = b"ok";
    let backing = store.backing();
    backing
        .write(probe_key, payload, &RowMetadata::default())
        .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;
    let round_trip = backing
        .read(probe_key)
        .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;
    backing
        .delete(probe_key)
        .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;
    if round_trip.map(|row| row.value).as_deref() != Some(&payload[..]) {
        color_eyre::eyre::bail!("storage round-trip failed");
    }

    let cipher = store.cipher();
    if !cipher
        .is_unlocked()
        .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?
    {
        color_eyre::eyre::bail!("keystore is locked; run `credvault unlock` first");
    }
    let envelope = cipher
        .encrypt("ok")
        .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;
    let decrypted = cipher
        .decrypt(&envelope.encode())
        .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;
    if decrypted != "ok" {
        color_eyre::eyre::bail!("envelope round-trip failed");
    }
    Ok(())
}

fn run_status(config: &config::Config) -> Result<()> {
    let store = storage::store_from_config(config)?;
    let cipher = store.cipher();
    println!("Data dir: {}", store.backing().root().display());
    println!(
        "Keystore: {:?} (alias {})",
        cipher.provider().capability(),
        cipher.alias()
    );
    println!("Cipher strategy: {}", cipher.strategy());
    let unlocked = cipher
        .is_unlocked()
        .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;
    println!("Unlocked: {}", if unlocked { "yes" } else { "no" });
    let rows = store
        .backing()
        .list()
        .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;
    println!("Stored rows: {}", rows.len());
    Ok(())
}

async fn run_unlock(config: &config::Config, wait: Option<u64>) -> Result<()> {
    let store = storage::store_from_config(config)?;
    if store.is_unlocked()? {
        println!("Keystore already unlocked.");
        return Ok(());
    }

    store.request_unlock()?;
    let Some(secs) = wait else {
        println!("Unlock requested; run `credvault status` once the prompt is answered.");
        return Ok(());
    };

    let unlocked = unlock::wait_for_unlock(
        || store.is_unlocked(),
        Duration::from_secs(secs),
        unlock::POLL_INTERVAL,
    )
    .await?;
    if unlocked {
        println!("Keystore unlocked.");
    } else {
        color_eyre::eyre::bail!("keystore still locked after {secs}s");
    }
    Ok(())
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage;

    #[test]
    fn health_check_with_test_store_succeeds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = storage::test_store(dir.path());
        run_store_health(&store).expect("health check should succeed");
        assert!(store.backing().list().expect("list").is_empty());
    }

    #[test]
    fn health_check_reports_locked_keystore() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = storage::test_store(dir.path());
        store.cipher().provider().set_locked(true).expect("lock");

        let err = run_store_health(&store).expect_err("locked");
        assert!(err.to_string().contains("locked"));
    }
}
