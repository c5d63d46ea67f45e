//! cloudmap CLI: inspect and edit a cloudmap store from the shell.
//!
//! - `cloudmap --storage <uri> ls [--prefix P]` lists keys
//! - `cloudmap --storage <uri> get KEY` prints a value
//! - `cloudmap --storage <uri> put KEY VALUE` creates or replaces a value
//! - `cloudmap --storage <uri> rm KEY` deletes a value
//! - `cloudmap --storage <uri> identity` names the bound resource
//!
//! Values are UTF-8 strings. Writes are conditional on the version seen
//! when the command starts, so a concurrent writer makes them fail.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cloudmap_core::serialisation::raw_string;
use cloudmap_core::{CloudMapping, CloudStorage, MappingConfig, Result};

/// Etag-checked key-value storage over cloud backends
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "cloudmap")]
#[command(version)]
struct Cli {
    /// Storage URI, e.g. `az://account/container` or `memtable://acct/table`
    #[arg(long, global = true, default_value = "memory://default")]
    storage: String,

    /// Prefix prepended to every key
    #[arg(long, global = true)]
    key_prefix: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum Command {
    /// List keys
    Ls {
        /// Only list keys starting with this prefix
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Print the value stored at a key
    Get { key: String },

    /// Store a value at a key
    Put { key: String, value: String },

    /// Delete a key
    Rm { key: String },

    /// Print the identity of the storage backend
    Identity,
}

impl Cli {
    fn config(&self) -> MappingConfig {
        let config = MappingConfig::default().with_sync_initially(false);
        match &self.key_prefix {
            Some(prefix) => config.with_key_prefix(prefix.as_str()),
            None => config,
        }
    }
}

async fn open_mapping(cli: &Cli, config: MappingConfig) -> Result<CloudMapping<String>> {
    let backend = cloudmap_storage::open_backend(&cli.storage)?;
    CloudStorage::new(backend)
        .create_mapping(config, raw_string())
        .await
}

async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Ls { prefix } => {
            let mut mapping = open_mapping(&cli, cli.config()).await?;
            mapping.sync_with_cloud(prefix.as_deref()).await?;
            let mut keys: Vec<&str> = mapping.keys().collect();
            keys.sort_unstable();
            for key in keys {
                println!("{key}");
            }
        }
        Command::Get { key } => {
            let config = cli
                .config()
                .with_read_blindly(true)
                .with_read_blindly_error(true);
            let mapping = open_mapping(&cli, config).await?;
            if let Some(value) = mapping.get(key).await? {
                println!("{value}");
            }
        }
        Command::Put { key, value } => {
            let mut mapping = open_mapping(&cli, cli.config()).await?;
            mapping.sync_with_cloud(Some(key.as_str())).await?;
            mapping.set(key, value).await?;
            tracing::debug!(key = %key, "Stored value");
        }
        Command::Rm { key } => {
            let mut mapping = open_mapping(&cli, cli.config()).await?;
            mapping.sync_with_cloud(Some(key.as_str())).await?;
            mapping.delete(key).await?;
        }
        Command::Identity => {
            let backend = cloudmap_storage::open_backend(&cli.storage)?;
            println!("{}", backend.identity());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "cloudmap",
            "ls",
            "--prefix",
            "p/",
            "--storage",
            "memtable://acct/t",
        ])
        .unwrap();
        assert_eq!(cli.storage, "memtable://acct/t");
        assert_eq!(
            cli.command,
            Command::Ls {
                prefix: Some("p/".to_string())
            }
        );
    }

    #[test]
    fn test_parse_put() {
        let cli = Cli::try_parse_from(["cloudmap", "--key-prefix", "app/", "put", "k", "v"]).unwrap();
        assert_eq!(cli.key_prefix.as_deref(), Some("app/"));
        assert_eq!(
            cli.command,
            Command::Put {
                key: "k".to_string(),
                value: "v".to_string()
            }
        );
        assert_eq!(cli.config().key_prefix.as_deref(), Some("app/"));
        assert!(!cli.config().sync_initially);
    }

    #[tokio::test]
    async fn test_put_into_fresh_memory_store() {
        let cli = Cli::try_parse_from(["cloudmap", "put", "k", "v"]).unwrap();
        run(cli).await.unwrap();
    }

    #[tokio::test]
    async fn test_rm_unknown_key_fails() {
        let cli = Cli::try_parse_from(["cloudmap", "rm", "nothing"]).unwrap();
        let err = run(cli).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
