//! CLI command implementations

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Subcommand;
use mogile_core::config::mib_to_bytes;
use mogile_core::transfer::ReproxyUrls;
use mogile_core::{BigFileCodec, MogileClient, MogileConfig, MogileError, ReproxyTarget};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// List domains and their classes
    Domains {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show the replica URLs of a key
    Paths { key: String },
    /// Delete a key
    Delete { key: String },
    /// Rename a key
    Rename { from: String, to: String },
    /// List keys by prefix
    List {
        #[arg(long, default_value = "")]
        prefix: String,
        /// Keys per tracker request
        #[arg(long, default_value_t = 1000)]
        limit: u32,
        /// Start after this key
        #[arg(long)]
        after: Option<String>,
        /// Follow the cursor until every key is listed
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },
    /// Upload a file as a single object
    Put {
        key: String,
        file: PathBuf,
        #[arg(short, long, default_value = "default")]
        class: String,
    },
    /// Download an object to a file or stdout
    Get {
        key: String,
        /// Output file, stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the X-Reproxy-URL header for a key
    Reproxy { key: String },
    /// Upload a big file in chunks
    PutBig {
        key: String,
        file: PathBuf,
        #[arg(short, long, default_value = "default")]
        class: String,
        /// Chunk size in MiB
        #[arg(long)]
        chunk_size_mb: Option<u64>,
        /// Replication polls per chunk
        #[arg(long)]
        replication_wait: Option<u64>,
    },
    /// Reassemble a big file into a directory
    GetBig {
        key: String,
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
    /// Print the manifest of a big file
    Manifest { key: String },
}

/// Handle the CLI command
///
/// # Errors
///
/// - `MogileError` - Any client failure, passed through unchanged
/// - Local file errors, with the offending path as context
pub async fn handle_command(command: Commands, config: MogileConfig) -> anyhow::Result<()> {
    let mut client = MogileClient::new(&config)?;

    let result = match command {
        Commands::Domains { json } => show_domains(&mut client, json).await,
        Commands::Paths { key } => show_paths(&mut client, &key).await,
        Commands::Delete { key } => {
            client.directory_mut().delete(&key).await?;
            println!("Deleted {key}");
            Ok(())
        }
        Commands::Rename { from, to } => {
            client.directory_mut().rename(&from, &to).await?;
            println!("Renamed {from} to {to}");
            Ok(())
        }
        Commands::List {
            prefix,
            limit,
            after,
            all,
            json,
        } => list_keys(&mut client, &prefix, limit, after.as_deref(), all, json).await,
        Commands::Put { key, file, class } => {
            client.store_file(&key, &class, &file).await?;
            println!("Stored {} as {key}", file.display());
            Ok(())
        }
        Commands::Get { key, output } => get_object(&mut client, &key, output.as_deref()).await,
        Commands::Reproxy { key } => {
            let urls = client.reproxy(ReproxyTarget::ByKey(key)).await?;
            println!("{}: {}", ReproxyUrls::HEADER_NAME, urls.header_value());
            Ok(())
        }
        Commands::PutBig {
            key,
            file,
            class,
            chunk_size_mb,
            replication_wait,
        } => {
            let mut codec = BigFileCodec::new(client, config.big_file.clone())?;
            if let Some(mb) = chunk_size_mb {
                let bytes = mib_to_bytes(mb).ok_or_else(|| MogileError::Configuration {
                    reason: format!("chunk size of {mb} MiB is too large"),
                })?;
                codec.set_chunk_size(bytes)?;
            }
            if let Some(polls) = replication_wait {
                codec.set_replication_wait(polls);
            }
            let result = put_big(&mut codec, &key, &class, &file).await;
            codec.client_mut().close().await;
            return result;
        }
        Commands::GetBig { key, dir } => {
            let mut codec = BigFileCodec::new(client, config.big_file.clone())?;
            let result = codec.retrieve_to_dir(&key, &dir).await;
            codec.client_mut().close().await;
            let path = result?;
            println!("Wrote {}", path.display());
            return Ok(());
        }
        Commands::Manifest { key } => {
            let mut codec = BigFileCodec::new(client, config.big_file.clone())?;
            let result = codec.parse_manifest(&key).await;
            codec.client_mut().close().await;
            print!("{}", result?.render());
            return Ok(());
        }
    };

    client.close().await;
    result
}

async fn show_domains(client: &mut MogileClient, json: bool) -> anyhow::Result<()> {
    let domains = client.directory_mut().list_domains().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&domains)?);
        return Ok(());
    }

    for (domain, classes) in &domains {
        println!("{domain}");
        for (class, min_devices) in classes {
            println!("  {class:<20} mindevcount={min_devices}");
        }
    }
    Ok(())
}

async fn show_paths(client: &mut MogileClient, key: &str) -> anyhow::Result<()> {
    let paths = client.directory_mut().get_paths(key).await?;
    if paths.is_empty() {
        println!("No paths for {key}");
    }
    for path in paths {
        println!("{path}");
    }
    Ok(())
}

async fn list_keys(
    client: &mut MogileClient,
    prefix: &str,
    limit: u32,
    after: Option<&str>,
    all: bool,
    json: bool,
) -> anyhow::Result<()> {
    if all {
        let keys = client.directory_mut().list_all_keys(prefix, limit).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&keys)?);
        } else {
            keys.iter().for_each(|key| println!("{key}"));
        }
        return Ok(());
    }

    let page = client.directory_mut().list_keys(prefix, after, limit).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&page)?);
        return Ok(());
    }

    page.keys.iter().for_each(|key| println!("{key}"));
    if let Some(next) = page.next_after {
        eprintln!("next: --after {next}");
    }
    Ok(())
}

async fn get_object(
    client: &mut MogileClient,
    key: &str,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    match output {
        Some(path) => {
            let mut file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("cannot create {}", path.display()))?;
            let written = client.passthru_file_data(key, &mut file).await?;
            tracing::info!("Wrote {} bytes to {}", written, path.display());
        }
        None => {
            let mut stdout = tokio::io::stdout();
            client.passthru_file_data(key, &mut stdout).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

async fn put_big(
    codec: &mut BigFileCodec,
    key: &str,
    class: &str,
    file: &Path,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let manifest = codec.store_file(key, class, file, &cancel).await?;
    println!(
        "Stored {} as {key}: {} bytes in {} chunks",
        file.display(),
        manifest.total_size,
        manifest.chunk_count()
    );
    Ok(())
}
