use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use capshare_core::{Identity, Role, SessionConfig, SessionHandle, TransferStatus};

#[derive(Parser, Debug)]
#[command(name = "capshare", version, about = "Move capture sets between devices")]
struct Cli {
    /// Set log level: error,warn,info,debug,trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Data directory (identity, config, staging)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the device identity and config
    Init {
        /// Name shown to peers
        #[arg(long)]
        name: String,

        /// Discovery scope shared by the devices that should see each other
        #[arg(long, default_value = capshare_core::config::DEFAULT_SERVICE_ID)]
        service_id: String,

        /// Port to accept links on (0 = any free port)
        #[arg(long, default_value_t = 0)]
        port: u16,
    },

    /// Show device information
    Info,

    /// Pack the files of a folder into a container
    Pack {
        #[arg(long)]
        source: PathBuf,

        #[arg(long)]
        output: PathBuf,
    },

    /// Extract a container into a folder
    Unpack {
        #[arg(long)]
        input: PathBuf,

        #[arg(long)]
        dest: PathBuf,
    },

    /// List peers announcing on the local network
    Peers {
        /// Browse timeout in seconds
        #[arg(long, default_value_t = 5)]
        timeout: u64,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Wait for capture sets from peers
    Receive {
        /// Copy every received set into this directory
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Send a folder to a peer
    Send {
        /// Folder holding the capture set
        #[arg(long)]
        source: PathBuf,

        /// Peer address (host:port); discovered over mDNS if omitted
        #[arg(long)]
        peer: Option<SocketAddr>,

        /// Seconds to wait for a peer
        #[arg(long, default_value_t = 30)]
        wait: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .init();

    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".capshare")
    });

    match cli.cmd {
        Commands::Init {
            name,
            service_id,
            port,
        } => {
            let cfg = SessionConfig {
                data_dir: data_dir.clone(),
                display_name: name,
                service_id,
                listen_addr: SocketAddr::from(([0, 0, 0, 0], port)),
                ..SessionConfig::default()
            };
            cfg.validate()?;
            cfg.ensure_data_dir()?;
            let identity = Identity::generate_and_store(&cfg.identity_path())?;
            cfg.save()?;

            println!("✓ Device initialized");
            println!("  Name: {}", cfg.display_name);
            println!("  Service: {}", cfg.service_id()?.service_type());
            println!("  Fingerprint: {}", identity.short_fingerprint());
            println!("  Data directory: {}", data_dir.display());
        }

        Commands::Info => {
            let (cfg, identity) = load_device(&data_dir)?;
            println!("Device Information:");
            println!("  Name: {}", cfg.display_name);
            println!("  Service: {}", cfg.service_id()?.service_type());
            println!("  Fingerprint: {}", identity.fingerprint());
            println!("  Listen address: {}", cfg.listen_addr);
            println!("  mDNS: {}", if cfg.mdns { "on" } else { "off" });
            println!("  Data directory: {}", data_dir.display());
        }

        Commands::Pack { source, output } => {
            let path = tokio::task::spawn_blocking(move || archive::write_archive(&source, &output))
                .await??;
            println!("✓ Container written: {}", path.display());
        }

        Commands::Unpack { input, dest } => {
            let target = dest.clone();
            let report = tokio::task::spawn_blocking(move || {
                std::fs::create_dir_all(&target)?;
                archive::read_archive(&input, &target).map_err(anyhow::Error::from)
            })
            .await??;

            println!("✓ Extracted into {}: {}", dest.display(), report.summary());
            for skipped in &report.skipped {
                println!("  skipped {}: {}", skipped.name, skipped.reason);
            }
        }

        Commands::Peers { timeout, json } => {
            let cfg = SessionConfig::load_or_default(&data_dir)?;
            let service = cfg.service_id()?;
            let results = tokio::task::spawn_blocking(move || {
                mdns_core::browse_blocking(&service, Duration::from_secs(timeout))
            })
            .await??;

            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                println!("Discovered {} peer(s):", results.len());
                for svc in results {
                    let name = svc
                        .txt_value(capshare_core::session::TXT_NAME)
                        .unwrap_or(svc.instance_name.as_str());
                    println!("\n  {} @ {}:{}", name, svc.host_name, svc.port);
                    for addr in &svc.addresses {
                        println!("      - {}", addr);
                    }
                    if let Some(fp) = svc.txt_value(capshare_core::session::TXT_FINGERPRINT) {
                        println!("    fingerprint {}", fp);
                    }
                }
            }
        }

        Commands::Receive { output } => {
            let (cfg, identity) = load_device(&data_dir)?;
            receive(cfg, identity, output).await?;
        }

        Commands::Send { source, peer, wait } => {
            let (cfg, identity) = load_device(&data_dir)?;
            send(cfg, identity, &source, peer, Duration::from_secs(wait)).await?;
        }
    }

    Ok(())
}

fn load_device(data_dir: &Path) -> Result<(SessionConfig, Identity)> {
    let cfg = SessionConfig::load_or_default(data_dir)?;
    let identity = Identity::load(&cfg.identity_path())
        .context("Device not initialized. Run 'capshare init' first.")?;
    Ok((cfg, identity))
}

async fn receive(cfg: SessionConfig, identity: Identity, output: Option<PathBuf>) -> Result<()> {
    let session = SessionHandle::start(cfg, identity, Role::Advertiser).await?;
    session.start_discovery().await?;

    if let Some(addr) = session.snapshot().listen_addr {
        println!("✓ Waiting for capture sets on {}", addr);
    }
    println!("  Press Ctrl+C to stop");

    let mut rx = session.subscribe();
    let mut last_connection = String::new();
    let mut last_status = TransferStatus::Idle;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snap = rx.borrow_and_update().clone();
                if let Some(t) = snap.inbound.as_ref().filter(|t| !t.is_finished()) {
                    print!("\r  {:>5.1}%", t.progress_fraction * 100.0);
                    let _ = std::io::stdout().flush();
                }
                if snap.connection_status != last_connection {
                    println!("{}", snap.connection_status);
                    last_connection = snap.connection_status.clone();
                }
                if snap.transfer_status != last_status {
                    if matches!(last_status, TransferStatus::Receiving { .. }) {
                        println!();
                    }
                    println!("{}", snap.transfer_status);
                    if let (TransferStatus::Received { folder, .. }, Some(out)) =
                        (&snap.transfer_status, &output)
                    {
                        let copied = copy_set(folder.clone(), out.clone()).await?;
                        println!("✓ Copied to {}", copied.display());
                    }
                    last_status = snap.transfer_status;
                }
            }
        }
    }

    session.shutdown().await?;
    Ok(())
}

async fn send(
    cfg: SessionConfig,
    identity: Identity,
    source: &Path,
    peer: Option<SocketAddr>,
    wait: Duration,
) -> Result<()> {
    let session = SessionHandle::start(cfg, identity, Role::Browser).await?;
    match peer {
        Some(addr) => session.invite(addr).await?,
        None => session.start_discovery().await?,
    }

    println!("Looking for a peer...");
    let snap = tokio::time::timeout(wait, session.wait_for(|s| s.is_connected))
        .await
        .context("no peer connected in time")??;
    println!("✓ {}", snap.connection_status);

    let mut rx = session.subscribe();
    let progress = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let fraction = rx.borrow_and_update().outbound.as_ref().map(|t| t.progress_fraction);
            if let Some(fraction) = fraction {
                print!("\r  {:>5.1}%", fraction * 100.0);
                let _ = std::io::stdout().flush();
            }
        }
    });

    let result = tokio::select! {
        res = session.pack_and_send(source) => res,
        _ = tokio::signal::ctrl_c() => {
            session.cancel_send().await?;
            Err(capshare_core::TransferError::Cancelled)
        }
    };
    progress.abort();
    println!();

    let status = session.snapshot().transfer_status;
    session.shutdown().await?;
    match result {
        Ok(()) => {
            println!("✓ {}", status);
            Ok(())
        }
        Err(e) => Err(e).context(format!("sending {}", source.display())),
    }
}

/// Copy a received set into a fresh directory under `output`, named after
/// its staging root.
async fn copy_set(folder: PathBuf, output: PathBuf) -> Result<PathBuf> {
    tokio::task::spawn_blocking(move || -> Result<PathBuf> {
        let root = folder
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .context("received folder has no staging root")?;
        let suffix = root.strip_prefix("staging-").unwrap_or(&root);
        let target = output.join(format!("capture-set-{}", suffix));
        std::fs::create_dir_all(&output)?;
        std::fs::create_dir(&target)
            .with_context(|| format!("creating {}", target.display()))?;
        copy_files(&folder, &target)?;
        Ok(target)
    })
    .await?
}

fn copy_files(from: &Path, to: &Path) -> Result<()> {
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            std::fs::copy(entry.path(), to.join(entry.file_name()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn received(staging: &Path, root: &str, file: &str) -> PathBuf {
        let folder = staging.join(root).join("extracted");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join(file), file.as_bytes()).unwrap();
        folder
    }

    #[tokio::test]
    async fn test_sets_are_copied_into_separate_directories() {
        let staging = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        let first = received(staging.path(), "staging-aaa", "a.jpg");
        let second = received(staging.path(), "staging-bbb", "b.jpg");

        let a = copy_set(first.clone(), output.path().to_path_buf()).await.unwrap();
        let b = copy_set(second, output.path().to_path_buf()).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(a.file_name().unwrap(), "capture-set-aaa");
        assert!(a.join("a.jpg").exists() && !a.join("b.jpg").exists());
        assert!(b.join("b.jpg").exists() && !b.join("a.jpg").exists());

        // never merged into an existing copy
        assert!(copy_set(first, output.path().to_path_buf()).await.is_err());
    }
}
