pub mod cbor;
pub mod client;
pub mod config;
pub mod cose;
pub mod crypto;
pub mod ctap2;
pub mod ctaphid;
pub mod error;
pub mod request_buffer;
pub mod store;
pub mod u2f;
pub mod usb;
pub mod usbip;

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use client::{Approver, StaticApprover, TerminalApprover, VirtualFidoClient};
use config::{Command, Config, PinCommand, MIN_PIN_LENGTH};
use ctap2::Ctap2Server;
use ctaphid::Authenticators;
use store::FileBlobStore;
use u2f::U2fServer;
use usb::FidoUsbDevice;
use usbip::{UsbIpDevice, UsbIpServer};

pub use error::{Error, Result};

pub fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .init();
}

pub fn default_vault_path() -> anyhow::Result<PathBuf> {
    Ok(directories::ProjectDirs::from("", "", "virtual-fido")
        .ok_or_else(|| anyhow::anyhow!("cannot determine XDG data dir"))?
        .data_dir()
        .join("vault.json"))
}

fn lock_path(vault: &Path) -> PathBuf {
    let mut path = vault.as_os_str().to_owned();
    path.push(".lock");
    PathBuf::from(path)
}

fn read_passphrase() -> anyhow::Result<String> {
    let mut stderr = std::io::stderr();
    write!(stderr, "Vault passphrase: ")?;
    stderr.flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let passphrase = line.trim_end_matches(['\r', '\n']).to_string();
    if passphrase.is_empty() {
        anyhow::bail!("empty vault passphrase");
    }
    Ok(passphrase)
}

pub async fn run(cfg: Config) -> anyhow::Result<()> {
    init_tracing(cfg.verbose);

    let vault_path = match &cfg.vault {
        Some(path) => path.clone(),
        None => default_vault_path()?,
    };
    if let Some(dir) = vault_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }

    // Single writer per vault
    let lock_path = lock_path(&vault_path);
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    let mut lock = fd_lock::RwLock::new(lock_file);
    let _guard = lock.try_write().map_err(|_| {
        anyhow::anyhow!(
            "vault is in use by another virtual-fido process (lock: {})",
            lock_path.display()
        )
    })?;

    let passphrase = match cfg.passphrase {
        Some(passphrase) => passphrase,
        None => read_passphrase()?,
    };
    let blob_store = FileBlobStore::new(&vault_path, passphrase);
    let client = Arc::new(VirtualFidoClient::load(Box::new(blob_store)).map_err(|e| {
        anyhow::anyhow!("Failed to open vault {}: {e}", vault_path.display())
    })?);

    match cfg.command {
        Command::Start { auto_approve, port } => {
            let approver: Arc<dyn Approver> = if auto_approve {
                tracing::warn!("Auto-approving every request");
                Arc::new(StaticApprover(true))
            } else {
                Arc::new(TerminalApprover::new())
            };
            let listener = UsbIpServer::bind(port)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to bind 127.0.0.1:{port}: {e}"))?;
            println!("Virtual FIDO device ready; attach with: sudo usbip attach -r 127.0.0.1 -b {}", usb::device::BUS_ID);
            tokio::select! {
                result = serve(client, approver, listener) => result?,
                _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted, shutting down"),
            }
        }
        Command::List => list(&client, &vault_path),
        Command::Delete { identity } => delete(&client, &identity)?,
        Command::Pin { action } => pin(&client, action)?,
    }
    Ok(())
}

/// Runs the CTAPHID loop and serves the key on `listener` until it fails.
pub async fn serve(
    client: Arc<VirtualFidoClient>,
    approver: Arc<dyn Approver>,
    listener: TcpListener,
) -> Result<()> {
    let handler = Arc::new(Authenticators {
        ctap2: Ctap2Server::new(client.clone(), client.clone(), client.clone(), approver.clone()),
        u2f: U2fServer::new(client.clone(), client, approver),
    });

    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
    tokio::spawn(ctaphid::run_ctaphid_loop(incoming_rx, outgoing_tx, handler));

    let device: Arc<dyn UsbIpDevice> = Arc::new(FidoUsbDevice::start(incoming_tx, outgoing_rx));
    let server = Arc::new(UsbIpServer::new(vec![device]));
    server.serve(listener).await?;
    Ok(())
}

fn list(client: &VirtualFidoClient, vault_path: &Path) {
    println!("------- Identities in file '{}' -------", vault_path.display());
    for source in client.identities() {
        let short_id = hex::encode(&source.id[..source.id.len().min(4)]);
        println!(
            "({short_id}): '{}' for website '{}'",
            source.user.name, source.relying_party.name
        );
    }
}

fn delete(client: &VirtualFidoClient, prefix: &str) -> anyhow::Result<()> {
    let prefix = prefix.to_ascii_lowercase();
    let targets: Vec<_> = client
        .identities()
        .into_iter()
        .filter(|source| source.id_hex().starts_with(&prefix))
        .collect();
    match targets.as_slice() {
        [] => anyhow::bail!("No identity found with prefix ({prefix})"),
        [target] => {
            if client.delete_identity(&target.id)? {
                println!("Deleted identity ({})", target.id_hex());
                Ok(())
            } else {
                anyhow::bail!("Could not find ({})", target.id_hex())
            }
        }
        many => {
            println!("Multiple identities with prefix ({prefix}):");
            for source in many {
                println!("- ({})", source.id_hex());
            }
            anyhow::bail!("identity prefix ({prefix}) is ambiguous")
        }
    }
}

fn pin(client: &VirtualFidoClient, action: PinCommand) -> anyhow::Result<()> {
    match action {
        PinCommand::Enable => {
            client.set_pin_enabled(true)?;
            println!("PIN support enabled");
        }
        PinCommand::Disable => {
            client.set_pin_enabled(false)?;
            println!("PIN support disabled");
        }
        PinCommand::Set { pin } => {
            if pin.len() < MIN_PIN_LENGTH || !pin.bytes().all(|b| b.is_ascii_digit()) {
                anyhow::bail!("PIN must be at least {MIN_PIN_LENGTH} digits");
            }
            if !client.pin_enabled() {
                client.set_pin_enabled(true)?;
            }
            client.set_pin(&pin)?;
            println!("PIN set");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CredentialCapability, MemoryBlobStore};

    #[test]
    fn test_lock_path_appends_suffix() {
        assert_eq!(
            lock_path(Path::new("/tmp/vault.json")),
            PathBuf::from("/tmp/vault.json.lock")
        );
    }

    #[test]
    fn test_pin_set_rejects_short_or_non_digit() {
        let client = VirtualFidoClient::load(Box::new(MemoryBlobStore::new("p"))).unwrap();
        assert!(pin(&client, PinCommand::Set { pin: "123".into() }).is_err());
        assert!(pin(&client, PinCommand::Set { pin: "12a4".into() }).is_err());
        pin(&client, PinCommand::Set { pin: "1234".into() }).unwrap();
        assert!(client.pin_enabled());
    }

    #[test]
    fn test_delete_by_prefix() {
        let client = VirtualFidoClient::load(Box::new(MemoryBlobStore::new("p"))).unwrap();
        let rp = store::RelyingParty {
            id: "example.com".into(),
            name: "Example".into(),
        };
        let user = store::User {
            id: vec![1],
            name: "alice".into(),
            display_name: "Alice".into(),
        };
        let source = client.new_credential(rp, user).unwrap();
        assert!(delete(&client, "zz").is_err());
        delete(&client, &source.id_hex()[..6]).unwrap();
        assert!(client.identities().is_empty());
    }
}
