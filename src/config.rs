use std::path::PathBuf;

pub const AAGUID: [u8; 16] = [
    0x75, 0x6c, 0x5a, 0xf5, 0xec, 0xa6, 0x01, 0xa3, 0x2f, 0xc6, 0xd3, 0x0c, 0xe2, 0xf2, 0x01, 0xc5,
];
pub const USBIP_PORT: u16 = 3240;
pub const IN_URB_TIMEOUT_MS: u64 = 1000;
pub const KEEPALIVE_INTERVAL_MS: u64 = 75;
pub const PIN_RETRIES_MAX: u8 = 8;
pub const MIN_PIN_LENGTH: usize = 4;
pub const MAX_MESSAGE_SIZE: usize = 7609;
pub const MAX_CHANNELS: usize = 64;
pub const TRANSACTION_TIMEOUT_SECS: u64 = 3;
pub const PASSPHRASE_ENV: &str = "VIRTUAL_FIDO_PASSPHRASE";

#[derive(clap::Parser, Debug, Clone)]
#[command(name = "virtual-fido", about = "Virtual FIDO2/U2F security key over USB/IP")]
pub struct Config {
    /// Encrypted vault file. Defaults to vault.json in the user data directory.
    #[arg(long, global = true)]
    pub vault: Option<PathBuf>,
    /// Vault passphrase.
    #[arg(long, global = true, env = PASSPHRASE_ENV, hide_env_values = true)]
    pub passphrase: Option<String>,
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve the virtual key over USB/IP on loopback.
    Start {
        /// Approve every request without prompting.
        #[arg(long)]
        auto_approve: bool,
        #[arg(long, default_value_t = USBIP_PORT)]
        port: u16,
    },
    /// List stored identities.
    List,
    /// Delete the identity whose hex id starts with the given prefix.
    Delete {
        #[arg(long)]
        identity: String,
    },
    /// Manage the client PIN.
    Pin {
        #[command(subcommand)]
        action: PinCommand,
    },
}

#[derive(clap::Subcommand, Debug, Clone)]
pub enum PinCommand {
    Enable,
    Disable,
    Set {
        #[arg(long)]
        pin: String,
    },
}
