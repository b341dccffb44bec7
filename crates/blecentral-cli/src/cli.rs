//! CLI argument definitions using clap.

use std::fmt;
use std::str::FromStr;

use blecentral_core::{CharacteristicAddress, DedupPolicy};
use clap::{Parser, Subcommand, ValueEnum};

/// Default scan window in seconds.
pub const DEFAULT_SCAN_SECS: u64 = 10;

/// Default time allowed for the connection handshake, in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Output format for commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Scan result deduplication, as accepted on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DedupArg {
    /// One entry per address
    Address,
    /// Keep distinct payloads from the same address
    Value,
}

impl From<DedupArg> for DedupPolicy {
    fn from(arg: DedupArg) -> Self {
        match arg {
            DedupArg::Address => DedupPolicy::ByAddress,
            DedupArg::Value => DedupPolicy::ByValue,
        }
    }
}

/// A `SERVICE/CHARACTERISTIC=VALUE` write request.
///
/// The value is kept as typed; whether it is hex or text is decided by the
/// `--text` flag when the command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSpec {
    pub target: CharacteristicAddress,
    pub value: String,
}

impl FromStr for WriteSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (target, value) = s
            .split_once('=')
            .ok_or_else(|| format!("expected SERVICE/CHARACTERISTIC=VALUE, got '{}'", s))?;
        let target = target.trim().parse().map_err(|e| format!("{}", e))?;
        Ok(Self {
            target,
            value: value.to_string(),
        })
    }
}

impl fmt::Display for WriteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.target, self.value)
    }
}

#[derive(Debug, Parser)]
#[command(name = "blecentral")]
#[command(author, version, about = "Scan for and talk to BLE peripherals", long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan for nearby BLE peripherals
    Scan {
        /// Scan window in seconds [default: 10, or the config file value]
        #[arg(short = 't', long)]
        timeout: Option<u64>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,

        /// Deduplication of repeated advertisements
        #[arg(long, value_enum)]
        dedup: Option<DedupArg>,
    },

    /// Connect to a peripheral, run reads and writes, then listen for notifications
    Connect {
        /// Peripheral address (MAC address or platform UUID)
        #[arg(env = "BLECENTRAL_DEVICE")]
        address: String,

        /// Seconds to keep listening for notifications after the last operation
        #[arg(short, long, default_value = "0")]
        listen: u64,

        /// Characteristic to read, as SERVICE/CHARACTERISTIC (repeatable)
        #[arg(short, long = "read", value_name = "SVC/CHR")]
        reads: Vec<CharacteristicAddress>,

        /// Characteristic to write, as SERVICE/CHARACTERISTIC=HEX (repeatable)
        #[arg(short, long = "write", value_name = "SVC/CHR=VALUE")]
        writes: Vec<WriteSpec>,

        /// Treat write values as UTF-8 text instead of hex
        #[arg(long)]
        text: bool,

        /// Seconds allowed for the connection handshake
        #[arg(short = 'T', long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
        timeout: u64,

        /// Seconds to scan before connecting (0 to skip)
        #[arg(long, default_value = "5")]
        scan: u64,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Manage CLI configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration subcommands
#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Show the config file path
    Path,
    /// Show the effective configuration
    Show,
    /// Write a config file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
