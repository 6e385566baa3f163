//! Command-line configuration.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use uuid::Uuid;

/// Exit code for command-line usage errors.
pub const EXIT_USAGE: i32 = 64;

/// Log verbosity selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Verbose,
    Info,
    Warning,
}

impl LogLevel {
    /// The `tracing` filter directive this level selects.
    pub fn directive(&self) -> &'static str {
        match self {
            LogLevel::Verbose => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
        }
    }
}

/// The Catena daemon command line.
#[derive(Debug, Parser)]
#[command(name = "catena", version, about = "Catena SQL blockchain daemon")]
pub struct Cli {
    /// Chain database file.
    #[arg(short = 'd', long = "database", default_value = "catena.sqlite")]
    pub database: PathBuf,

    /// Keep the chain database in memory.
    #[arg(long = "in-memory-database")]
    pub in_memory_database: bool,

    /// Genesis seed string.
    #[arg(short = 's', long = "seed", default_value = "")]
    pub seed: String,

    /// Gossip listen port.
    #[arg(short = 'p', long = "gossip-port", default_value_t = 8338)]
    pub gossip_port: u16,

    /// Query listen port. Defaults to the gossip port plus one.
    #[arg(short = 'q', long = "query-port")]
    pub query_port: Option<u16>,

    /// Peer addresses to join at startup.
    #[arg(short = 'j', long = "join")]
    pub join: Vec<String>,

    /// Mine blocks.
    #[arg(short = 'm', long = "mine")]
    pub mine: bool,

    /// Truncate the chain database and the stored peer table.
    #[arg(short = 'i', long = "initialize")]
    pub initialize: bool,

    /// Do not execute statements while catching up; only advance
    /// counters and the head pointer.
    #[arg(short = 'n', long = "no-replay")]
    pub no_replay: bool,

    /// Node database file (identity, peers).
    #[arg(long = "node-database", default_value = "catena-node.sqlite")]
    pub node_database: PathBuf,

    /// Fixed node UUID instead of the persisted one.
    #[arg(long = "node-uuid")]
    pub node_uuid: Option<Uuid>,

    /// Print the node identity and exit.
    #[arg(long = "show-identity")]
    pub show_identity: bool,

    /// Log level.
    #[arg(short = 'v', long = "log", value_enum, default_value_t = LogLevel::Info)]
    pub log: LogLevel,
}

impl Cli {
    /// The effective query port.
    pub fn query_port(&self) -> u16 {
        self.query_port.unwrap_or(self.gossip_port + 1)
    }
}
