use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tavreg", about = "Tavily sign-up automation & API key harvester")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config/default.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register accounts end to end and persist harvested credentials
    Register {
        /// Number of accounts to register, sequentially
        #[arg(short = 'n', long, default_value = "1")]
        count: u32,
    },
    /// Poll the configured mailbox once and print any verification tokens
    CheckMail {
        /// Recipient address to match (defaults to the configured alias)
        #[arg(short, long)]
        recipient: Option<String>,
    },
}
