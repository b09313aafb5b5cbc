mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use tracing::warn;

use tavreg_core::config::AppConfig;
use tavreg_core::RegisterError;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config_str = std::fs::read_to_string(&cli.config).unwrap_or_else(|_| {
        warn!(path = %cli.config, "config file not found, using defaults");
        include_str!("../config/default.toml").to_string()
    });
    let mut config: AppConfig =
        toml::from_str(&config_str).map_err(|e| RegisterError::Config(e.to_string()))?;

    // Environment overrides for the values that differ per deployment
    if let Ok(v) = std::env::var("TEMP_MAIL") {
        // the alias may arrive as "name@domain" or as a bare name
        match v.split_once('@') {
            Some((alias, domain)) => {
                config.mailbox.alias = alias.to_string();
                config.mailbox.domain = domain.to_string();
            }
            None => config.mailbox.alias = v,
        }
    }
    if let Ok(v) = std::env::var("TEMP_MAIL_EPIN") {
        config.mailbox.epin = v;
    }
    if let Ok(v) = std::env::var("TEMP_MAIL_API_URL") {
        config.mailbox.api_url = v;
    }
    if let Ok(v) = std::env::var("REGISTER_URL") {
        config.registration.signup_url = v;
    }
    if let Ok(v) = std::env::var("CAPTCHA_SOLVER_URL") {
        config.captcha.solver_url = v;
    }
    if let Ok(v) = std::env::var("HEADLESS") {
        config.browser.headless = v != "0" && v.to_lowercase() != "false";
    }
    if let Ok(v) = std::env::var("ACCOUNTS_CSV") {
        config.sink.csv_path = v;
    }

    match cli.command {
        Commands::Register { count } => {
            commands::register::run(config, count).await?;
        }
        Commands::CheckMail { recipient } => {
            commands::check_mail::run(config, recipient).await?;
        }
    }

    Ok(())
}
