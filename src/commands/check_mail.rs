use anyhow::Result;
use chrono::{Duration, Utc};

use tavreg_core::config::AppConfig;
use tavreg_registration::{Mailbox, MailboxQuery, TempMailClient, VerificationToken};

/// One-shot mailbox inspection for tuning the mailbox settings before
/// running registrations.
pub async fn run(config: AppConfig, recipient: Option<String>) -> Result<()> {
    let client = TempMailClient::new(&config.mailbox)?;
    let recipient =
        recipient.unwrap_or_else(|| format!("{}@{}", config.mailbox.alias, config.mailbox.domain));

    let query = MailboxQuery {
        recipient: recipient.clone(),
        sender_domain: config.registration.mail_sender_domain.clone(),
        received_after: Utc::now() - Duration::hours(24),
    };

    let messages = client.fetch(&query).await?;
    if messages.is_empty() {
        println!("No verification messages for {} in the last 24h", recipient);
        return Ok(());
    }

    for message in messages {
        match &message.token {
            VerificationToken::Code(code) => {
                println!("[{}] {}: code {}", message.received_at, message.id, code);
            }
            VerificationToken::Link(link) => {
                println!("[{}] {}: link {}", message.received_at, message.id, link);
            }
        }
    }

    Ok(())
}
