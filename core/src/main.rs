/// SwapChat - interactive negotiation chat for one session
use colored::Colorize;
use std::collections::HashSet;
use std::env;
use swapchat_core::negotiation_types::{ClientEvent, MessageKey, SessionId};
use swapchat_core::config::FLAG_USAGE;
use swapchat_core::{Config, Delivery, NegotiationClient};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let (config, positional) =
        Config::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let session_id = match positional.first() {
        Some(id) => SessionId::new(id.as_str()),
        None => {
            print_usage();
            return Ok(());
        }
    };

    let client = NegotiationClient::new(&config)?;
    let mut events = client.subscribe();

    let view = client.open_session(&session_id).await?;
    info!("Chat {} with {}", view.session_id, view.counterpart.display_name());
    println!(
        "{} {} ({})",
        "Negotiating".bold(),
        view.title,
        view.counterpart.display_name()
    );
    if view.can_complete {
        println!("{}", "You confirm receipt: type /complete when the book arrives".dimmed());
    }

    let mut printed: HashSet<MessageKey> = HashSet::new();
    print_new(&client, &session_id, &mut printed).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                match line {
                    "" => {}
                    "/quit" => break,
                    "/complete" => match client.request_completion(&session_id).await {
                        Ok(phase) => println!("{} {}", "Session".bold(), phase),
                        Err(e) => eprintln!("{} {}", "✗".red(), e),
                    },
                    "/reconnect" => match client.reconnect(&session_id).await {
                        Ok(_) => println!("{}", "Reconnected".green()),
                        Err(e) => eprintln!("{} {}", "✗".red(), e),
                    },
                    text => {
                        if let Err(e) = client.send_message(&session_id, text).await {
                            eprintln!("{} {}", "✗".red(), e);
                        }
                    }
                }
            }
            event = events.recv() => match event {
                Ok(ClientEvent::TimelineUpdated { .. }) => {
                    print_new(&client, &session_id, &mut printed).await;
                }
                Ok(ClientEvent::PhaseChanged { phase, .. }) => {
                    println!("{} {}", "Session".bold(), phase);
                }
                Ok(ClientEvent::SendFailed { reason, .. }) => {
                    eprintln!("{} not delivered: {}", "✗".red(), reason);
                }
                Ok(ClientEvent::Notice { message, .. }) => {
                    println!("{}", message.yellow());
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    info!("Skipped {} events", n);
                    print_new(&client, &session_id, &mut printed).await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    client.logout().await;
    Ok(())
}

/// Print confirmed or pending entries not shown yet
async fn print_new(client: &NegotiationClient, session_id: &SessionId, printed: &mut HashSet<MessageKey>) {
    let Ok(entries) = client.timeline(session_id).await else {
        return;
    };
    for entry in entries {
        let key = entry.message.key();
        if entry.delivery == Delivery::Failed || !printed.insert(key) {
            continue;
        }
        let marker = match entry.delivery {
            Delivery::Optimistic => "…".dimmed(),
            _ => "✓".green(),
        };
        println!(
            "{} {} {}: {}",
            entry.message.sent_at.format("%H:%M").to_string().dimmed(),
            marker,
            entry.message.sender.cyan(),
            entry.message.content
        );
    }
}

fn print_usage() {
    println!("SwapChat");
    println!();
    println!("Usage: swapchat {} <session_id>", FLAG_USAGE);
    println!();
    println!("In chat:");
    println!("  <text>        Send a message");
    println!("  /complete     Confirm the exchange (receiver only)");
    println!("  /reconnect    Re-open a dropped chat");
    println!("  /quit         Leave");
}
