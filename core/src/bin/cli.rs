/// CLI for one-shot negotiation commands
use colored::Colorize;
use swapchat_core::negotiation_types::{
    ItemId, ItemRef, NegotiationRequest, RequestId, RequestStatus, SessionId, UserId,
};
use swapchat_core::config::FLAG_USAGE;
use swapchat_core::{Config, NegotiationClient};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config, args) =
        Config::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    if args.is_empty() {
        print_usage();
        return Ok(());
    }

    let client = NegotiationClient::new(&config)?;
    let command = &args[0];

    match command.as_str() {
        "requests" => {
            let inbox = client.refresh_inbox().await?;
            println!("{}", "Received".bold());
            for request in &inbox.received {
                print_request(request);
            }
            println!("{}", "Sent".bold());
            for request in &inbox.sent {
                print_request(request);
            }
        }
        "request" => {
            if args.len() < 3 {
                eprintln!("Usage: swapchat-cli request <owner_id> <book_id> [message]");
                return Ok(());
            }
            let item = ItemRef {
                id: ItemId::new(args[2].as_str()),
                title: String::new(),
                author: String::new(),
            };
            let message = args[3..].join(" ");
            let created = client
                .create_request(&UserId::new(args[1].as_str()), &item, &message)
                .await?;
            println!("{} request {} sent", "✓".green(), created.id);
        }
        "accept" | "reject" => {
            if args.len() < 2 {
                eprintln!("Usage: swapchat-cli {} <request_id>", command);
                return Ok(());
            }
            client.refresh_inbox().await?;
            let updated = client
                .respond_to_request(&RequestId::new(args[1].as_str()), command == "accept")
                .await?;
            println!("{} request {} {}", "✓".green(), updated.id, updated.status);
            if let Some(chat) = &updated.session_id {
                println!("  chat: {}", chat);
            }
            client.logout().await;
        }
        "complete" => {
            if args.len() < 2 {
                eprintln!("Usage: swapchat-cli complete <session_id>");
                return Ok(());
            }
            let session_id = SessionId::new(args[1].as_str());
            if let Err(e) = client.open_session(&session_id).await {
                // Completion only needs the bootstrap, not a live channel
                if client.session_state(&session_id).await.is_err() {
                    return Err(e.into());
                }
            }
            let phase = client.request_completion(&session_id).await;
            client.logout().await;
            println!("{} session {}", "✓".green(), phase?);
        }
        "history" => {
            let user = args.get(1).map(|u| UserId::new(u.as_str()));
            let records = client.exchange_history(user.as_ref()).await?;
            if records.is_empty() {
                println!("No exchanges yet");
            }
            for record in records {
                let rating = record
                    .rating
                    .map(|r| format!("{}★", r))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  {}  {} → {}  {}  {}",
                    record.date.format("%Y-%m-%d"),
                    record.item.bold(),
                    record.requester,
                    record.recipient,
                    record.status,
                    rating
                );
            }
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
        }
    }

    Ok(())
}

fn print_request(request: &NegotiationRequest) {
    let status = match request.status {
        RequestStatus::Pending => request.status.to_string().yellow(),
        RequestStatus::Accepted => request.status.to_string().green(),
        RequestStatus::Rejected => request.status.to_string().red(),
    };
    println!(
        "  [{}] {} {} → {}  {}",
        request.id,
        request.item.title,
        request.requester.username,
        request.recipient.username,
        status
    );
}

fn print_usage() {
    println!("SwapChat CLI");
    println!();
    println!("Usage: swapchat-cli {} <command> [args]", FLAG_USAGE);
    println!();
    println!("Commands:");
    println!("  requests                          List sent and received requests");
    println!("  request <owner_id> <book_id> [m]  Propose an exchange");
    println!("  accept <request_id>               Accept a received request");
    println!("  reject <request_id>               Reject a received request");
    println!("  complete <session_id>             Confirm the book arrived");
    println!("  history [user_id]                 Show exchange history");
}
