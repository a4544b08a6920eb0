//! Line-oriented presentation layer for the CLI commands.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Local, Utc};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;

use crate::api::{ChatApi, HttpChatApi};
use crate::config::{Config, UserConfig};
use crate::models::{Message, MessageId, MessageStatus, Role};
use crate::sync::{Effect, SyncCommand, SyncEngine, SyncHandle, SyncUpdate};
use crate::transport::session;
use crate::transport::websocket::WsConnector;

/// Store the session token and local identity
pub async fn login(token: &str, user_id: &str, name: Option<&str>, role: &str) -> Result<()> {
    let role = Role::parse(role);
    if role == Role::Unknown {
        bail!("Unknown role. Use patient, pharmacy, doctor or customer-care.");
    }
    let mut config = Config::load()?;
    config.session_token = Some(token.to_string());
    config.user = Some(UserConfig {
        id: user_id.to_string(),
        display_name: name.unwrap_or(user_id).to_string(),
        role,
    });
    config.save()?;
    println!("Logged in as {} ({}).", user_id, role);
    Ok(())
}

/// Clear stored credentials
pub async fn logout() -> Result<()> {
    let mut config = Config::load()?;
    config.clear_credentials();
    config.save()?;
    println!("Logged out.");
    Ok(())
}

/// Display configuration and identity
pub async fn status() -> Result<()> {
    let config = Config::load()?;

    println!("Config:      {}", Config::config_path()?.display());
    println!("API:         {}", config.api_url);
    println!("Socket:      {}", config.socket_url);
    match &config.session_token {
        Some(_) => println!("Token:       present"),
        None => println!("Token:       none"),
    }
    match &config.user {
        Some(user) => println!("User:        {} ({}, {})", user.display_name, user.id, user.role),
        None => println!("User:        none"),
    }
    println!(
        "Retry:       {} attempts, {}ms..{}ms",
        config.retry.max_attempts, config.retry.initial_delay_ms, config.retry.max_delay_ms
    );
    println!("Send timeout: {}s", config.send_timeout_secs);
    Ok(())
}

fn api(config: &Config) -> Result<HttpChatApi> {
    Ok(HttpChatApi::new(config.api_url()?, config.token()?))
}

/// Engine with `peer` activated, plus the generation and request id of the
/// history fetch it asked for.
fn engine_for(
    config: &Config,
    peer: &str,
    scope: Option<&str>,
) -> Result<(SyncEngine, (u64, u64))> {
    let me = config.identity()?;
    let mut engine = SyncEngine::new(me.clone(), config.send_timeout());
    engine.activate_conversation(&[me.id.as_str(), peer], scope)?;
    let fetch = engine
        .take_effects()
        .into_iter()
        .find_map(|effect| match effect {
            Effect::FetchHistory {
                generation,
                request,
                ..
            } => Some((generation, request)),
            _ => None,
        })
        .context("No history request for the conversation")?;
    Ok((engine, fetch))
}

/// Print a conversation's history in merged order
pub async fn history(peer: &str, scope: Option<&str>) -> Result<()> {
    let config = Config::load()?;
    let api = api(&config)?;
    let (mut engine, (generation, request)) = engine_for(&config, peer, scope)?;
    let key = engine
        .active_key()
        .cloned()
        .context("Conversation was not activated")?;

    let result = api
        .fetch_history(&key)
        .await
        .map_err(|e| format!("{:#}", e));
    engine.on_history(&key, generation, request, result, Utc::now())?;

    if engine.messages().is_empty() {
        println!("(no messages)");
        return Ok(());
    }
    for msg in engine.messages() {
        println!("{}", format_message(msg));
    }
    Ok(())
}

/// Send a single message through the request/response API
pub async fn send(peer: &str, scope: Option<&str>, message: &str) -> Result<()> {
    let config = Config::load()?;
    let api = api(&config)?;
    let (mut engine, _) = engine_for(&config, peer, scope)?;

    engine.send_user_message(message)?;
    for effect in engine.take_effects() {
        if let Effect::SendFallback {
            key,
            generation,
            placeholder,
            outgoing,
        } = effect
        {
            let result = api
                .send_message(&key, &outgoing)
                .await
                .map_err(|e| format!("{:#}", e));
            engine.on_send_result(&key, generation, &placeholder, result, Utc::now())?;
        }
    }

    if let Some(failure) = engine.take_failures().into_iter().next() {
        return Err(failure.error).context("Message not sent");
    }
    println!("Message sent.");
    Ok(())
}

/// `peer` or `peer:scope`
fn parse_track(spec: &str) -> (String, Option<String>) {
    match spec.split_once(':') {
        Some((peer, scope)) => (peer.to_string(), Some(scope.to_string())),
        None => (spec.to_string(), None),
    }
}

/// Interactive chat driven by the sync engine
pub async fn chat(peer: &str, scope: Option<&str>, track: &[String]) -> Result<()> {
    let config = Config::load()?;
    let me = config.identity()?;
    let api = Arc::new(api(&config)?);
    let connector = Arc::new(WsConnector::new(config.socket_url()?));
    let (session, session_rx, session_task) = session::spawn(connector, config.session_config()?);

    let engine = SyncEngine::new(me.clone(), config.send_timeout());
    let mut sync = SyncHandle::start(engine, api, session, session_rx);
    sync.send(SyncCommand::Activate {
        participants: vec![me.id.clone(), peer.to_string()],
        scope: scope.map(String::from),
    });
    for spec in track {
        let (peer, scope) = parse_track(spec);
        sync.send(SyncCommand::Track {
            participants: vec![me.id.clone(), peer],
            scope,
        });
    }

    println!(
        "Chatting with {}. Commands: /quit, /retry, /reconnect (Ctrl-C to stop)",
        peer
    );

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let mut last_failed: Option<MessageId> = None;

    loop {
        tokio::select! {
            line = lines.next() => {
                match line {
                    Some(Ok(line)) => match line.trim() {
                        "" => {}
                        "/quit" => break,
                        "/reconnect" => sync.send(SyncCommand::Reconnect),
                        "/retry" => match last_failed.take() {
                            Some(id) => sync.send(SyncCommand::Retry(id)),
                            None => println!("Nothing to retry."),
                        },
                        body => sync.send(SyncCommand::Send(body.to_string())),
                    },
                    Some(Err(e)) => return Err(e).context("Failed to read stdin"),
                    None => break,
                }
            }
            update = sync.recv() => {
                match update {
                    Some(SyncUpdate::Closed) | None => break,
                    Some(update) => render(update, &mut last_failed),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
        }
    }

    sync.close().await;
    if let Err(e) = session_task.await {
        tracing::warn!("Session task failed: {}", e);
    }
    Ok(())
}

fn render(update: SyncUpdate, last_failed: &mut Option<MessageId>) {
    match update {
        SyncUpdate::Messages { key, messages } => {
            println!("--- {} ---", key);
            for msg in &messages {
                println!("{}", format_message(msg));
            }
        }
        SyncUpdate::Presence(presence) => println!("[{}]", presence.as_str()),
        SyncUpdate::Unread(counts) => {
            for (key, count) in counts.iter().filter(|(_, n)| *n > 0) {
                println!("[{} unread in {}]", count, key);
            }
        }
        SyncUpdate::SendFailed(failure) => {
            println!("!! {} -- /retry to resend \"{}\"", failure.error, failure.body);
            *last_failed = Some(failure.placeholder);
        }
        SyncUpdate::Error(e) => println!("!! {}", e),
        SyncUpdate::Closed => {}
    }
}

fn format_message(msg: &Message) -> String {
    let time = msg.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M");
    let marker = match msg.status {
        MessageStatus::Pending => " (sending)",
        MessageStatus::Failed => " (failed)",
        MessageStatus::Confirmed => "",
    };
    format!(
        "[{}] {}: {}{}",
        time, msg.sender.display_name, msg.body, marker
    )
}
