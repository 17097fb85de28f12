//! HTTP status API and console commands for the meshsync binary.

use anyhow::{bail, Context, Result};
use axum::{extract::State, response::Json, routing::get, Router};
use meshsync_node::{EventMessage, LinkInfo, MeshNode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LinkStatus {
    pub remote: String,
    pub role: String,
    pub state: String,
}

impl From<LinkInfo> for LinkStatus {
    fn from(info: LinkInfo) -> Self {
        Self {
            remote: info.remote.to_string(),
            role: info.role.to_string(),
            state: info.state.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EventStatus {
    pub sender: String,
    pub time: u64,
    pub event_type: String,
    pub payload: String,
}

impl From<EventMessage> for EventStatus {
    fn from(event: EventMessage) -> Self {
        Self {
            sender: event.sender.to_string(),
            time: event.time.as_millis(),
            event_type: event.event_type,
            payload: event.payload,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StatusResponse {
    pub identity: Option<String>,
    pub open: bool,
    pub links: Vec<LinkStatus>,
    pub vars: BTreeMap<String, String>,
    pub last_event: Option<EventStatus>,
}

impl StatusResponse {
    /// Snapshots the node's current state.
    pub async fn collect(node: &MeshNode) -> Self {
        Self {
            identity: node.my_identity().await.map(|id| id.to_string()),
            open: node.is_open().await,
            links: node.links().await.into_iter().map(LinkStatus::from).collect(),
            vars: node.vars().await.into_iter().collect(),
            last_event: node.last_event().await.map(EventStatus::from),
        }
    }
}

async fn status_handler(State(node): State<MeshNode>) -> Json<StatusResponse> {
    Json(StatusResponse::collect(&node).await)
}

/// Build the HTTP API router for the given node.
pub fn build_router(node: MeshNode) -> Router {
    Router::new()
        .route("/api/v1/status", get(status_handler))
        .with_state(node)
}

/// Parses a `NAME=ADDR` peer directory entry.
pub fn parse_peer(s: &str) -> Result<(String, SocketAddr)> {
    let (name, addr) = s
        .split_once('=')
        .with_context(|| format!("expected NAME=ADDR, got {s:?}"))?;
    if name.is_empty() {
        bail!("peer name must not be empty");
    }
    let addr = addr
        .parse()
        .with_context(|| format!("invalid socket address {addr:?}"))?;
    Ok((name.to_string(), addr))
}

/// A console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: String, value: String },
    Get { key: String },
    Emit { event_type: String, payload: String },
    Connect { remote: String },
    Disconnect { remote: String },
    Links,
    Vars,
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  set <key> <value>      set a shared variable
  get <key>              read a shared variable
  emit <type> [payload]  broadcast an event
  connect <peer>         link to a peer
  disconnect <peer>      drop the link to a peer
  links                  list open links
  vars                   list shared variables
  status                 print node status as JSON
  help                   show this text
  quit                   stop the node";

/// Parses one console line. Values and payloads take the rest of the line.
pub fn parse_command(line: &str) -> Result<Command> {
    let line = line.trim();
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();

    let command = match word {
        "set" => {
            let (key, value) = rest
                .split_once(char::is_whitespace)
                .map(|(k, v)| (k, v.trim()))
                .unwrap_or((rest, ""));
            if key.is_empty() {
                bail!("usage: set <key> <value>");
            }
            Command::Set {
                key: key.to_string(),
                value: value.to_string(),
            }
        }
        "get" => Command::Get {
            key: single_arg(rest, "get <key>")?,
        },
        "emit" => {
            let (event_type, payload) = rest
                .split_once(char::is_whitespace)
                .map(|(t, p)| (t, p.trim()))
                .unwrap_or((rest, ""));
            if event_type.is_empty() {
                bail!("usage: emit <type> [payload]");
            }
            Command::Emit {
                event_type: event_type.to_string(),
                payload: payload.to_string(),
            }
        }
        "connect" => Command::Connect {
            remote: single_arg(rest, "connect <peer>")?,
        },
        "disconnect" => Command::Disconnect {
            remote: single_arg(rest, "disconnect <peer>")?,
        },
        "links" => Command::Links,
        "vars" => Command::Vars,
        "status" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        "" => bail!("empty command"),
        other => bail!("unknown command {other:?}, try help"),
    };
    Ok(command)
}

fn single_arg(rest: &str, usage: &str) -> Result<String> {
    if rest.is_empty() {
        bail!("usage: {usage}");
    }
    Ok(rest.to_string())
}

/// Runs a command against the node and renders its output.
pub async fn execute(node: &MeshNode, command: Command) -> Result<String> {
    let output = match command {
        Command::Set { key, value } => {
            node.set_var(&key, &value).await?;
            String::new()
        }
        Command::Get { key } => match node.get_var(&key).await {
            Some(value) => value,
            None => format!("{key} is not set"),
        },
        Command::Emit {
            event_type,
            payload,
        } => {
            let event = node.dispatch_event(&event_type, &payload).await?;
            format!("sent {} at {}", event.event_type, event.time)
        }
        Command::Connect { remote } => {
            let link = node.connect(&remote).await?;
            format!("linked to {} as {}", link.remote, link.role)
        }
        Command::Disconnect { remote } => {
            node.disconnect(&remote).await?;
            String::new()
        }
        Command::Links => node
            .links()
            .await
            .iter()
            .enumerate()
            .map(|(i, link)| format!("{i}: {} ({}, {})", link.remote, link.role, link.state))
            .collect::<Vec<_>>()
            .join("\n"),
        Command::Vars => node
            .vars()
            .await
            .into_iter()
            .map(|(key, value)| format!("{key} = {value}"))
            .collect::<Vec<_>>()
            .join("\n"),
        Command::Status => serde_json::to_string_pretty(&StatusResponse::collect(node).await)?,
        Command::Help => HELP.to_string(),
        Command::Quit => String::new(),
    };
    Ok(output)
}
