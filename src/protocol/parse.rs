// src/protocol/parse.rs — IRC line parsing
//
// Twitch IRC lines look like:
//
//   @badge-info=;mod=1;bits=100 :nick!nick@nick.tmi.twitch.tv PRIVMSG #chan :hello
//
// Each inbound line is decoded once into a tagged variant; everything that is
// not a PING or a PRIVMSG is ignored.

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// One chat message, ready to append to the session's `chat.jsonl`.
/// Field names match the on-disk format the downstream pipeline reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEvent {
    /// Receipt time, RFC 3339 UTC with `Z` suffix.
    pub timestamp_utc: String,
    /// Channel login, lowercase, no leading '#'.
    pub channel: String,
    /// Sender login (prefix portion before '!').
    pub user: String,
    pub message: String,
    /// Per-message metadata tags (mod flag, badges, bits, ...). A bare key
    /// with no '=' maps to an empty string, never null.
    pub tags: BTreeMap<String, String>,
    /// The line as received, for downstream re-parsing.
    pub raw: String,
}

/// The decoded form of one inbound line.
#[derive(Debug, Clone)]
pub enum WireEvent {
    /// Keep-alive probe. Must be answered with `PONG :<payload>` before any
    /// other outbound line.
    Ping { payload: String },
    Chat(ChatEvent),
    /// Any other command, or a line with no command token.
    Ignored,
}

/// `a=b;c=d;flag` -> {"a": "b", "c": "d", "flag": ""}
pub fn parse_tags(tag_str: &str) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    for part in tag_str.split(';') {
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some((k, v)) => tags.insert(k.to_string(), v.to_string()),
            None => tags.insert(part.to_string(), String::new()),
        };
    }
    tags
}

pub fn parse_line(line: &str) -> WireEvent {
    let raw = line.trim_end_matches(['\r', '\n']);
    let mut rest = raw;

    let mut tags = BTreeMap::new();
    if let Some(stripped) = rest.strip_prefix('@') {
        match stripped.split_once(' ') {
            Some((tag_part, after)) => {
                tags = parse_tags(tag_part);
                rest = after;
            }
            None => return WireEvent::Ignored,
        }
    }

    let mut prefix = "";
    if let Some(stripped) = rest.strip_prefix(':') {
        match stripped.split_once(' ') {
            Some((p, after)) => {
                prefix = p;
                rest = after;
            }
            None => return WireEvent::Ignored,
        }
    }

    // Everything after " :" is the trailing message body.
    let (before, trailing) = match rest.split_once(" :") {
        Some((b, t)) => (b, t),
        None => (rest, ""),
    };

    let mut parts = before.split_whitespace();
    let cmd = match parts.next() {
        Some(c) => c,
        None => return WireEvent::Ignored,
    };
    let params: Vec<&str> = parts.collect();

    match cmd {
        "PING" => {
            let payload = if !trailing.is_empty() {
                trailing.to_string()
            } else {
                params.join(" ")
            };
            WireEvent::Ping { payload }
        }
        "PRIVMSG" => {
            let channel = params
                .first()
                .map(|c| c.trim_start_matches('#').to_lowercase())
                .unwrap_or_default();
            let user = prefix.split('!').next().unwrap_or("").to_string();

            WireEvent::Chat(ChatEvent {
                timestamp_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                channel,
                user,
                message: trailing.to_string(),
                tags,
                raw: raw.to_string(),
            })
        }
        _ => WireEvent::Ignored,
    }
}
