//! Minimal socket.io (engine.io v4) wire handling: just enough to hold a
//! read-only session. Packet grammar: a leading engine.io type digit,
//! then for message packets a socket.io type digit, then the body.

use anyhow::{anyhow, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum PacketKind {
    /// `0{...}` engine.io open, carries `sid` and ping settings.
    Open(serde_json::Value),
    /// `2` engine.io ping; must be answered with `3`.
    Ping,
    /// `40{...}` namespace connect ack.
    ConnectAck(serde_json::Value),
    /// `41` namespace disconnect.
    Disconnect,
    /// `42["event", payload]` application event.
    Event {
        name: String,
        payload: serde_json::Value,
    },
    Other,
}

pub fn parse_packet(text: &str) -> PacketKind {
    let Some(first) = text.chars().next() else {
        return PacketKind::Other;
    };
    match first {
        '0' => PacketKind::Open(
            serde_json::from_str(&text[1..]).unwrap_or(serde_json::Value::Null),
        ),
        '2' if text.len() == 1 => PacketKind::Ping,
        '4' => parse_message(&text[1..]),
        _ => PacketKind::Other,
    }
}

fn parse_message(body: &str) -> PacketKind {
    let Some(kind) = body.chars().next() else {
        return PacketKind::Other;
    };
    match kind {
        '0' => PacketKind::ConnectAck(
            serde_json::from_str(&body[1..]).unwrap_or(serde_json::Value::Null),
        ),
        '1' => PacketKind::Disconnect,
        '2' => parse_event(&body[1..]),
        _ => PacketKind::Other,
    }
}

fn parse_event(body: &str) -> PacketKind {
    // An optional ack id (digits) may precede the array.
    let start = body.find('[').unwrap_or(0);
    let Ok(serde_json::Value::Array(items)) =
        serde_json::from_str::<serde_json::Value>(&body[start..])
    else {
        return PacketKind::Other;
    };
    let Some(name) = items.first().and_then(|v| v.as_str()) else {
        return PacketKind::Other;
    };
    PacketKind::Event {
        name: name.to_string(),
        payload: items.get(1).cloned().unwrap_or(serde_json::Value::Null),
    }
}

/// Builds the websocket endpoint from the configured upstream URL,
/// preserving its query string (the feed requires `frontend-version`).
pub fn socket_io_ws_url(upstream: &str) -> Result<String> {
    let (base, query) = match upstream.split_once('?') {
        Some((b, q)) => (b, Some(q)),
        None => (upstream, None),
    };

    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("wss://") || base.starts_with("ws://") {
        base.to_string()
    } else {
        return Err(anyhow!("unsupported upstream url: {upstream}"));
    };

    let ws_base = ws_base.trim_end_matches('/');
    let mut url = format!("{ws_base}/socket.io/?EIO=4&transport=websocket");
    if let Some(query) = query {
        if !query.is_empty() {
            url.push('&');
            url.push_str(query);
        }
    }
    Ok(url)
}
