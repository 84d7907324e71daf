//! Message rendering
//!
//! Static table from [`MessageTag`] to a render function. Front ends look a
//! message up here instead of switching on its kind themselves.

use std::fmt::Write;

use crate::message::{DisplayEncoding, MessageKind, MessageTag, ReassembledMessage};

/// Bytes per hex dump line
pub const HEX_WIDTH: usize = 16;

/// Render function signature
pub type RenderFn = fn(&ReassembledMessage) -> String;

/// One registry entry
#[derive(Clone, Copy)]
pub struct Renderer {
    pub tag: MessageTag,
    pub name: &'static str,
    pub render: RenderFn,
}

static RENDERERS: &[Renderer] = &[
    Renderer {
        tag: MessageTag::Data,
        name: "data",
        render: render_payload,
    },
    Renderer {
        tag: MessageTag::Http,
        name: "http",
        render: render_http,
    },
    Renderer {
        tag: MessageTag::Fallback,
        name: "fallback",
        render: render_payload,
    },
    Renderer {
        tag: MessageTag::Partial,
        name: "partial",
        render: render_payload,
    },
    Renderer {
        tag: MessageTag::Framed,
        name: "framed",
        render: render_framed,
    },
    Renderer {
        tag: MessageTag::Error,
        name: "error",
        render: render_error,
    },
];

/// Lookup table over the static renderers
#[derive(Clone, Copy)]
pub struct RendererRegistry {
    renderers: &'static [Renderer],
}

impl Default for RendererRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RendererRegistry {
    pub fn new() -> Self {
        Self {
            renderers: RENDERERS,
        }
    }

    pub fn get(&self, tag: MessageTag) -> Option<&'static Renderer> {
        self.renderers.iter().find(|r| r.tag == tag)
    }

    pub fn render(&self, message: &ReassembledMessage) -> String {
        match self.get(message.kind.tag()) {
            Some(renderer) => (renderer.render)(message),
            None => hex_dump(&message.payload),
        }
    }

    pub fn renderers(&self) -> &'static [Renderer] {
        self.renderers
    }
}

/// Classic offset / hex / ASCII dump
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4 + 16);
    for (line, chunk) in bytes.chunks(HEX_WIDTH).enumerate() {
        let _ = write!(out, "{:08x}  ", line * HEX_WIDTH);
        for i in 0..HEX_WIDTH {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, "{:02x} ", b);
                }
                None => out.push_str("   "),
            }
            if i == 7 {
                out.push(' ');
            }
        }
        out.push(' ');
        out.extend(chunk.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push('\n');
    }
    out
}

fn render_payload(message: &ReassembledMessage) -> String {
    match message.encoding {
        DisplayEncoding::Hex => hex_dump(&message.payload),
        _ => message.text(),
    }
}

/// Start line, header count and body size
fn render_http(message: &ReassembledMessage) -> String {
    let text = message.text();
    let head_end = text
        .find("\r\n\r\n")
        .map(|i| (i, i + 4))
        .or_else(|| text.find("\n\n").map(|i| (i, i + 2)));
    let (head, body_len) = match head_end {
        Some((end, body_start)) => (&text[..end], message.payload.len().saturating_sub(body_start)),
        None => (text.as_str(), 0),
    };

    let mut lines = head.lines();
    let start_line = lines.next().unwrap_or("").trim_end();
    let headers = lines.filter(|l| !l.trim().is_empty()).count();

    let mut out = format!("{}\n  {} headers", start_line, headers);
    if body_len > 0 {
        let _ = write!(out, ", {} byte body", body_len);
    }
    out
}

fn render_framed(message: &ReassembledMessage) -> String {
    let body = render_payload(message);
    match message.kind {
        MessageKind::Framed {
            type_tag: Some(tag),
        } => format!("[type {:#x}] {} bytes\n{}", tag, message.len(), body),
        _ => format!("{} bytes\n{}", message.len(), body),
    }
}

fn render_error(message: &ReassembledMessage) -> String {
    match &message.kind {
        MessageKind::Error {
            reason,
            expected_key: Some(key),
        } => format!("error: {}\n  expected key: {}", reason, key),
        MessageKind::Error { reason, .. } => format!("error: {}", reason),
        _ => message.text(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowKey;
    use crate::types::Direction;
    use chrono::Utc;
    use std::time::Duration;

    fn message(kind: MessageKind, payload: &[u8]) -> ReassembledMessage {
        let flow = FlowKey::new(
            "10.0.0.1:1000".parse::<std::net::SocketAddr>().unwrap().into(),
            "10.0.0.2:80".parse::<std::net::SocketAddr>().unwrap().into(),
        )
        .unwrap();
        ReassembledMessage {
            flow,
            flow_id: 1,
            direction: Direction::Outgoing,
            index: 0,
            range: 0..payload.len(),
            payload: payload.to_vec(),
            encoding: DisplayEncoding::derive(&kind, payload),
            kind,
            timestamp: Utc::now(),
            interval: Duration::ZERO,
        }
    }

    #[test]
    fn test_every_tag_registered() {
        let registry = RendererRegistry::new();
        for tag in [
            MessageTag::Data,
            MessageTag::Http,
            MessageTag::Fallback,
            MessageTag::Partial,
            MessageTag::Framed,
            MessageTag::Error,
        ] {
            assert!(registry.get(tag).is_some(), "{:?}", tag);
        }
        assert_eq!(registry.renderers().len(), 6);
    }

    #[test]
    fn test_hex_dump_layout() {
        let dump = hex_dump(&(0u8..20).collect::<Vec<_>>());
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00000000  00 01 02 03 04 05 06 07  08 09"));
        assert!(lines[1].starts_with("00000010  10 11 12 13"));
        assert!(lines[1].ends_with("...."));
    }

    #[test]
    fn test_binary_data_rendered_as_hex() {
        let registry = RendererRegistry::new();
        let out = registry.render(&message(MessageKind::Data, &[0, 1, 2, 0xff]));
        assert!(out.starts_with("00000000  00 01 02 ff"));

        let out = registry.render(&message(MessageKind::Data, b"hello"));
        assert_eq!(out, "hello");
    }

    #[test]
    fn test_http_summary() {
        let registry = RendererRegistry::new();
        let out = registry.render(&message(
            MessageKind::HttpResponse,
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nServer: x\r\n\r\nhello",
        ));
        assert_eq!(out, "HTTP/1.1 200 OK\n  2 headers, 5 byte body");
    }

    #[test]
    fn test_framed_shows_type() {
        let registry = RendererRegistry::new();
        let out = registry.render(&message(MessageKind::Framed { type_tag: Some(7) }, b"ABC"));
        assert!(out.starts_with("[type 0x7] 3 bytes\n"));
        assert!(out.ends_with("ABC"));
    }

    #[test]
    fn test_error_names_expected_key() {
        let registry = RendererRegistry::new();
        let kind = MessageKind::Error {
            reason: "no key material".into(),
            expected_key: Some("abcd".into()),
        };
        let out = registry.render(&message(kind, b"no key material"));
        assert_eq!(out, "error: no key material\n  expected key: abcd");
    }
}
