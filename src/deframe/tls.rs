//! TLS record deframing with key-log assisted decryption
//!
//! Ciphertext is cut into TLS records. The ClientHello random identifies the
//! session in an NSS key-log file (`SSLKEYLOGFILE` format). When secrets are
//! known and a [`TlsRecordDecryptor`] is installed, application-data records
//! are decrypted and the plaintext is deframed with the HTTP rules. Otherwise
//! each application-data record becomes an error message that names the
//! key-log entry it would need.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use tracing::{debug, warn};

use super::http::HttpDeframer;
use super::{DeframeContext, DeframeOutput, Frame};
use crate::error::{FlowError, FramingError};
use crate::message::MessageKind;
use crate::stream::{Segment, StreamView};
use crate::types::Direction;

const RECORD_HEADER_LEN: usize = 5;

/// TLS content types
pub mod content_type {
    pub const CHANGE_CIPHER_SPEC: u8 = 20;
    pub const ALERT: u8 = 21;
    pub const HANDSHAKE: u8 = 22;
    pub const APPLICATION_DATA: u8 = 23;
    pub const HEARTBEAT: u8 = 24;
}

const HANDSHAKE_CLIENT_HELLO: u8 = 1;

/// Secrets recorded for one TLS session, by key-log label
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSecrets {
    secrets: Vec<(String, Vec<u8>)>,
}

impl SessionSecrets {
    pub fn get(&self, label: &str) -> Option<&[u8]> {
        self.secrets
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, s)| s.as_slice())
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.secrets.iter().map(|(l, _)| l.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    fn insert(&mut self, label: String, secret: Vec<u8>) {
        match self.secrets.iter_mut().find(|(l, _)| *l == label) {
            Some(entry) => entry.1 = secret,
            None => self.secrets.push((label, secret)),
        }
    }
}

/// Source of per-session key material
pub trait KeyLogProvider: Send + Sync {
    fn lookup(&self, client_random: &[u8; 32]) -> Option<SessionSecrets>;
}

/// Parsed NSS key-log file
#[derive(Debug, Clone, Default)]
pub struct KeyLog {
    sessions: HashMap<[u8; 32], SessionSecrets>,
    skipped_lines: usize,
}

impl KeyLog {
    /// Parse key-log text. Comments and blank lines are ignored; lines that
    /// do not parse are counted and skipped.
    pub fn parse(text: &str) -> Self {
        let mut log = KeyLog::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(line) {
                Some((label, random, secret)) => {
                    log.sessions
                        .entry(random)
                        .or_default()
                        .insert(label.to_string(), secret);
                }
                None => log.skipped_lines += 1,
            }
        }
        log
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read key log {}", path.display()))?;
        let log = Self::parse(&text);
        if log.skipped_lines > 0 {
            warn!(
                "Skipped {} malformed lines in key log {}",
                log.skipped_lines,
                path.display()
            );
        }
        debug!("Loaded {} TLS sessions from {}", log.len(), path.display());
        Ok(log)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }
}

impl KeyLogProvider for KeyLog {
    fn lookup(&self, client_random: &[u8; 32]) -> Option<SessionSecrets> {
        self.sessions.get(client_random).cloned()
    }
}

fn parse_line(line: &str) -> Option<(&str, [u8; 32], Vec<u8>)> {
    let mut parts = line.split_whitespace();
    let label = parts.next()?;
    let random = hex::decode(parts.next()?).ok()?;
    let secret = hex::decode(parts.next()?).ok()?;
    if parts.next().is_some() || secret.is_empty() {
        return None;
    }
    let random: [u8; 32] = random.try_into().ok()?;
    Some((label, random, secret))
}

/// Extract the client random from a handshake record carrying a ClientHello
pub fn client_random(fragment: &[u8]) -> Option<[u8; 32]> {
    // type(1) length(3) version(2) random(32)
    if fragment.first() != Some(&HANDSHAKE_CLIENT_HELLO) || fragment.len() < 38 {
        return None;
    }
    fragment[6..38].try_into().ok()
}

/// One TLS record handed to a decryptor
#[derive(Debug, Clone, Copy)]
pub struct TlsRecord<'a> {
    pub content_type: u8,
    pub version: u16,
    pub fragment: &'a [u8],
    /// Application-data records seen before this one in the same direction
    pub sequence: u64,
    pub from_client: bool,
}

/// Record-layer decryption, keyed by session secrets
pub trait TlsRecordDecryptor: Send + Sync {
    /// Plaintext of the record; may be empty for non-application content
    fn decrypt(&self, secrets: &SessionSecrets, record: &TlsRecord<'_>) -> Result<Vec<u8>, String>;
}

/// TLS state shared by both directions of one flow
#[derive(Debug, Clone, Default)]
pub struct TlsSession {
    pub client_random: Option<[u8; 32]>,
    pub client_direction: Option<Direction>,
    /// Missing key material was already reported for this flow
    pub reported_missing: bool,
}

impl TlsSession {
    pub fn expected_key(&self) -> Option<String> {
        self.client_random.map(hex::encode)
    }
}

#[derive(Debug, Default)]
pub struct HttpsDeframer {
    record_cursor: usize,
    app_records: u64,
    plaintext: Vec<u8>,
    plain_segments: Vec<Segment>,
    http: HttpDeframer,
    frozen: Option<FramingError>,
}

impl HttpsDeframer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor(&self) -> usize {
        self.record_cursor
    }

    pub fn frozen(&self) -> Option<&FramingError> {
        self.frozen.as_ref()
    }

    /// Decrypted bytes accumulated so far
    pub fn plaintext(&self) -> &[u8] {
        &self.plaintext
    }

    pub fn deframe(&mut self, view: StreamView<'_>, ctx: &mut DeframeContext<'_>) -> DeframeOutput {
        let mut out = DeframeOutput::default();
        let bytes = view.bytes;

        while self.frozen.is_none() {
            if ctx.cancel.is_cancelled() {
                return out;
            }
            let rest = &bytes[self.record_cursor..];
            if rest.len() < RECORD_HEADER_LEN {
                break;
            }

            let ct = rest[0];
            if !(content_type::CHANGE_CIPHER_SPEC..=content_type::HEARTBEAT).contains(&ct) {
                let err = FramingError::NotTls {
                    offset: self.record_cursor,
                    content_type: ct,
                };
                debug!("Freezing {} TLS deframing: {}", ctx.direction, err);
                out.error = Some(FlowError::Framing(err.clone()));
                self.frozen = Some(err);
                break;
            }

            let version = u16::from_be_bytes([rest[1], rest[2]]);
            let len = usize::from(u16::from_be_bytes([rest[3], rest[4]]));
            let record_len = RECORD_HEADER_LEN + len;
            if rest.len() < record_len {
                break;
            }

            let start = self.record_cursor;
            let end = start + record_len;
            let fragment = &rest[RECORD_HEADER_LEN..record_len];

            match ct {
                content_type::HANDSHAKE => {
                    if ctx.tls.client_random.is_none() {
                        if let Some(random) = client_random(fragment) {
                            debug!("ClientHello seen, client random {}", hex::encode(random));
                            ctx.tls.client_random = Some(random);
                            ctx.tls.client_direction = Some(ctx.direction);
                        }
                    }
                }
                content_type::APPLICATION_DATA => {
                    let record = TlsRecord {
                        content_type: ct,
                        version,
                        fragment,
                        sequence: self.app_records,
                        from_client: ctx.tls.client_direction == Some(ctx.direction),
                    };
                    self.app_records += 1;
                    self.application_data(view, start..end, &record, ctx, &mut out);
                }
                _ => {}
            }

            self.record_cursor = end;
        }

        // Truncated record left when the flow closed
        if ctx.final_pass
            && self.frozen.is_none()
            && !ctx.cancel.is_cancelled()
            && self.record_cursor < bytes.len()
        {
            let start = self.record_cursor;
            debug!(
                "{} TLS stream closed inside a record at offset {}",
                ctx.direction, start
            );
            out.frames
                .extend(Frame::cut(view, start..bytes.len(), MessageKind::Partial));
            self.record_cursor = bytes.len();
        }

        let plain_view = StreamView::new(&self.plaintext, &self.plain_segments);
        let http = self.http.deframe(plain_view, ctx);
        out.frames.extend(http.frames);
        out
    }

    fn application_data(
        &mut self,
        view: StreamView<'_>,
        range: std::ops::Range<usize>,
        record: &TlsRecord<'_>,
        ctx: &mut DeframeContext<'_>,
        out: &mut DeframeOutput,
    ) {
        let Some(completing) = range.end.checked_sub(1).and_then(|last| view.segment_at(last)) else {
            return;
        };

        let result = match ctx.tls.client_random {
            None => Err("client random not observed".to_string()),
            Some(random) => match ctx.key_log.and_then(|kl| kl.lookup(&random)) {
                None => Err("no key log entry for session".to_string()),
                Some(secrets) => match ctx.decryptor {
                    None => Err("no record decryptor installed".to_string()),
                    Some(decryptor) => decryptor.decrypt(&secrets, record),
                },
            },
        };

        match result {
            Ok(plain) => {
                if !plain.is_empty() {
                    self.plain_segments.push(Segment {
                        offset: self.plaintext.len(),
                        len: plain.len(),
                        timestamp: completing.timestamp,
                        packet_index: completing.packet_index,
                    });
                    self.plaintext.extend_from_slice(&plain);
                }
            }
            Err(reason) => {
                let expected_key = ctx.tls.expected_key();
                if !ctx.tls.reported_missing {
                    ctx.tls.reported_missing = true;
                    out.error = Some(FlowError::DecryptionUnavailable {
                        expected_key: expected_key.clone(),
                        reason: reason.clone(),
                    });
                }
                let payload = error_text(&reason, expected_key.as_deref()).into_bytes();
                let kind = MessageKind::Error {
                    reason,
                    expected_key,
                };
                out.frames.extend(Frame::with_payload(view, range, payload, kind));
            }
        }
    }
}

fn error_text(reason: &str, expected_key: Option<&str>) -> String {
    match expected_key {
        Some(key) => format!("cannot decrypt TLS record: {} (CLIENT_RANDOM {})", reason, key),
        None => format!("cannot decrypt TLS record: {}", reason),
    }
}
