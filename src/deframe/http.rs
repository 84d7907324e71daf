//! HTTP/1.x message boundaries
//!
//! A message is a start line plus headers up to the first blank line, followed
//! by a body sized by `Content-Length` or chunked transfer coding. Messages
//! with neither end at the blank line. Bytes that do not start like an HTTP
//! message are emitted as [`MessageKind::Fallback`] up to the end of the
//! packet that carried them.

use std::collections::VecDeque;

use super::{DeframeContext, DeframeOutput, Frame};
use crate::message::MessageKind;
use crate::stream::StreamView;
use crate::types::Direction;

/// Request methods recognised at a message start
const METHODS: &[&[u8]] = &[
    b"GET ", b"POST ", b"PUT ", b"DELETE ", b"HEAD ", b"OPTIONS ", b"PATCH ", b"CONNECT ",
    b"TRACE ",
];

const RESPONSE_PREFIX: &[u8] = b"HTTP/";

/// Header blocks larger than this are not treated as HTTP
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Unanswered requests remembered per direction
const MAX_PENDING_REQUESTS: usize = 1024;

/// Requests awaiting a response, shared by both directions of a flow.
///
/// Only the method matters: a response to `HEAD` carries no body whatever
/// its `Content-Length` says.
#[derive(Debug, Clone, Default)]
pub struct HttpExchange {
    /// `true` for HEAD, indexed by the direction the request was sent in
    pending: [VecDeque<bool>; 2],
}

impl HttpExchange {
    fn request(&mut self, direction: Direction, head: bool) {
        let queue = &mut self.pending[direction.index()];
        if queue.len() >= MAX_PENDING_REQUESTS {
            queue.pop_front();
        }
        queue.push_back(head);
    }

    /// Next response sent in `direction` answers a HEAD request
    fn answers_head(&self, direction: Direction) -> bool {
        self.pending[direction.reverse().index()].front() == Some(&true)
    }

    fn response(&mut self, direction: Direction) {
        self.pending[direction.reverse().index()].pop_front();
    }

    /// Requests sent in `direction` still waiting for a response
    pub fn pending(&self, direction: Direction) -> usize {
        self.pending[direction.index()].len()
    }
}

/// Outcome of scanning for one message at the start of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HttpScan {
    /// `interim` marks a 1xx response, which does not answer the request
    Complete {
        len: usize,
        kind: StartLine,
        interim: bool,
    },
    Incomplete,
    NotHttp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartLine {
    Request,
    Response,
}

impl StartLine {
    fn kind(self) -> MessageKind {
        match self {
            StartLine::Request => MessageKind::HttpRequest,
            StartLine::Response => MessageKind::HttpResponse,
        }
    }
}

/// Check whether data could be the start of an HTTP request
pub fn is_http_request(data: &[u8]) -> bool {
    METHODS.iter().any(|m| data.starts_with(m))
}

/// Check whether data could be the start of an HTTP response
pub fn is_http_response(data: &[u8]) -> bool {
    data.starts_with(RESPONSE_PREFIX)
}

/// `None` while too few bytes are present to decide
fn start_line(data: &[u8]) -> Option<Option<StartLine>> {
    if is_http_request(data) {
        return Some(Some(StartLine::Request));
    }
    if is_http_response(data) {
        return Some(Some(StartLine::Response));
    }
    let undecided = METHODS
        .iter()
        .chain(std::iter::once(&RESPONSE_PREFIX))
        .any(|token| data.len() < token.len() && token.starts_with(data));
    if undecided {
        None
    } else {
        Some(None)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Length of the header block including its terminating blank line.
/// Stops at the first blank line and never looks past `MAX_HEADER_BYTES`.
fn header_end(data: &[u8]) -> Option<usize> {
    let window = &data[..data.len().min(MAX_HEADER_BYTES + 4)];
    window.iter().enumerate().find_map(|(i, b)| {
        if *b != b'\n' {
            return None;
        }
        match &window[i + 1..] {
            [b'\n', ..] => Some(i + 2),
            [b'\r', b'\n', ..] => Some(i + 3),
            _ => None,
        }
    })
}

#[derive(Debug, Default)]
struct BodyFraming {
    content_length: Option<usize>,
    chunked: bool,
    status: Option<u16>,
}

fn body_framing(head: &[u8], start: StartLine) -> BodyFraming {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.lines();
    let mut framing = BodyFraming::default();

    let first = lines.next();
    if start == StartLine::Response {
        framing.status = first
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|s| s.parse().ok());
    }

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            framing.content_length = value.parse().ok();
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            framing.chunked = value
                .split(',')
                .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
        }
    }
    framing
}

/// Length of a chunked body starting at `data[0]`, or `None` if incomplete.
/// A malformed chunk size ends the body where it was found.
fn chunked_body_len(data: &[u8]) -> Option<usize> {
    let mut pos = 0;
    loop {
        let line_len = find(&data[pos..], b"\r\n")?;
        let line = &data[pos..pos + line_len];
        let size_text = String::from_utf8_lossy(line);
        let size_text = size_text.split(';').next().unwrap_or("").trim();
        let Ok(size) = usize::from_str_radix(size_text, 16) else {
            return Some(pos);
        };
        pos += line_len + 2;

        if size == 0 {
            // Trailer section ends with an empty line
            loop {
                let trailer_len = find(&data[pos..], b"\r\n")?;
                pos += trailer_len + 2;
                if trailer_len == 0 {
                    return Some(pos);
                }
            }
        }

        let chunk_end = pos.checked_add(size)?.checked_add(2)?;
        if data.len() < chunk_end {
            return None;
        }
        pos = chunk_end;
    }
}

/// Scan one HTTP message at the start of `data`. A response answering a
/// HEAD request ends at its blank line.
pub(crate) fn scan_message(data: &[u8], answers_head: bool) -> HttpScan {
    let start = match start_line(data) {
        None => return HttpScan::Incomplete,
        Some(None) => return HttpScan::NotHttp,
        Some(Some(start)) => start,
    };

    let Some(head_len) = header_end(data) else {
        return if data.len() > MAX_HEADER_BYTES {
            HttpScan::NotHttp
        } else {
            HttpScan::Incomplete
        };
    };
    if head_len > MAX_HEADER_BYTES {
        return HttpScan::NotHttp;
    }

    let framing = body_framing(&data[..head_len], start);
    let interim = matches!(framing.status, Some(100..=199));
    let bodiless = interim
        || matches!(framing.status, Some(204) | Some(304))
        || (start == StartLine::Response && answers_head);

    let body_len = if bodiless {
        0
    } else if framing.chunked {
        match chunked_body_len(&data[head_len..]) {
            Some(len) => len,
            None => return HttpScan::Incomplete,
        }
    } else {
        framing.content_length.unwrap_or(0)
    };

    match head_len.checked_add(body_len) {
        Some(len) if len <= data.len() => HttpScan::Complete {
            len,
            kind: start,
            interim,
        },
        _ => HttpScan::Incomplete,
    }
}

#[derive(Debug, Default)]
pub struct HttpDeframer {
    cursor: usize,
}

impl HttpDeframer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn deframe(&mut self, view: StreamView<'_>, ctx: &mut DeframeContext<'_>) -> DeframeOutput {
        let mut out = DeframeOutput::default();
        let bytes = view.bytes;

        while self.cursor < bytes.len() {
            if ctx.cancel.is_cancelled() {
                break;
            }

            // Stray line breaks between pipelined messages
            let rest = &bytes[self.cursor..];
            let skip = rest.iter().take_while(|b| **b == b'\r' || **b == b'\n').count();
            if skip == rest.len() {
                // Nothing but line breaks so far; dropped once the flow closes
                if ctx.final_pass {
                    self.cursor = bytes.len();
                }
                break;
            }
            if skip > 0 {
                self.cursor += skip;
                continue;
            }

            let answers_head = ctx.exchange.answers_head(ctx.direction);
            let (end, kind) = match scan_message(rest, answers_head) {
                HttpScan::Complete { len, kind, interim } => {
                    match kind {
                        StartLine::Request => {
                            ctx.exchange.request(ctx.direction, rest.starts_with(b"HEAD "))
                        }
                        StartLine::Response if !interim => ctx.exchange.response(ctx.direction),
                        StartLine::Response => {}
                    }
                    (self.cursor + len, kind.kind())
                }
                HttpScan::Incomplete if ctx.final_pass => (bytes.len(), MessageKind::Partial),
                HttpScan::Incomplete => break,
                HttpScan::NotHttp => {
                    let end = view
                        .segment_at(self.cursor)
                        .map(|s| s.end())
                        .unwrap_or(bytes.len());
                    (end, MessageKind::Fallback)
                }
            };
            self.push(&mut out, view, end, kind);
        }

        out
    }

    fn push(&mut self, out: &mut DeframeOutput, view: StreamView<'_>, end: usize, kind: MessageKind) {
        out.frames.extend(Frame::cut(view, self.cursor..end, kind));
        self.cursor = end;
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{DeframeState, DeframerConfig};
    use super::*;

    fn http_state() -> DeframeState {
        DeframeState::new(&DeframerConfig::Http)
    }

    #[test]
    fn test_is_http_request() {
        assert!(is_http_request(b"GET / HTTP/1.1\r\n"));
        assert!(is_http_request(b"POST /api HTTP/1.1\r\n"));
        assert!(!is_http_request(b"HTTP/1.1 200 OK\r\n"));
        assert!(!is_http_request(b"random data"));
    }

    #[test]
    fn test_is_http_response() {
        assert!(is_http_response(b"HTTP/1.1 200 OK\r\n"));
        assert!(is_http_response(b"HTTP/1.0 404 Not Found\r\n"));
        assert!(!is_http_response(b"GET / HTTP/1.1\r\n"));
    }

    #[test]
    fn test_two_requests_with_content_length() {
        let a = b"POST /a HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let b = b"POST /b HTTP/1.1\r\nContent-Length: 3\r\n\r\nbye";
        let mut data = a.to_vec();
        data.extend_from_slice(b);
        let mut stream = stream_of(&[&data]);

        let frames = run(&mut http_state(), &mut stream, false).frames;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload, a);
        assert_eq!(frames[1].payload, b);
        assert_eq!(frames[1].range, a.len()..data.len());
    }

    #[test]
    fn test_message_split_across_packets_is_held_back() {
        let msg = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nbody";
        let mut stream = stream_of(&[&msg[..30]]);
        let mut state = http_state();
        assert!(run(&mut state, &mut stream, false).frames.is_empty());

        stream.feed(&msg[30..], ts(5), 1).unwrap();
        let frames = run(&mut state, &mut stream, false).frames;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, MessageKind::HttpResponse);
        assert_eq!(frames[0].completed_at, ts(5));
    }

    #[test]
    fn test_no_length_ends_at_blank_line() {
        let mut stream = stream_of(&[b"GET / HTTP/1.1\r\nHost: x\r\n\r\nGET /2 HTTP/1.1\r\n\r\n"]);
        let frames = run(&mut http_state(), &mut stream, false).frames;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].range, 0..27);
    }

    #[test]
    fn test_chunked_body() {
        let msg = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let mut stream = stream_of(&[&msg[..60]]);
        let mut state = http_state();
        assert!(run(&mut state, &mut stream, false).frames.is_empty());

        stream.feed(&msg[60..], ts(2), 1).unwrap();
        let frames = run(&mut state, &mut stream, false).frames;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].range, 0..msg.len());
    }

    #[test]
    fn test_bodiless_status() {
        let data = b"HTTP/1.1 304 Not Modified\r\nContent-Length: 100\r\n\r\nHTTP/1.1 200 OK\r\n\r\n";
        let mut stream = stream_of(&[data]);
        let frames = run(&mut http_state(), &mut stream, false).frames;
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_non_http_bytes_fall_back_per_packet() {
        let mut stream = stream_of(&[b"\x16\x03\x01binary", b"GET / HTTP/1.1\r\n\r\n"]);
        let frames = run(&mut http_state(), &mut stream, false).frames;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].kind, MessageKind::Fallback);
        assert_eq!(frames[0].range, 0..9);
        assert_eq!(frames[1].kind, MessageKind::HttpRequest);
    }

    #[test]
    fn test_final_pass_flushes_partial() {
        let mut stream = stream_of(&[b"POST / HTTP/1.1\r\nContent-Length: 50\r\n\r\nshort"]);
        let mut state = http_state();
        assert!(run(&mut state, &mut stream, false).frames.is_empty());

        let frames = run(&mut state, &mut stream, true).frames;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, MessageKind::Partial);
        assert_eq!(state.cursor(), stream.len());
    }

    #[test]
    fn test_undecided_prefix_waits() {
        assert_eq!(scan_message(b"GE", false), HttpScan::Incomplete);
        assert_eq!(scan_message(b"HTT", false), HttpScan::Incomplete);
        assert_eq!(scan_message(b"XYZ", false), HttpScan::NotHttp);
    }

    #[test]
    fn test_first_header_is_read() {
        let msg = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        assert_eq!(
            scan_message(msg, false),
            HttpScan::Complete {
                len: msg.len(),
                kind: StartLine::Request,
                interim: false
            }
        );

        let chunked = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nab\r\n0\r\n\r\n";
        assert!(matches!(
            scan_message(chunked, false),
            HttpScan::Complete { len, .. } if len == chunked.len()
        ));
    }

    #[test]
    fn test_body_is_held_back_not_split() {
        let mut stream = stream_of(&[b"POST / HTTP/1.1\r\nContent-Length: 50\r\n\r\nab"]);
        assert!(run(&mut http_state(), &mut stream, false).frames.is_empty());
    }

    #[test]
    fn test_header_end_takes_first_blank_line() {
        assert_eq!(header_end(b"GET / HTTP/1.1\r\n\r\nbody\n\n"), Some(18));
        assert_eq!(header_end(b"GET / HTTP/1.1\n\nx\r\n\r\n"), Some(16));
        assert_eq!(header_end(b"GET / HTTP/1.1\r\nHost: x\r\n"), None);
    }

    #[test]
    fn test_head_response_has_no_body() {
        let mut requests = stream_of(&[b"HEAD / HTTP/1.1\r\n\r\n", b"GET / HTTP/1.1\r\n\r\n"]);
        let mut responses = stream_of(&[
            b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
        ]);
        let mut exchange = HttpExchange::default();
        let mut client = http_state();
        let mut server = http_state();

        let sent = run_with(&mut client, &mut requests, Direction::Outgoing, &mut exchange, false);
        assert_eq!(sent.frames.len(), 2);
        assert_eq!(exchange.pending(Direction::Outgoing), 2);

        let answered = run_with(&mut server, &mut responses, Direction::Incoming, &mut exchange, false);
        assert_eq!(answered.frames.len(), 2);
        assert_eq!(
            answered.frames[0].payload,
            b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n"
        );
        assert!(answered.frames[1].payload.ends_with(b"ok"));
        assert_eq!(exchange.pending(Direction::Outgoing), 0);
    }

    #[test]
    fn test_interim_response_keeps_head_pending() {
        let mut exchange = HttpExchange::default();
        exchange.request(Direction::Outgoing, true);
        let mut responses = stream_of(&[
            b"HTTP/1.1 100 Continue\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n",
        ]);
        let out = run_with(&mut http_state(), &mut responses, Direction::Incoming, &mut exchange, false);
        assert_eq!(out.frames.len(), 2);
        assert_eq!(exchange.pending(Direction::Outgoing), 0);
    }

    #[test]
    fn test_line_break_tail_is_not_a_message() {
        let mut stream = stream_of(&[b"GET / HTTP/1.1\r\n\r\n", b"\r\n"]);
        let mut state = http_state();
        assert_eq!(run(&mut state, &mut stream, false).frames.len(), 1);

        let flushed = run(&mut state, &mut stream, true).frames;
        assert!(flushed.is_empty());
        assert_eq!(state.cursor(), stream.len());
    }
}
