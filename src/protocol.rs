//! Control-protocol framing.
//!
//! Tor's control port speaks a line-oriented protocol. Every reply line starts
//! with a three-digit status code followed by a divider:
//!
//! ```text
//!   250-version=0.4.8.12        ◄── mid-reply line    ('-')
//!   250+circuit-status=         ◄── data line         ('+'), body follows
//!   5 BUILT $AAAA~relay,...
//!   .                           ◄── end of data body
//!   250 OK                      ◄── final line        (' ')
//!
//!   650 CIRC 5 BUILT ...        ◄── asynchronous event (status 650)
//! ```
//!
//! [`ReplyParser`] consumes raw lines and yields complete [`Frame`]s, telling
//! synchronous replies apart from asynchronous events. It does no I/O, so the
//! controller's reader task can feed it from any source and tests can feed it
//! string slices.

use crate::error::{Error, Result};

/// Status code of asynchronous event notifications.
pub const EVENT_STATUS: u16 = 650;

/// One line of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    /// Three-digit status code.
    pub status: u16,
    /// Divider character: `-`, `+` or ` `.
    pub divider: char,
    /// Text after the divider.
    pub text: String,
    /// Data body for `+` lines, dot-unstuffed, lines joined with `\n`.
    pub data: Option<String>,
}

/// A complete reply: one or more lines ending in a final line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Status code of the final line.
    pub status: u16,
    /// All lines in arrival order.
    pub lines: Vec<ReplyLine>,
}

impl Reply {
    /// Returns true for 2xx replies.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Returns true for asynchronous event notifications.
    pub fn is_event(&self) -> bool {
        self.status == EVENT_STATUS
    }

    /// Text of the final line, e.g. `OK` or an error description.
    pub fn message(&self) -> &str {
        self.lines.last().map(|l| l.text.as_str()).unwrap_or("")
    }

    /// Converts a non-2xx reply into [`Error::CommandRejected`].
    pub fn into_result(self) -> Result<Reply> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(Error::CommandRejected {
                code: self.status,
                message: self.message().to_string(),
            })
        }
    }

    /// Looks up `key` among `key=value` lines, including data lines.
    ///
    /// For `+` lines the data body is returned.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            let (k, v) = line.text.split_once('=')?;
            if k != key {
                return None;
            }
            match line.data {
                Some(ref data) => Some(data.as_str()),
                None => Some(v),
            }
        })
    }
}

/// A complete frame read off the control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Reply to the in-flight synchronous command.
    Reply(Reply),
    /// Asynchronous event notification.
    Event(Reply),
}

/// Incremental reply parser.
///
/// # Example
///
/// ```rust
/// use tor_manager::protocol::{Frame, ReplyParser};
///
/// let mut parser = ReplyParser::new();
/// assert!(parser.push_line("250-version=0.4.8.12").unwrap().is_none());
/// match parser.push_line("250 OK").unwrap() {
///     Some(Frame::Reply(reply)) => assert_eq!(reply.value("version"), Some("0.4.8.12")),
///     other => panic!("unexpected frame: {:?}", other),
/// }
/// ```
#[derive(Debug, Default)]
pub struct ReplyParser {
    pending: Vec<ReplyLine>,
    data: Option<(ReplyLine, Vec<String>)>,
}

impl ReplyParser {
    /// Creates an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a frame is partially read.
    pub fn in_progress(&self) -> bool {
        !self.pending.is_empty() || self.data.is_some()
    }

    /// Feeds one line (with or without its trailing CRLF).
    ///
    /// Returns a frame once its final line has been seen.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the line has no valid status code or
    /// divider, or if the status code changes inside a multi-line reply.
    pub fn push_line(&mut self, raw: &str) -> Result<Option<Frame>> {
        let line = raw.trim_end_matches(['\r', '\n']);

        if let Some((header, mut body)) = self.data.take() {
            if line == "." {
                let mut header = header;
                header.data = Some(body.join("\n"));
                self.pending.push(header);
            } else {
                let unstuffed = line.strip_prefix('.').filter(|_| line.starts_with(".."));
                body.push(unstuffed.unwrap_or(line).to_string());
                self.data = Some((header, body));
            }
            return Ok(None);
        }

        let parsed = parse_line(line)?;
        if let Some(first_status) = self.pending.first().map(|f| f.status) {
            if first_status != parsed.status {
                self.pending.clear();
                return Err(Error::Protocol(format!(
                    "status changed mid-reply: {} then {}",
                    first_status, parsed.status
                )));
            }
        }

        match parsed.divider {
            '-' => {
                self.pending.push(parsed);
                Ok(None)
            }
            '+' => {
                self.data = Some((parsed, Vec::new()));
                Ok(None)
            }
            _ => {
                let status = parsed.status;
                self.pending.push(parsed);
                let reply = Reply {
                    status,
                    lines: std::mem::take(&mut self.pending),
                };
                if reply.is_event() {
                    Ok(Some(Frame::Event(reply)))
                } else {
                    Ok(Some(Frame::Reply(reply)))
                }
            }
        }
    }
}

fn parse_line(line: &str) -> Result<ReplyLine> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return Err(Error::Protocol(format!("malformed reply line: {:?}", line)));
    }
    let status: u16 = line[..3]
        .parse()
        .map_err(|_| Error::Protocol(format!("bad status code in {:?}", line)))?;

    let (divider, text) = match bytes.get(3) {
        None => (' ', ""),
        Some(b'-') => ('-', &line[4..]),
        Some(b'+') => ('+', &line[4..]),
        Some(b' ') => (' ', &line[4..]),
        Some(_) => {
            return Err(Error::Protocol(format!(
                "unknown divider in reply line: {:?}",
                line
            )))
        }
    };

    Ok(ReplyLine {
        status,
        divider,
        text: text.to_string(),
        data: None,
    })
}

/// Quotes a value for use in a control command (`"..."` with escapes).
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Splits `KEY=VALUE` arguments, honouring quoted values.
///
/// Positional words (without `=`) are returned with an empty key.
pub fn split_arguments(input: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        let mut value = String::new();
        let mut has_eq = false;
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                break;
            }
            chars.next();
            if !has_eq && c == '=' {
                has_eq = true;
                if chars.peek() == Some(&'"') {
                    chars.next();
                    while let Some(c) = chars.next() {
                        match c {
                            '\\' => {
                                if let Some(escaped) = chars.next() {
                                    value.push(escaped);
                                }
                            }
                            '"' => break,
                            c => value.push(c),
                        }
                    }
                }
            } else if has_eq {
                value.push(c);
            } else {
                key.push(c);
            }
        }

        if has_eq {
            out.push((key, value));
        } else {
            out.push((String::new(), key));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut ReplyParser, lines: &[&str]) -> Vec<Frame> {
        lines
            .iter()
            .filter_map(|l| parser.push_line(l).unwrap())
            .collect()
    }

    #[test]
    fn test_single_line_reply() {
        let mut parser = ReplyParser::new();
        let frames = feed(&mut parser, &["250 OK\r\n"]);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Reply(r) => {
                assert!(r.is_ok());
                assert_eq!(r.message(), "OK");
            }
            other => panic!("expected reply, got {:?}", other),
        }
        assert!(!parser.in_progress());
    }

    #[test]
    fn test_multi_line_with_data_block() {
        let mut parser = ReplyParser::new();
        let frames = feed(
            &mut parser,
            &[
                "250+circuit-status=",
                "1 BUILT $AAAA~a,$BBBB~b PURPOSE=GENERAL",
                "..dotted",
                ".",
                "250-version=0.4.8.12",
                "250 OK",
            ],
        );
        assert_eq!(frames.len(), 1);
        let Frame::Reply(reply) = &frames[0] else {
            panic!("expected reply");
        };
        assert_eq!(reply.lines.len(), 3);
        assert_eq!(
            reply.value("circuit-status"),
            Some("1 BUILT $AAAA~a,$BBBB~b PURPOSE=GENERAL\n.dotted")
        );
        assert_eq!(reply.value("version"), Some("0.4.8.12"));
    }

    #[test]
    fn test_event_is_distinguished_from_reply() {
        let mut parser = ReplyParser::new();
        let frames = feed(&mut parser, &["650 BW 10 20", "250 OK"]);
        assert!(matches!(frames[0], Frame::Event(_)));
        assert!(matches!(frames[1], Frame::Reply(_)));
    }

    #[test]
    fn test_error_reply_into_result() {
        let mut parser = ReplyParser::new();
        let frames = feed(&mut parser, &["515 Authentication failed: Password did not match"]);
        let Frame::Reply(reply) = frames[0].clone() else {
            panic!("expected reply");
        };
        match reply.into_result() {
            Err(Error::CommandRejected { code, message }) => {
                assert_eq!(code, 515);
                assert!(message.starts_with("Authentication failed"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_lines() {
        let mut parser = ReplyParser::new();
        assert!(parser.push_line("hello").is_err());
        assert!(parser.push_line("25").is_err());
        assert!(parser.push_line("250*x").is_err());

        parser.push_line("250-a=1").unwrap();
        assert!(parser.push_line("251 OK").is_err());
        assert!(!parser.in_progress());
    }

    #[test]
    fn test_status_change_mid_reply_resets_parser() {
        let mut parser = ReplyParser::new();
        assert!(parser.push_line("250-version=0.4.8.12").unwrap().is_none());
        match parser.push_line("552 OK") {
            Err(Error::Protocol(msg)) => assert!(msg.contains("250 then 552"), "{}", msg),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!parser.in_progress());

        let frames = feed(&mut parser, &["250 OK"]);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote("a\"b\\c"), "\"a\\\"b\\\\c\"");
    }

    #[test]
    fn test_split_arguments() {
        let args = split_arguments(r#"NOTICE BOOTSTRAP PROGRESS=50 TAG=loading SUMMARY="Loading relay descriptors""#);
        assert_eq!(args[0], (String::new(), "NOTICE".to_string()));
        assert_eq!(args[2], ("PROGRESS".to_string(), "50".to_string()));
        assert_eq!(
            args[4],
            ("SUMMARY".to_string(), "Loading relay descriptors".to_string())
        );
    }
}
