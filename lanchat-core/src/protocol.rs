//! LanChat wire protocol: plain-text, newline-delimited lines.
//!
//! Discovery datagram: `DISCOVER:<ipv4-address>:<display-name>`.
//! Chat connection: client writes one line, server answers with the line `ACK`.

use std::net::Ipv4Addr;

use crate::peers::Sighting;

/// Tag that opens every discovery datagram.
pub const DISCOVER_TAG: &str = "DISCOVER";
/// Acknowledgment line written by the server after it accepted a message.
pub const ACK: &str = "ACK";
/// Liveness probe content.
pub const PING: &str = "ping";
/// Prefix of a read receipt line: `SEEN:<content>`.
pub const SEEN_PREFIX: &str = "SEEN:";
/// Leads a text line that would otherwise read as a control line (or starts with this byte).
pub const TEXT_ESCAPE: char = '\\';

/// Largest discovery datagram we produce or accept.
pub const MAX_DATAGRAM_LEN: usize = 1024;

/// Build the discovery datagram for this device.
pub fn encode_announcement(address: Ipv4Addr, name: &str) -> Result<String, AnnouncementError> {
    if name.is_empty() {
        return Err(AnnouncementError::EmptyName);
    }
    if name.contains(['\n', '\r', '\0']) {
        return Err(AnnouncementError::InvalidName);
    }
    let line = format!("{DISCOVER_TAG}:{address}:{name}");
    if line.len() > MAX_DATAGRAM_LEN {
        return Err(AnnouncementError::TooLarge);
    }
    Ok(line)
}

/// Parse a received discovery datagram.
///
/// Splits into at most three fields, so a display name may itself contain `:`.
/// Trailing whitespace and NUL padding are ignored.
pub fn parse_announcement(datagram: &str) -> Result<Sighting, AnnouncementError> {
    let line = datagram.trim_end_matches(|c: char| c.is_whitespace() || c == '\0');
    let mut fields = line.splitn(3, ':');
    let tag = fields.next().unwrap_or_default();
    if tag != DISCOVER_TAG {
        return Err(AnnouncementError::UnknownTag);
    }
    let (Some(address), Some(name)) = (fields.next(), fields.next()) else {
        return Err(AnnouncementError::MissingField);
    };
    let address: Ipv4Addr = address
        .parse()
        .map_err(|_| AnnouncementError::InvalidAddress)?;
    if name.is_empty() {
        return Err(AnnouncementError::EmptyName);
    }
    Ok(Sighting {
        address: address.to_string(),
        name: name.to_string(),
    })
}

/// Why a discovery datagram could not be built or parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnnouncementError {
    #[error("datagram does not start with {DISCOVER_TAG}")]
    UnknownTag,
    #[error("datagram has fewer than three fields")]
    MissingField,
    #[error("invalid ipv4 address")]
    InvalidAddress,
    #[error("display name is empty")]
    EmptyName,
    #[error("display name contains a line break or NUL")]
    InvalidName,
    #[error("datagram too large")]
    TooLarge,
}

/// One line received on a chat connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatLine {
    /// Liveness probe; acknowledged but never shown in a chat log.
    Ping,
    /// Read receipt for a message we sent with this content.
    Seen(String),
    /// Ordinary message text.
    Text(String),
}

/// Classify a line read from a chat connection (line terminator already stripped or not).
pub fn parse_chat_line(line: &str) -> ChatLine {
    let line = line.trim_end_matches(['\r', '\n']);
    if let Some(text) = line.strip_prefix(TEXT_ESCAPE) {
        return ChatLine::Text(text.to_string());
    }
    if line == PING {
        return ChatLine::Ping;
    }
    match line.strip_prefix(SEEN_PREFIX) {
        Some(content) => ChatLine::Seen(content.to_string()),
        None => ChatLine::Text(line.to_string()),
    }
}

/// Encode message text as exactly one wire line (with terminator).
/// Embedded line breaks would split the message, so they become spaces. Text that looks
/// like a control line is escaped so the receiver still reads it as text.
pub fn encode_chat_line(content: &str) -> String {
    let text = single_line(content);
    if is_control_like(&text) {
        format!("{TEXT_ESCAPE}{text}\n")
    } else {
        format!("{text}\n")
    }
}

/// Encode the liveness probe line.
pub fn encode_ping_line() -> String {
    format!("{PING}\n")
}

/// Encode a read receipt for `content`.
pub fn encode_seen_line(content: &str) -> String {
    format!("{SEEN_PREFIX}{}\n", single_line(content))
}

fn single_line(content: &str) -> String {
    content
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect()
}

fn is_control_like(text: &str) -> bool {
    text == PING || text.starts_with(SEEN_PREFIX) || text.starts_with(TEXT_ESCAPE)
}

/// Whether a server reply line is the acknowledgment token.
pub fn is_ack(reply: &str) -> bool {
    reply.trim_end_matches(['\r', '\n']) == ACK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcement_roundtrip() {
        let line = encode_announcement(Ipv4Addr::new(192, 168, 1, 7), "pixel-7").unwrap();
        assert_eq!(line, "DISCOVER:192.168.1.7:pixel-7");
        let s = parse_announcement(&line).unwrap();
        assert_eq!(s.address, "192.168.1.7");
        assert_eq!(s.name, "pixel-7");
    }

    #[test]
    fn name_may_contain_colon() {
        let s = parse_announcement("DISCOVER:10.0.0.2:kitchen:tablet").unwrap();
        assert_eq!(s.name, "kitchen:tablet");
    }

    #[test]
    fn trailing_padding_ignored() {
        let s = parse_announcement("DISCOVER:10.0.0.2:laptop\n\0\0").unwrap();
        assert_eq!(s.name, "laptop");
    }

    #[test]
    fn malformed_datagrams_rejected() {
        assert_eq!(
            parse_announcement("DISCOVER:onlyonefield"),
            Err(AnnouncementError::MissingField)
        );
        assert_eq!(
            parse_announcement("HELLO:10.0.0.2:x"),
            Err(AnnouncementError::UnknownTag)
        );
        assert_eq!(
            parse_announcement("DISCOVER:not-an-ip:x"),
            Err(AnnouncementError::InvalidAddress)
        );
        assert_eq!(
            parse_announcement("DISCOVER:10.0.0.2:"),
            Err(AnnouncementError::EmptyName)
        );
        assert_eq!(parse_announcement(""), Err(AnnouncementError::UnknownTag));
    }

    #[test]
    fn encode_rejects_bad_names() {
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        assert_eq!(encode_announcement(ip, ""), Err(AnnouncementError::EmptyName));
        assert_eq!(
            encode_announcement(ip, "a\nb"),
            Err(AnnouncementError::InvalidName)
        );
        let long = "x".repeat(MAX_DATAGRAM_LEN);
        assert_eq!(
            encode_announcement(ip, &long),
            Err(AnnouncementError::TooLarge)
        );
    }

    #[test]
    fn chat_line_classification() {
        assert_eq!(parse_chat_line("ping\n"), ChatLine::Ping);
        assert_eq!(parse_chat_line("ping pong"), ChatLine::Text("ping pong".into()));
        assert_eq!(
            parse_chat_line("SEEN:hello\r\n"),
            ChatLine::Seen("hello".into())
        );
        assert_eq!(parse_chat_line("hello"), ChatLine::Text("hello".into()));
    }

    #[test]
    fn chat_line_is_single_line() {
        assert_eq!(encode_chat_line("a\nb\r\nc"), "a b  c\n");
        assert_eq!(encode_seen_line("hi"), "SEEN:hi\n");
        assert_eq!(encode_ping_line(), "ping\n");
    }

    #[test]
    fn text_shaped_like_control_lines_stays_text() {
        for text in ["SEEN:the plan", "ping", "\\already escaped", "SEEN:"] {
            let line = encode_chat_line(text);
            assert!(line.starts_with(TEXT_ESCAPE), "{line:?}");
            assert_eq!(parse_chat_line(&line), ChatLine::Text(text.to_string()));
        }
        assert_eq!(encode_chat_line("pingu"), "pingu\n");
        assert_eq!(parse_chat_line(&encode_seen_line("x")), ChatLine::Seen("x".into()));
    }

    #[test]
    fn ack_matching() {
        assert!(is_ack("ACK\n"));
        assert!(is_ack("ACK\r\n"));
        assert!(!is_ack("ack"));
        assert!(!is_ack("ACK!"));
        assert!(!is_ack(""));
    }
}
