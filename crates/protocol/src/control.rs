//! Control messages multiplexed onto the terminal byte stream.
//!
//! One WebSocket connection carries both terminal bytes and the single
//! control signal, a terminal resize. A resize travels as a text frame whose
//! payload is `resize:<cols>:<rows>`. Terminal input travels as binary
//! frames, so typed input can never be mistaken for a resize. Text frames
//! without the reserved prefix are still accepted as input so that older
//! clients, which sent keystrokes as text, keep working.
//!
//! Malformed resize payloads are dropped without an error: a bad resize is
//! never a reason to end a session.

/// Reserved prefix of a resize control payload.
pub const RESIZE_PREFIX: &str = "resize:";

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TerminalSize {
    /// Width in columns.
    pub cols: u16,
    /// Height in rows.
    pub rows: u16,
}

impl TerminalSize {
    /// Create a size from columns and rows.
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Whether both dimensions are non-zero.
    pub fn is_valid(self) -> bool {
        self.cols > 0 && self.rows > 0
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

/// One inbound message as seen by the bridge, independent of the transport
/// library that delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A text-typed message.
    Text(String),
    /// A binary-typed message.
    Binary(Vec<u8>),
}

/// A decoded client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Apply new dimensions to the PTY.
    Resize(TerminalSize),
    /// Forward bytes to the PTY.
    Data(Vec<u8>),
}

/// Encode a resize notification payload.
pub fn encode_resize(size: TerminalSize) -> String {
    format!("{}{}:{}", RESIZE_PREFIX, size.cols, size.rows)
}

/// Parse a resize payload.
///
/// Returns `None` when the prefix is absent, when the payload does not hold
/// exactly two decimal fields, or when a field is zero, negative or larger
/// than `u16::MAX`.
pub fn parse_resize(text: &str) -> Option<TerminalSize> {
    let rest = text.strip_prefix(RESIZE_PREFIX)?;

    let mut fields = rest.split(':');
    let cols = fields.next()?;
    let rows = fields.next()?;
    if fields.next().is_some() {
        return None;
    }

    let cols = parse_dimension(cols)?;
    let rows = parse_dimension(rows)?;
    Some(TerminalSize::new(cols, rows))
}

fn parse_dimension(field: &str) -> Option<u16> {
    let value: i64 = field.parse().ok()?;
    if value <= 0 {
        return None;
    }
    u16::try_from(value).ok()
}

/// Decode a frame received from a client.
///
/// Returns `None` for frames that must be dropped: resize payloads that fail
/// to parse or carry a non-positive dimension.
pub fn decode_client_frame(frame: Frame) -> Option<ControlMessage> {
    match frame {
        Frame::Binary(bytes) => Some(ControlMessage::Data(bytes)),
        Frame::Text(text) => {
            if text.starts_with(RESIZE_PREFIX) {
                parse_resize(&text).map(ControlMessage::Resize)
            } else {
                Some(ControlMessage::Data(text.into_bytes()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_resize() {
        assert_eq!(encode_resize(TerminalSize::new(120, 40)), "resize:120:40");
        assert_eq!(encode_resize(TerminalSize::new(1, 1)), "resize:1:1");
    }

    #[test]
    fn test_resize_roundtrip_preserves_dimensions() {
        for size in [
            TerminalSize::new(1, 1),
            TerminalSize::new(80, 24),
            TerminalSize::new(u16::MAX, u16::MAX),
        ] {
            assert_eq!(parse_resize(&encode_resize(size)), Some(size));
        }
    }

    #[test]
    fn test_parse_resize_rejects_non_positive() {
        assert_eq!(parse_resize("resize:0:40"), None);
        assert_eq!(parse_resize("resize:120:0"), None);
        assert_eq!(parse_resize("resize:-1:40"), None);
        assert_eq!(parse_resize("resize:120:-40"), None);
    }

    #[test]
    fn test_parse_resize_rejects_malformed() {
        assert_eq!(parse_resize("resize:"), None);
        assert_eq!(parse_resize("resize:abc:40"), None);
        assert_eq!(parse_resize("resize:120"), None);
        assert_eq!(parse_resize("resize:120:40:1"), None);
        assert_eq!(parse_resize("resize: 120:40"), None);
        assert_eq!(parse_resize("resize:120:40\n"), None);
        assert_eq!(parse_resize("resize:70000:40"), None);
        assert_eq!(parse_resize("size:120:40"), None);
    }

    #[test]
    fn test_decode_binary_is_data() {
        let decoded = decode_client_frame(Frame::Binary(b"resize:1:1".to_vec()));
        assert_eq!(decoded, Some(ControlMessage::Data(b"resize:1:1".to_vec())));
    }

    #[test]
    fn test_decode_text_resize() {
        let decoded = decode_client_frame(Frame::Text("resize:120:40".to_string()));
        assert_eq!(
            decoded,
            Some(ControlMessage::Resize(TerminalSize::new(120, 40)))
        );
    }

    #[test]
    fn test_decode_invalid_resize_is_dropped() {
        assert_eq!(decode_client_frame(Frame::Text("resize:0:40".to_string())), None);
        assert_eq!(decode_client_frame(Frame::Text("resize:x:y".to_string())), None);
    }

    #[test]
    fn test_decode_plain_text_is_data() {
        let decoded = decode_client_frame(Frame::Text("echo hi\n".to_string()));
        assert_eq!(decoded, Some(ControlMessage::Data(b"echo hi\n".to_vec())));

        let decoded = decode_client_frame(Frame::Text(String::new()));
        assert_eq!(decoded, Some(ControlMessage::Data(Vec::new())));
    }

    #[test]
    fn test_terminal_size_validity() {
        assert!(TerminalSize::new(80, 24).is_valid());
        assert!(!TerminalSize::new(0, 24).is_valid());
        assert!(!TerminalSize::new(80, 0).is_valid());
        assert_eq!(TerminalSize::default(), TerminalSize::new(80, 24));
    }
}
