//! Logging utilities for sanitizing multi-line user/content strings so logs stay single-line.
//! Escapes control characters that otherwise break log readability.

use crate::message::Message;

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///
/// Strings longer than the preview cap are truncated with an ellipsis.
pub fn escape_log(s: &str) -> String {
    escape_log_capped(s, 300)
}

/// Same as [`escape_log`] with an explicit character cap.
pub fn escape_log_capped(s: &str, max_preview: usize) -> String {
    let mut out = String::with_capacity(s.len().min(max_preview) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= max_preview {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Compact one-line description of a message for debug logs.
pub fn describe_message(msg: &Message) -> String {
    let target = msg.recipient_id.as_deref().unwrap_or("*");
    format!(
        "{} -> {} ch{} [{}] via {}: {}",
        msg.sender_id,
        target,
        msg.channel,
        msg.priority,
        if msg.interface_id.is_empty() {
            "-"
        } else {
            msg.interface_id.as_str()
        },
        escape_log_capped(&msg.content, 80)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_newlines_and_truncates() {
        let s = "Line1\nLine2\r\tEnd";
        assert_eq!(escape_log(s), "Line1\\nLine2\\r\\tEnd");
        assert_eq!(escape_log_capped("abcdef", 3), "abc…");
    }

    #[test]
    fn describes_broadcast_message() {
        let msg = Message::new("!node1", "hello\nworld").with_interface("serial0");
        let line = describe_message(&msg);
        assert!(line.starts_with("!node1 -> * ch0 [normal] via serial0"));
        assert!(line.ends_with("hello\\nworld"));
    }
}
