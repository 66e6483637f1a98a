//! Name, keyword, and content validation for the registration surfaces.
//!
//! Service names, plugin names, scheduled-task names, and command keywords all
//! end up as map keys and in log lines, so they are held to a conservative
//! character set. Content helpers keep outbound text within radio frame limits
//! without splitting UTF-8 codepoints.

/// Name validation errors with helpful messages
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("name is empty")]
    Empty,

    #[error("name is too long (maximum {max} characters)")]
    TooLong { max: usize },

    #[error("name cannot start or end with whitespace")]
    InvalidWhitespace,

    #[error("name contains invalid characters: {chars}")]
    InvalidCharacters { chars: String },
}

/// Naming rules for a registration surface
#[derive(Debug, Clone)]
pub struct NameRules {
    pub max_length: usize,
    pub allow_dots: bool,
    pub allow_spaces: bool,
}

impl NameRules {
    /// Services and plugins: short identifiers that appear in dependency lists.
    pub fn service() -> Self {
        NameRules {
            max_length: 48,
            allow_dots: true,
            allow_spaces: false,
        }
    }

    /// Scheduled tasks: configuration authors like readable names.
    pub fn task() -> Self {
        NameRules {
            max_length: 64,
            allow_dots: true,
            allow_spaces: true,
        }
    }

    /// Command keywords: a single token typed over the radio.
    pub fn keyword() -> Self {
        NameRules {
            max_length: 24,
            allow_dots: false,
            allow_spaces: false,
        }
    }
}

/// Validate a name according to the given rules, returning the accepted form.
pub fn validate_name(name: &str, rules: &NameRules) -> Result<String, NameError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(NameError::Empty);
    }
    if trimmed != name {
        return Err(NameError::InvalidWhitespace);
    }
    if trimmed.chars().count() > rules.max_length {
        return Err(NameError::TooLong {
            max: rules.max_length,
        });
    }

    let mut invalid: Vec<char> = trimmed
        .chars()
        .filter(|&ch| {
            let ok = ch.is_ascii_alphanumeric()
                || ch == '_'
                || ch == '-'
                || (ch == '.' && rules.allow_dots)
                || (ch == ' ' && rules.allow_spaces);
            !ok
        })
        .collect();
    if !invalid.is_empty() {
        invalid.sort_unstable();
        invalid.dedup();
        return Err(NameError::InvalidCharacters {
            chars: invalid.into_iter().collect(),
        });
    }
    Ok(trimmed.to_string())
}

pub fn validate_service_name(name: &str) -> Result<String, NameError> {
    validate_name(name, &NameRules::service())
}

pub fn validate_task_name(name: &str) -> Result<String, NameError> {
    validate_name(name, &NameRules::task())
}

/// Validate a command keyword; keywords are matched case-insensitively so the
/// accepted form is lowercased.
pub fn validate_keyword(keyword: &str) -> Result<String, NameError> {
    validate_name(keyword, &NameRules::keyword()).map(|k| k.to_lowercase())
}

/// Strip control characters except newline and tab.
pub fn sanitize_content(content: &str) -> String {
    content
        .chars()
        .filter(|&c| !c.is_control() || c == '\n' || c == '\t')
        .collect()
}

/// Truncate to at most `max_bytes` without splitting a UTF-8 codepoint.
pub fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Chunk a UTF-8 string into <= max_bytes segments without splitting codepoints.
/// Prefers to split after a newline when one falls in the back half of a chunk.
pub fn chunk_utf8(text: &str, max_bytes: usize) -> Vec<String> {
    if max_bytes == 0 || text.len() <= max_bytes {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_bytes {
            chunks.push(remaining.to_string());
            break;
        }
        let slice = truncate_utf8(remaining, max_bytes);
        if slice.is_empty() {
            // max_bytes smaller than the next codepoint; emit it whole
            let width = remaining.chars().next().map(char::len_utf8).unwrap_or(1);
            chunks.push(remaining[..width].to_string());
            remaining = &remaining[width..];
            continue;
        }
        if let Some(pos) = slice.rfind('\n') {
            if pos > 0 && pos + 1 >= slice.len() / 2 {
                chunks.push(slice[..=pos].to_string());
                remaining = &remaining[pos + 1..];
                continue;
            }
        }
        chunks.push(slice.to_string());
        remaining = &remaining[slice.len()..];
    }
    chunks
}
