use serde_json::Value as JsonValue;

use crate::error::MemoryError;

/// Validates that entry metadata/tags are a JSON object, not an arbitrary
/// scalar or array, before the store ever sees them (§10.5).
pub fn validate_json_object(field: &str, value: &JsonValue) -> Result<(), MemoryError> {
    if value.is_object() {
        Ok(())
    } else {
        Err(MemoryError::Validation(format!(
            "{field} must be a JSON object, got {value}"
        )))
    }
}

/// Validates a context document against I9: valid UTF-8 (guaranteed by `&str`),
/// no control characters other than tab/LF/CR, no Unicode non-characters, and
/// a bounded code-point count.
pub fn validate_context_document(document: &str, max_chars: usize) -> Result<(), MemoryError> {
    let mut count = 0usize;
    for ch in document.chars() {
        count += 1;
        if count > max_chars {
            return Err(MemoryError::Validation(format!(
                "context document exceeds maximum of {max_chars} code points"
            )));
        }

        if is_disallowed_control(ch) {
            return Err(MemoryError::Validation(format!(
                "context document contains disallowed control character U+{:04X}",
                ch as u32
            )));
        }

        if is_noncharacter(ch) {
            return Err(MemoryError::Validation(format!(
                "context document contains Unicode non-character U+{:04X}",
                ch as u32
            )));
        }
    }

    if document.is_empty() {
        return Err(MemoryError::Validation(
            "context document must not be empty".to_string(),
        ));
    }

    Ok(())
}

fn is_disallowed_control(ch: char) -> bool {
    matches!(ch, '\t' | '\n' | '\r') == false && ch.is_control()
}

fn is_noncharacter(ch: char) -> bool {
    let cp = ch as u32;
    (0xFDD0..=0xFDEF).contains(&cp) || (cp & 0xFFFE) == 0xFFFE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_text_with_tab_and_newline() {
        validate_context_document("summary\tline\nsecond line\r\n", 1000).unwrap();
    }

    #[test]
    fn rejects_empty_document() {
        assert!(validate_context_document("", 1000).is_err());
    }

    #[test]
    fn rejects_control_characters() {
        let doc = format!("hello{}world", '\u{0001}');
        assert!(validate_context_document(&doc, 1000).is_err());
    }

    #[test]
    fn rejects_noncharacters() {
        let doc = format!("hello{}", '\u{FDD0}');
        assert!(validate_context_document(&doc, 1000).is_err());

        let doc = format!("hello{}", '\u{FFFE}');
        assert!(validate_context_document(&doc, 1000).is_err());
    }

    #[test]
    fn rejects_oversize_document_by_code_points() {
        let doc = "a".repeat(10);
        assert!(validate_context_document(&doc, 5).is_err());
    }

    #[test]
    fn accepts_json_objects() {
        validate_json_object("metadata", &serde_json::json!({"k": "v"})).unwrap();
        validate_json_object("tags", &serde_json::json!({})).unwrap();
    }

    #[test]
    fn rejects_non_object_json() {
        assert!(validate_json_object("metadata", &serde_json::json!("oops")).is_err());
        assert!(validate_json_object("metadata", &serde_json::json!(42)).is_err());
        assert!(validate_json_object("tags", &serde_json::json!(["a", "b"])).is_err());
    }
}
