//! Clipboard relay
//!
//! The actual clipboard write happens in the browser. The server side only
//! decides whether a payload is worth copying; blank text produces neither
//! a write nor a confirmation.

/// Returns the text to copy, untrimmed, or `None` when it trims to nothing.
pub fn copy_payload(text: &str) -> Option<&str> {
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_passes_through_untrimmed() {
        assert_eq!(copy_payload("  1girl, solo  "), Some("  1girl, solo  "));
    }

    #[test]
    fn test_blank_payloads_are_dropped() {
        assert_eq!(copy_payload(""), None);
        assert_eq!(copy_payload("   \t\n"), None);
    }
}
