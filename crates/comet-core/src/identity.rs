//! Opaque identifiers for client sessions and browsers.

use rand::Rng;

/// Generate a random identifier (hex-encoded, 16 bytes = 32 hex chars).
///
/// Used for both `clientId` values handed out at handshake and browser
/// identities grouping sessions from one browser.
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    hex::encode(bytes)
}

/// Whether a string looks like an id produced by [`generate_id`].
pub fn is_valid_id(id: &str) -> bool {
    id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_valid_and_distinct() {
        let a = generate_id();
        let b = generate_id();
        assert!(is_valid_id(&a));
        assert!(is_valid_id(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("abc"));
        assert!(!is_valid_id("zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz"));
    }
}
