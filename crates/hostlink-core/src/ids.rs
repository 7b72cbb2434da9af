//! Identifier generation for connections and outbound requests.

use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Generate a connection id: millisecond timestamp plus a random suffix.
///
/// Uniqueness within a registry is additionally enforced at insert time.
pub fn generate_connection_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let suffix: [u8; 6] = rand::thread_rng().gen();
    format!("{millis:x}-{}", hex::encode(suffix))
}

/// Generate a random request id (16 hex chars).
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn connection_ids_are_distinct() {
        let ids: HashSet<String> = (0..1000).map(|_| generate_connection_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn connection_id_shape() {
        let id = generate_connection_id();
        let (ts, suffix) = id.split_once('-').unwrap();
        assert!(u128::from_str_radix(ts, 16).is_ok());
        assert_eq!(suffix.len(), 12);
    }

    #[test]
    fn request_id_length() {
        assert_eq!(generate_request_id().len(), 16);
    }
}
