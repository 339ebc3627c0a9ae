//! Handle <-> retrieval token codec.
//!
//! A token is the URL-safe base64 (no padding) of the 4-byte big-endian message id.
//! Decoding is strict, so every token that decodes is the canonical encoding of its
//! id and no side table is needed in either direction.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

use crate::domain::MessageId;

/// Longest token we even look at. Real tokens are always `TOKEN_LEN` long.
pub const MAX_TOKEN_LEN: usize = 64;

/// Length of every token produced by [`encode`].
pub const TOKEN_LEN: usize = 6;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("empty token")]
    Empty,

    #[error("token longer than 64 characters")]
    TooLong,

    #[error("token contains a path traversal sequence")]
    Traversal,

    #[error("malformed token")]
    Malformed,
}

pub fn encode(id: MessageId) -> String {
    URL_SAFE_NO_PAD.encode(id.0.to_be_bytes())
}

pub fn decode(token: &str) -> Result<MessageId, TokenError> {
    if token.is_empty() {
        return Err(TokenError::Empty);
    }
    if token.len() > MAX_TOKEN_LEN {
        return Err(TokenError::TooLong);
    }
    if token.contains("..") || token.contains(['/', '\\', '\0']) {
        return Err(TokenError::Traversal);
    }
    if token.len() != TOKEN_LEN {
        return Err(TokenError::Malformed);
    }

    let raw = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| TokenError::Malformed)?;
    let bytes: [u8; 4] = raw.try_into().map_err(|_| TokenError::Malformed)?;
    let id = i32::from_be_bytes(bytes);
    if id <= 0 {
        return Err(TokenError::Malformed);
    }
    Ok(MessageId(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ids() -> Vec<i32> {
        let mut ids = vec![1, 2, 63, 64, 255, 256, 4095, 65_535, 1_000_000, i32::MAX];
        let mut x: i64 = 7;
        for _ in 0..500 {
            x = (x * 48_271) % (i32::MAX as i64);
            ids.push(x as i32);
        }
        ids
    }

    #[test]
    fn decode_inverts_encode() {
        for id in sample_ids() {
            let token = encode(MessageId(id));
            assert_eq!(decode(&token), Ok(MessageId(id)), "token {token}");
        }
    }

    #[test]
    fn encode_inverts_decode_for_accepted_tokens() {
        for t in ["AAAAAQ", "AAAAew", "f____w", "AQIDBA", "Zm9vYg"] {
            let id = decode(t).unwrap();
            assert_eq!(encode(id), t);
        }
    }

    #[test]
    fn tokens_are_url_path_safe_and_fixed_length() {
        for id in sample_ids() {
            let token = encode(MessageId(id));
            assert_eq!(token.len(), TOKEN_LEN);
            assert!(token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
        assert_eq!(encode(MessageId(1)), "AAAAAQ");
    }

    #[test]
    fn rejects_empty_overlong_and_traversal() {
        assert_eq!(decode(""), Err(TokenError::Empty));
        assert_eq!(decode(&"A".repeat(MAX_TOKEN_LEN + 1)), Err(TokenError::TooLong));
        assert_eq!(decode(".."), Err(TokenError::Traversal));
        assert_eq!(decode("../etc/passwd"), Err(TokenError::Traversal));
        assert_eq!(decode("AA/AAQ"), Err(TokenError::Traversal));
        assert_eq!(decode("AA\\AAQ"), Err(TokenError::Traversal));
    }

    #[test]
    fn rejects_malformed_and_non_canonical() {
        for t in [
            "garbage",
            "AAAAA",
            "AAAAAQ==",
            "AAAA+Q",
            "AAAAAR", // non-zero trailing bits
            "AAAAAA", // id 0
            "_____w", // negative id
            "héllo!",
        ] {
            assert!(decode(t).is_err(), "expected {t:?} to be rejected");
        }
    }
}
