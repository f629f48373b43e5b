//! Argument validation.
//!
//! Pure functions that reject malformed input before it reaches any stateful
//! component. Every check returns `ClientError::InvalidArgument` for shape
//! problems and `ClientError::Range` for numeric bounds.

use crate::error::{ClientError, Result};

/// Largest time-to-live, in milliseconds, that the protocol can carry.
pub const MAX_TTL: u32 = u32::MAX;

/// Longest accepted client id.
pub const MAX_CLIENT_ID_LEN: usize = 256;

/// Character that separates the share name from the pattern on the wire.
const SHARE_SEPARATOR: char = ':';

/// Checks a subscription pattern.
///
/// The pattern must be non-empty. `+` must occupy a whole segment and `#`
/// must occupy the whole final segment, so `+`, `#`, `/#`, `/+` and
/// `sport/+/scores/#` are accepted while `a+` or `#/a` are not.
pub fn topic_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(ClientError::invalid("Topic pattern must not be empty"));
    }
    check_text(pattern, "Topic pattern")?;

    let segments: Vec<&str> = pattern.split('/').collect();
    let last = segments.len() - 1;
    for (index, segment) in segments.iter().enumerate() {
        if segment.contains('#') && (*segment != "#" || index != last) {
            return Err(ClientError::invalid(format!(
                "Topic pattern '{pattern}' is invalid: '#' must be the whole final segment"
            )));
        }
        if segment.contains('+') && *segment != "+" {
            return Err(ClientError::invalid(format!(
                "Topic pattern '{pattern}' is invalid: '+' must be a whole segment"
            )));
        }
    }
    Ok(())
}

/// Checks a topic used for sending. Wildcards are not allowed.
pub fn topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(ClientError::invalid("Topic must not be empty"));
    }
    check_text(topic, "Topic")?;
    if topic.contains(['+', '#']) {
        return Err(ClientError::invalid(format!(
            "Topic '{topic}' must not contain wildcard characters"
        )));
    }
    Ok(())
}

/// Checks and normalizes a share name.
///
/// `None` and the empty string both mean "not shared". Names containing `:`
/// are rejected; any other text, including purely numeric names, is kept.
pub fn share(share: Option<&str>) -> Result<Option<String>> {
    match share {
        None | Some("") => Ok(None),
        Some(name) if name.contains(SHARE_SEPARATOR) => Err(ClientError::invalid(format!(
            "Share name '{name}' must not contain '{SHARE_SEPARATOR}'"
        ))),
        Some(name) => {
            check_text(name, "Share name")?;
            Ok(Some(name.to_string()))
        }
    }
}

/// Converts a time-to-live in milliseconds to its wire form.
///
/// Negative, fractional, non-finite and values above [`MAX_TTL`] are
/// rejected with `ClientError::Range`. Zero is the smallest valid value.
pub fn ttl(ttl: f64) -> Result<u32> {
    if !ttl.is_finite() {
        return Err(ClientError::range(format!("ttl must be a finite number, got {ttl}")));
    }
    if ttl < 0.0 {
        return Err(ClientError::range(format!("ttl must not be negative, got {ttl}")));
    }
    if ttl.fract() != 0.0 {
        return Err(ClientError::range(format!("ttl must be an integer, got {ttl}")));
    }
    if ttl > f64::from(MAX_TTL) {
        return Err(ClientError::range(format!(
            "ttl must not exceed {MAX_TTL}, got {ttl}"
        )));
    }
    Ok(ttl as u32)
}

/// Checks the time-to-live given to `unsubscribe`.
///
/// Only `0` is accepted: it discards any messages held for the subscription
/// immediately.
pub fn unsubscribe_ttl(ttl: f64) -> Result<()> {
    if ttl == 0.0 {
        Ok(())
    } else {
        Err(ClientError::range(format!(
            "unsubscribe ttl may only be 0, got {ttl}"
        )))
    }
}

/// Checks a client id: 1 to 256 characters from `[A-Za-z0-9%/._]`.
pub fn client_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(ClientError::invalid("Client id must not be empty"));
    }
    if id.chars().count() > MAX_CLIENT_ID_LEN {
        return Err(ClientError::invalid(format!(
            "Client id is longer than {MAX_CLIENT_ID_LEN} characters"
        )));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '%' | '/' | '.' | '_')))
    {
        return Err(ClientError::invalid(format!(
            "Client id '{id}' contains invalid character '{bad}'"
        )));
    }
    Ok(())
}

fn check_text(value: &str, what: &str) -> Result<()> {
    if value.contains('\0') {
        return Err(ClientError::invalid(format!("{what} must not contain NUL characters")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_pattern_accepts_wildcards() {
        for pattern in ["/foo", "+", "#", "/#", "/+", "sport/+/scores/#", "a/b/c", "+/+"] {
            assert!(topic_pattern(pattern).is_ok(), "{pattern} should be valid");
        }
    }

    #[test]
    fn test_topic_pattern_rejects_bad_input() {
        for pattern in ["", "a+", "#/a", "a/#b", "x/y#", "+a/b", "a\0b"] {
            assert!(
                matches!(topic_pattern(pattern), Err(ClientError::InvalidArgument(_))),
                "{pattern:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_send_topic_rejects_wildcards() {
        assert!(topic("/foo/bar").is_ok());
        assert!(matches!(topic(""), Err(ClientError::InvalidArgument(_))));
        assert!(matches!(topic("/foo/+"), Err(ClientError::InvalidArgument(_))));
        assert!(matches!(topic("/foo/#"), Err(ClientError::InvalidArgument(_))));
    }

    #[test]
    fn test_share_names() {
        assert_eq!(share(None).unwrap(), None);
        assert_eq!(share(Some("")).unwrap(), None);
        assert_eq!(share(Some("abc")).unwrap(), Some("abc".to_string()));
        assert_eq!(share(Some("7")).unwrap(), Some("7".to_string()));
        assert!(matches!(share(Some("a:b")), Err(ClientError::InvalidArgument(_))));
        assert!(matches!(share(Some(":")), Err(ClientError::InvalidArgument(_))));
    }

    #[test]
    fn test_ttl_bounds() {
        assert_eq!(ttl(0.0).unwrap(), 0);
        assert_eq!(ttl(1000.0).unwrap(), 1000);
        assert_eq!(ttl(4_294_967_295.0).unwrap(), u32::MAX);

        for bad in [
            -1.0,
            0.5,
            f64::NAN,
            f64::INFINITY,
            f64::NEG_INFINITY,
            4_294_967_296.0,
            9_007_199_254_740_992.0,
            -9_007_199_254_740_992.0,
        ] {
            assert!(
                matches!(ttl(bad), Err(ClientError::Range(_))),
                "{bad} should be a range error"
            );
        }
    }

    #[test]
    fn test_unsubscribe_ttl_only_zero() {
        assert!(unsubscribe_ttl(0.0).is_ok());
        for bad in [1.0, -1.0, f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 9_007_199_254_740_992.0] {
            assert!(matches!(unsubscribe_ttl(bad), Err(ClientError::Range(_))));
        }
    }

    #[test]
    fn test_client_id() {
        assert!(client_id("AUTO_1a2b3c4").is_ok());
        assert!(client_id("a/b.c_d%e").is_ok());
        assert!(client_id(&"x".repeat(256)).is_ok());

        assert!(client_id("").is_err());
        assert!(client_id(&"x".repeat(257)).is_err());
        assert!(client_id("has space").is_err());
        assert!(client_id("colon:").is_err());
    }
}
