use chrono::Utc;
use std::time::SystemTime;

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01).
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Returns the current time formatted for HTTP `Date` headers (RFC 1123),
/// e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
#[inline]
pub fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_is_past_2020() {
        assert!(timestamp_secs() > 1_577_836_800);
    }

    #[test]
    fn test_http_date_shape() {
        let date = http_date();

        // `Sun, 06 Nov 1994 08:49:37 GMT` is always 29 characters.
        assert_eq!(date.len(), 29);
        assert_eq!(&date[3..5], ", ");
        assert!(date.ends_with(" GMT"));
    }
}
