//! Signature verification (spec §4.K, §6 "Signatures"). Channel signatures
//! cover the configured public URL plus the form fields; source-control
//! signatures cover the raw JSON body. Both comparisons are constant-time.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Recomputes the channel signature over `url` followed by each
/// `key=value` form field in the order given, and compares it to the
/// provided header value (hex-encoded) in constant time.
pub fn verify_channel_signature(secret: &str, url: &str, fields: &[(&str, &str)], provided_hex: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(url.as_bytes());
    for (key, value) in fields {
        mac.update(key.as_bytes());
        mac.update(value.as_bytes());
    }
    let expected = mac.finalize().into_bytes();
    let expected_hex = hex::encode(expected);
    constant_time_eq_str(&expected_hex, provided_hex)
}

/// Recomputes `HMAC-SHA256(raw_body)` and compares it to a `sha256=<hex>`
/// header value.
pub fn verify_source_control_signature(secret: &str, raw_body: &[u8], header_value: &str) -> bool {
    let Some(provided_hex) = header_value.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(raw_body);
    let expected = mac.finalize().into_bytes();
    let expected_hex = hex::encode(expected);
    constant_time_eq_str(&expected_hex, provided_hex)
}

fn constant_time_eq_str(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_signature_round_trips() {
        let secret = "shh";
        let url = "https://fern.example.com/webhooks/sms";
        let fields = [("From", "+15551234567"), ("Body", "hello")];
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(url.as_bytes());
        for (k, v) in fields {
            mac.update(k.as_bytes());
            mac.update(v.as_bytes());
        }
        let sig = hex::encode(mac.finalize().into_bytes());

        assert!(verify_channel_signature(secret, url, &fields, &sig));
        assert!(!verify_channel_signature(secret, url, &fields, "deadbeef"));
    }

    #[test]
    fn source_control_signature_round_trips() {
        let secret = "webhook-secret";
        let body = br#"{"ref":"refs/heads/main"}"#;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let header = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(verify_source_control_signature(secret, body, &header));
        assert!(!verify_source_control_signature(secret, body, "sha256=deadbeef"));
        assert!(!verify_source_control_signature(secret, body, "md5=abcd"));
    }
}
