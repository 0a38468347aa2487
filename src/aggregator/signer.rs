//! HMAC-SHA256 request signing.
//!
//! Each exchange defines its own canonical payload; the exact byte layout
//! matters, exchanges reject any deviation.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Hex digest of `payload` keyed by `secret`. Pure function, no clock access;
/// callers bake timestamps into the payload themselves.
pub fn sign_hex(secret: &str, payload: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// URL-encode query parameters in the given order.
pub fn encode_query(params: &[(&str, String)]) -> String {
    serde_urlencoded::to_string(params).unwrap_or_default()
}

/// Binance canonicalization: the signature is computed over the encoded query
/// string (which already carries `timestamp` and `recvWindow`) and appended
/// as one more parameter.
pub fn binance_signed_query(secret: &str, query: &str) -> String {
    let signature = sign_hex(secret, query);
    format!("{query}&signature={signature}")
}

/// Bybit v5 canonicalization for GET requests:
/// `{timestamp}{api_key}{recv_window}{query_string}`.
pub fn bybit_sign_payload(timestamp_ms: i64, api_key: &str, recv_window: u64, query: &str) -> String {
    format!("{timestamp_ms}{api_key}{recv_window}{query}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_digest_is_hex_sha256() {
        let digest = sign_hex("secret", "payload");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn binance_query_known_vector() {
        // Example from the Binance signed-endpoint docs.
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        let signed = binance_signed_query(secret, query);
        assert!(signed.ends_with(
            "&signature=c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        ));
    }

    #[test]
    fn bybit_payload_ordering() {
        let payload = bybit_sign_payload(1_658_385_579_423, "key", 5_000, "category=linear");
        assert_eq!(payload, "1658385579423key5000category=linear");
    }

    #[test]
    fn encode_query_preserves_order() {
        let query = encode_query(&[("b", "2".into()), ("a", "1".into())]);
        assert_eq!(query, "b=2&a=1");
    }
}
