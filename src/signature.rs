//! C2: constant-time HMAC verification over a raw body, and the bespoke
//! `scalr-signature` scheme (HMAC-SHA1 + timestamp freshness window).

use crate::error::SignatureError;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmacAlgo {
    Sha1,
    Sha256,
    Sha512,
}

impl HmacAlgo {
    fn prefix(self) -> &'static str {
        match self {
            HmacAlgo::Sha1 => "sha1=",
            HmacAlgo::Sha256 => "sha256=",
            HmacAlgo::Sha512 => "sha512=",
        }
    }
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

fn verify_one(algo: HmacAlgo, secret: &[u8], body: &[u8], signature: &[u8]) -> bool {
    match algo {
        HmacAlgo::Sha1 => Hmac::<Sha1>::new_from_slice(secret)
            .map(|mut m| {
                m.update(body);
                m.verify_slice(signature).is_ok()
            })
            .unwrap_or(false),
        HmacAlgo::Sha256 => Hmac::<Sha256>::new_from_slice(secret)
            .map(|mut m| {
                m.update(body);
                m.verify_slice(signature).is_ok()
            })
            .unwrap_or(false),
        HmacAlgo::Sha512 => Hmac::<Sha512>::new_from_slice(secret)
            .map(|mut m| {
                m.update(body);
                m.verify_slice(signature).is_ok()
            })
            .unwrap_or(false),
    }
}

/// Verifies `header_value` (optionally `algo=`-prefixed, optionally a
/// comma-separated list of candidates) against `HMAC(secret, body)` for
/// every configured secret. `hmac::Mac::verify_slice` is constant-time in
/// the signature bytes, so the overall check does not leak timing
/// information about which byte first differed.
///
/// Returns the index of the secret that matched.
pub fn verify_hmac(
    algo: HmacAlgo,
    body: &[u8],
    header_value: Option<&str>,
    secrets: &[Vec<u8>],
) -> Result<usize, SignatureError> {
    if secrets.is_empty() {
        return Err(SignatureError::NoSecrets);
    }
    let Some(header_value) = header_value else {
        return Err(SignatureError::HeaderMissing);
    };
    let candidates: Vec<&str> = header_value.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    if candidates.is_empty() {
        return Err(SignatureError::HeaderMissing);
    }

    let mut any_well_formed = false;
    for candidate in &candidates {
        let stripped = candidate.strip_prefix(algo.prefix()).unwrap_or(candidate);
        let Some(sig_bytes) = hex_decode(stripped) else { continue };
        any_well_formed = true;
        for (index, secret) in secrets.iter().enumerate() {
            if verify_one(algo, secret, body, &sig_bytes) {
                return Ok(index);
            }
        }
    }
    if !any_well_formed {
        return Err(SignatureError::HeaderMalformed);
    }
    Err(SignatureError::Mismatch)
}

const SCALR_FRESHNESS: Duration = Duration::from_secs(5 * 60);

/// `scalr-signature`: signature = base64(HMAC-SHA1(secret, date + '\n' +
/// method + '\n' + path + '\n' + body)); the Date header must be within
/// five minutes of now.
pub fn verify_scalr(
    secret: &[u8],
    date_header: Option<&str>,
    method: &str,
    path: &str,
    body: &[u8],
    signature_b64: Option<&str>,
    now: OffsetDateTime,
) -> Result<(), SignatureError> {
    let date_header = date_header.ok_or(SignatureError::HeaderMissing)?;
    let signature_b64 = signature_b64.ok_or(SignatureError::HeaderMissing)?;

    let request_time = httpdate::parse_http_date(date_header).map_err(|_| SignatureError::StaleTimestamp)?;
    let request_time = OffsetDateTime::from(request_time);
    let drift = if request_time > now { request_time - now } else { now - request_time };
    if drift.unsigned_abs() > SCALR_FRESHNESS {
        return Err(SignatureError::StaleTimestamp);
    }

    use base64::Engine;
    let signature = base64::engine::general_purpose::STANDARD
        .decode(signature_b64)
        .map_err(|_| SignatureError::HeaderMalformed)?;

    let mut mac = Hmac::<Sha1>::new_from_slice(secret).map_err(|_| SignatureError::NoSecrets)?;
    mac.update(date_header.as_bytes());
    mac.update(b"\n");
    mac.update(method.as_bytes());
    mac.update(b"\n");
    mac.update(path.as_bytes());
    mac.update(b"\n");
    mac.update(body);
    mac.verify_slice(&signature).map_err(|_| SignatureError::Mismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_hmac_sha256(secret: &[u8], body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret).unwrap();
        mac.update(body);
        mac.finalize().into_bytes().iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn verifies_prefixed_sha256_signature() {
        let body = br#"{"a":1}"#;
        let sig = hex_hmac_sha256(b"top", body);
        let header = format!("sha256={sig}");
        let result = verify_hmac(HmacAlgo::Sha256, body, Some(&header), &[b"top".to_vec()]);
        assert!(result.is_ok());
    }

    #[test]
    fn rejects_wrong_signature() {
        let body = br#"{"a":1}"#;
        let header = "sha256=deadbeef";
        let result = verify_hmac(HmacAlgo::Sha256, body, Some(header), &[b"top".to_vec()]);
        assert_eq!(result, Err(SignatureError::Mismatch));
    }

    #[test]
    fn missing_header_is_distinct_from_mismatch() {
        let result = verify_hmac(HmacAlgo::Sha256, b"x", None, &[b"top".to_vec()]);
        assert_eq!(result, Err(SignatureError::HeaderMissing));
    }

    #[test]
    fn no_secrets_configured_is_reported() {
        let result = verify_hmac(HmacAlgo::Sha256, b"x", Some("sha256=ab"), &[]);
        assert_eq!(result, Err(SignatureError::NoSecrets));
    }

    #[test]
    fn accepts_any_matching_secret_in_a_comma_separated_list() {
        let body = b"payload";
        let good = hex_hmac_sha256(b"second", body);
        let header = format!("sha256=00000000,sha256={good}");
        let result = verify_hmac(HmacAlgo::Sha256, body, Some(&header), &[b"first".to_vec(), b"second".to_vec()]);
        assert!(result.is_ok());
    }
}
