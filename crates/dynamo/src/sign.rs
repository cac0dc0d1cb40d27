//! AWS Signature v4 request signing.
//!
//! Every call is a `POST /` with a JSON-1.0 body; the signature covers
//! (method, canonical path, canonical query, canonical headers, signed
//! headers, hex-sha256 of the body) with credential scope
//! `<date>/<region>/dynamodb/aws4_request`. Derived signing keys are
//! cached date -> region -> service so the HMAC derivation chain is not
//! recomputed per request.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use lru::LruCache;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

pub const SERVICE: &str = "dynamodb";
pub const CONTENT_TYPE: &str = "application/x-amz-json-1.0";
const ALGORITHM: &str = "AWS4-HMAC-SHA256";

const DATE_KEYS: usize = 2;
const REGION_KEYS: usize = 4;
const SERVICE_KEYS: usize = 4;

/// AWS access credentials. The secret is wiped when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    #[zeroize(skip)]
    pub access_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().into()
}

pub fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// URI-encodes every byte except the unreserved characters. Paths are
/// encoded with `encode_slash = false`, then encoded again (the
/// double-encoding rule of the signing scheme).
pub fn uri_encode(input: &str, encode_slash: bool) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => {
                let _ = write!(out, "%{b:02X}");
            }
        }
    }
    out
}

/// Canonical header names joined with `;`. `headers` must already be
/// lowercase-named and sorted.
pub(crate) fn signed_header_names(headers: &[(String, String)]) -> String {
    headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";")
}

pub(crate) fn canonical_request(
    method: &str,
    canonical_uri: &str,
    canonical_query: &str,
    headers: &[(String, String)],
    payload_hash: &str,
) -> String {
    let mut canonical_headers = String::new();
    for (name, value) in headers {
        canonical_headers.push_str(name);
        canonical_headers.push(':');
        canonical_headers.push_str(value.trim());
        canonical_headers.push('\n');
    }
    format!(
        "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{}\n{payload_hash}",
        signed_header_names(headers)
    )
}

pub(crate) fn string_to_sign(timestamp: &str, scope: &str, canonical_request: &str) -> String {
    format!(
        "{ALGORITHM}\n{timestamp}\n{scope}\n{}",
        hex_sha256(canonical_request.as_bytes())
    )
}

pub(crate) fn derive_signing_key(
    secret: &str,
    date: &str,
    region: &str,
    service: &str,
) -> [u8; 32] {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Derived signing keys, cached as three chained LRUs so rolling over a
/// date (or, rarely, region/service) evicts oldest-first.
pub struct SigningKeyCache {
    inner: Mutex<LruCache<String, LruCache<String, LruCache<String, [u8; 32]>>>>,
}

impl SigningKeyCache {
    pub fn new() -> Self {
        SigningKeyCache {
            inner: Mutex::new(LruCache::new(nonzero(DATE_KEYS))),
        }
    }

    pub fn signing_key(&self, secret: &str, date: &str, region: &str, service: &str) -> [u8; 32] {
        let mut dates = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let regions = dates.get_or_insert_mut(date.to_string(), || {
            LruCache::new(nonzero(REGION_KEYS))
        });
        let services = regions.get_or_insert_mut(region.to_string(), || {
            LruCache::new(nonzero(SERVICE_KEYS))
        });
        if let Some(key) = services.get(service) {
            return *key;
        }
        let key = derive_signing_key(secret, date, region, service);
        services.put(service.to_string(), key);
        key
    }
}

impl Default for SigningKeyCache {
    fn default() -> Self {
        SigningKeyCache::new()
    }
}

fn nonzero(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}

/// Headers to attach to a signed request.
pub struct SignedHeaders {
    pub amz_date: String,
    pub authorization: String,
}

/// Signs a DynamoDB `POST /` request.
pub fn sign_dynamo_request(
    credentials: &Credentials,
    cache: &SigningKeyCache,
    region: &str,
    host: &str,
    target: &str,
    now: DateTime<Utc>,
    body: &[u8],
) -> SignedHeaders {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    // Already in canonical (lowercase, sorted) order.
    let headers = vec![
        ("content-type".to_string(), CONTENT_TYPE.to_string()),
        ("host".to_string(), host.to_string()),
        ("x-amz-date".to_string(), amz_date.clone()),
        ("x-amz-target".to_string(), target.to_string()),
    ];
    // The path is double-URI-encoded; for the fixed "/" both passes are
    // the identity.
    let canonical_uri = uri_encode(&uri_encode("/", false), false);
    let canonical =
        canonical_request("POST", &canonical_uri, "", &headers, &hex_sha256(body));
    let scope = format!("{date}/{region}/{SERVICE}/aws4_request");
    let to_sign = string_to_sign(&amz_date, &scope, &canonical);
    let key = cache.signing_key(&credentials.secret_key, &date, region, SERVICE);
    let signature = hex::encode(hmac_sha256(&key, to_sign.as_bytes()));
    let authorization = format!(
        "{ALGORITHM} Credential={}/{scope}, SignedHeaders={}, Signature={signature}",
        credentials.access_key,
        signed_header_names(&headers)
    );
    SignedHeaders {
        amz_date,
        authorization,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    // The documented signing example: GET iam ListUsers, 2015-08-30.
    const EXAMPLE_SECRET: &str = "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY";

    fn example_headers() -> Vec<(String, String)> {
        vec![
            (
                "content-type".to_string(),
                "application/x-www-form-urlencoded; charset=utf-8".to_string(),
            ),
            ("host".to_string(), "iam.amazonaws.com".to_string()),
            ("x-amz-date".to_string(), "20150830T123600Z".to_string()),
        ]
    }

    #[test]
    fn canonical_request_matches_reference_hash() {
        let request = canonical_request(
            "GET",
            "/",
            "Action=ListUsers&Version=2010-05-08",
            &example_headers(),
            &hex_sha256(b""),
        );
        assert_eq!(
            hex_sha256(request.as_bytes()),
            "f536975d06c0309214f805bb90ccff089219ecd68b2577efef23edd43b7e1a59"
        );
    }

    #[test]
    fn signing_key_matches_reference() {
        assert_eq!(
            derive_signing_key(EXAMPLE_SECRET, "20150830", "us-east-1", "iam"),
            hex!("c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9")
        );
    }

    #[test]
    fn signature_matches_reference() {
        let request = canonical_request(
            "GET",
            "/",
            "Action=ListUsers&Version=2010-05-08",
            &example_headers(),
            &hex_sha256(b""),
        );
        let to_sign = string_to_sign(
            "20150830T123600Z",
            "20150830/us-east-1/iam/aws4_request",
            &request,
        );
        let key = derive_signing_key(EXAMPLE_SECRET, "20150830", "us-east-1", "iam");
        assert_eq!(
            hex::encode(hmac_sha256(&key, to_sign.as_bytes())),
            "5d672d79c15b13162d9279b0855cfba6789a8edb4c82c400e06b5924a6f2b5d7"
        );
    }

    #[test]
    fn cache_returns_derived_key() {
        let cache = SigningKeyCache::new();
        let fresh = cache.signing_key(EXAMPLE_SECRET, "20150830", "us-east-1", "iam");
        let cached = cache.signing_key(EXAMPLE_SECRET, "20150830", "us-east-1", "iam");
        assert_eq!(fresh, cached);
        assert_eq!(
            fresh,
            derive_signing_key(EXAMPLE_SECRET, "20150830", "us-east-1", "iam")
        );
    }

    #[test]
    fn uri_encode_rules() {
        assert_eq!(uri_encode("a/b c", false), "a/b%20c");
        assert_eq!(uri_encode("a/b c", true), "a%2Fb%20c");
        assert_eq!(uri_encode("A-z_0.~", true), "A-z_0.~");
    }

    #[test]
    fn dynamo_request_headers_are_well_formed() {
        let credentials = Credentials {
            access_key: "AKIDEXAMPLE".to_string(),
            secret_key: EXAMPLE_SECRET.to_string(),
        };
        let cache = SigningKeyCache::new();
        let now = DateTime::parse_from_rfc3339("2015-08-30T12:36:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let signed = sign_dynamo_request(
            &credentials,
            &cache,
            "us-east-1",
            "dynamodb.us-east-1.amazonaws.com",
            "DynamoDB_20120810.PutItem",
            now,
            b"{}",
        );
        assert_eq!(signed.amz_date, "20150830T123600Z");
        assert!(signed.authorization.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/dynamodb/aws4_request, \
             SignedHeaders=content-type;host;x-amz-date;x-amz-target, Signature="
        ));
    }
}
