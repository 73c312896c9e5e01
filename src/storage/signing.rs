//! Time-limited access URLs for stored artifacts.
//!
//! URLs have the form `{base}/{path}?expires={unix}&signature={hex}` where the
//! signature is HMAC-SHA256, keyed with the signing secret, over the encoded
//! URL path and the expiry. Verification works on the URL as presented, so
//! the media host never needs to decode object keys.

use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SigningError {
    #[error("Invalid public base URL '{0}'")]
    InvalidBaseUrl(String),

    #[error("Invalid signing secret")]
    InvalidSecret,

    #[error("Not a URL for this media host: {0}")]
    ForeignUrl(String),

    #[error("Missing or malformed '{0}' parameter")]
    MalformedParameter(&'static str),

    #[error("URL expired at {0}")]
    Expired(DateTime<Utc>),

    #[error("Signature does not match")]
    BadSignature,
}

/// A signed URL and the moment it stops working
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Signs and verifies artifact URLs
#[derive(Clone)]
pub struct UrlSigner {
    base: Url,
    mac: HmacSha256,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner")
            .field("base", &self.base.as_str())
            .finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(base_url: &str, secret: impl AsRef<[u8]>) -> Result<Self, SigningError> {
        let base = Url::parse(base_url)
            .map_err(|_| SigningError::InvalidBaseUrl(base_url.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(SigningError::InvalidBaseUrl(base_url.to_string()));
        }

        let mac = HmacSha256::new_from_slice(secret.as_ref())
            .map_err(|_| SigningError::InvalidSecret)?;

        Ok(Self { base, mac })
    }

    /// Sign `path` for `ttl` starting at `now`
    pub fn sign_at(&self, path: &str, ttl: Duration, now: DateTime<Utc>) -> SignedUrl {
        let expires_at = now + ttl;
        let expires = expires_at.timestamp();

        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty();
            segments.extend(path.split('/').filter(|s| !s.is_empty()));
        }
        let signature = hex::encode(self.mac_for(url.path(), expires).finalize().into_bytes());
        url.query_pairs_mut()
            .append_pair("expires", &expires.to_string())
            .append_pair("signature", &signature);

        SignedUrl {
            url: url.to_string(),
            expires_at: Utc
                .timestamp_opt(expires, 0)
                .single()
                .unwrap_or(expires_at),
        }
    }

    pub fn sign(&self, path: &str, ttl: Duration) -> SignedUrl {
        self.sign_at(path, ttl, Utc::now())
    }

    /// Check a URL issued by this signer; returns when it stops working.
    /// The signature comparison is constant-time.
    pub fn verify_at(&self, url: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, SigningError> {
        let parsed = Url::parse(url).map_err(|_| SigningError::ForeignUrl(url.to_string()))?;
        let base_path = self.base.path().trim_end_matches('/');
        if parsed.origin() != self.base.origin()
            || !parsed
                .path()
                .strip_prefix(base_path)
                .is_some_and(|rest| rest.starts_with('/'))
        {
            return Err(SigningError::ForeignUrl(url.to_string()));
        }

        let param = |name: &'static str| {
            parsed
                .query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
                .ok_or(SigningError::MalformedParameter(name))
        };
        let expires: i64 = param("expires")?
            .parse()
            .map_err(|_| SigningError::MalformedParameter("expires"))?;
        let signature = hex::decode(param("signature")?)
            .map_err(|_| SigningError::MalformedParameter("signature"))?;

        self.mac_for(parsed.path(), expires)
            .verify_slice(&signature)
            .map_err(|_| SigningError::BadSignature)?;

        let expires_at = Utc
            .timestamp_opt(expires, 0)
            .single()
            .ok_or(SigningError::MalformedParameter("expires"))?;
        if now > expires_at {
            return Err(SigningError::Expired(expires_at));
        }
        Ok(expires_at)
    }

    pub fn verify(&self, url: &str) -> Result<DateTime<Utc>, SigningError> {
        self.verify_at(url, Utc::now())
    }

    fn mac_for(&self, url_path: &str, expires: i64) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(url_path.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> UrlSigner {
        UrlSigner::new("https://media.example.com/files/", "test-secret").unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_signed_url_shape() {
        let signed = signer().sign_at(
            "acme/voice-notes/converted/note1.ogg",
            Duration::minutes(10),
            now(),
        );

        assert!(signed
            .url
            .starts_with("https://media.example.com/files/acme/voice-notes/converted/note1.ogg?expires=1700000600&signature="));
        assert_eq!(signed.expires_at.timestamp(), 1_700_000_600);
    }

    #[test]
    fn test_verify_accepts_own_signature() {
        let signer = signer();
        let signed = signer.sign_at("a/voice-notes/converted/my note.ogg", Duration::minutes(5), now());

        assert_eq!(signer.verify_at(&signed.url, now()), Ok(signed.expires_at));
    }

    #[test]
    fn test_verify_rejects_tampering() {
        let signer = signer();
        let signed = signer.sign_at("a/voice-notes/converted/x.ogg", Duration::minutes(5), now());

        let other_object = signed.url.replace("/x.ogg", "/y.ogg");
        assert_eq!(
            signer.verify_at(&other_object, now()),
            Err(SigningError::BadSignature)
        );

        let extended = signed.url.replace("expires=1700000300", "expires=1900000300");
        assert_eq!(
            signer.verify_at(&extended, now()),
            Err(SigningError::BadSignature)
        );

        let other_key = UrlSigner::new("https://media.example.com/files/", "other-secret").unwrap();
        assert_eq!(
            other_key.verify_at(&signed.url, now()),
            Err(SigningError::BadSignature)
        );
    }

    #[test]
    fn test_verify_rejects_expired_and_foreign() {
        let signer = signer();
        let signed = signer.sign_at("a/voice-notes/converted/x.ogg", Duration::minutes(5), now());

        assert!(matches!(
            signer.verify_at(&signed.url, now() + Duration::minutes(6)),
            Err(SigningError::Expired(_))
        ));

        let foreign = signed.url.replace("media.example.com", "evil.example.com");
        assert!(matches!(
            signer.verify_at(&foreign, now()),
            Err(SigningError::ForeignUrl(_))
        ));

        let unsigned = "https://media.example.com/files/a/voice-notes/converted/x.ogg?expires=1700000300";
        assert_eq!(
            signer.verify_at(unsigned, now()),
            Err(SigningError::MalformedParameter("signature"))
        );
    }

    #[test]
    fn test_rejects_non_base_url() {
        assert!(UrlSigner::new("mailto:someone@example.com", "s").is_err());
        assert!(UrlSigner::new("not a url", "s").is_err());
    }
}
