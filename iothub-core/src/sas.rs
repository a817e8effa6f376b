//! Shared access signature tokens
//!
//! Token layout:
//! `SharedAccessSignature sr=<resource>&sig=<signature>&se=<expiry>[&skn=<key name>]`
//! where the signature is HMAC-SHA256 over `<url-encoded resource>\n<expiry>`
//! keyed by the base64-decoded device key.

use crate::http::{HttpExecutor, HttpRequest, HttpResponse};
use crate::time::TimeSource;
use crate::{Error, Result};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Lifetime of tokens minted per request by [`SasSigner`]
pub const SIGNER_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Build a SAS token for `resource` expiring at `expiry` (seconds since epoch)
pub fn create_token(key: &str, resource: &str, key_name: &str, expiry: i64) -> Result<String> {
    if key.is_empty() {
        return Err(Error::InvalidArg("SAS key cannot be empty".to_string()));
    }
    if resource.is_empty() {
        return Err(Error::InvalidArg("SAS resource cannot be empty".to_string()));
    }

    let decoded_key = decode_base64(key)?;
    let encoded_resource = url_encode(resource);
    let string_to_sign = format!("{}\n{}", encoded_resource, expiry);

    let mut mac = HmacSha256::new_from_slice(&decoded_key)
        .map_err(|e| Error::Crypto(format!("Invalid key length: {}", e)))?;
    mac.update(string_to_sign.as_bytes());
    let signature = encode_base64(&mac.finalize().into_bytes());

    let mut token = format!(
        "SharedAccessSignature sr={}&sig={}&se={}",
        encoded_resource,
        url_encode(&signature),
        expiry
    );
    if !key_name.is_empty() {
        token.push_str("&skn=");
        token.push_str(key_name);
    }
    Ok(token)
}

/// Percent-encode a string for use in a SAS token or request path
pub fn url_encode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

pub fn encode_base64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

pub fn decode_base64(s: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| Error::Crypto(format!("Invalid base64: {}", e)))
}

/// Signs every request with a fresh token derived from a device key
#[derive(Clone)]
pub struct SasSigner {
    key: String,
    uri_resource: String,
    key_name: String,
}

impl SasSigner {
    pub fn new(
        key: impl Into<String>,
        uri_resource: impl Into<String>,
        key_name: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            uri_resource: uri_resource.into(),
            key_name: key_name.into(),
        }
    }

    pub fn uri_resource(&self) -> &str {
        &self.uri_resource
    }

    /// Authorization header value for a request issued at `now`
    pub fn authorization(&self, now: i64) -> Result<String> {
        create_token(
            &self.key,
            &self.uri_resource,
            &self.key_name,
            now + SIGNER_TOKEN_LIFETIME_SECS,
        )
    }

    /// Execute `request` with its `Authorization` header replaced by a new token
    pub fn execute_signed(
        &self,
        executor: &mut dyn HttpExecutor,
        clock: &dyn TimeSource,
        request: &HttpRequest<'_>,
    ) -> Result<HttpResponse> {
        let now = clock.now().ok_or(Error::Clock)?;
        let mut headers = request.headers.clone();
        headers.add(crate::protocol::HEADER_AUTHORIZATION, self.authorization(now)?)?;

        debug!(resource = %self.uri_resource, "Executing signed request");
        executor.execute(&HttpRequest {
            headers: &headers,
            ..*request
        })
    }
}

impl fmt::Debug for SasSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SasSigner")
            .field("uri_resource", &self.uri_resource)
            .field("key_name", &self.key_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpHeaders, HttpMethod, OptionValue};
    use crate::time::ManualClock;

    const KEY: &str = "c2VjcmV0LWRldmljZS1rZXk=";

    fn field<'a>(token: &'a str, name: &str) -> Option<&'a str> {
        token
            .trim_start_matches("SharedAccessSignature ")
            .split('&')
            .find_map(|pair| pair.strip_prefix(name)?.strip_prefix('='))
    }

    #[test]
    fn test_token_layout() {
        let token = create_token(KEY, "myhub.azure-devices.net/devices/dev1", "", 1_700_003_600)
            .unwrap();

        assert!(token.starts_with("SharedAccessSignature sr="));
        assert_eq!(
            field(&token, "sr"),
            Some("myhub.azure-devices.net%2Fdevices%2Fdev1")
        );
        assert_eq!(field(&token, "se"), Some("1700003600"));
        assert!(field(&token, "skn").is_none());
    }

    #[test]
    fn test_signature_matches_hmac() {
        let resource = "myhub.azure-devices.net/devices/dev1";
        let token = create_token(KEY, resource, "device", 42).unwrap();

        let mut mac = HmacSha256::new_from_slice(&decode_base64(KEY).unwrap()).unwrap();
        mac.update(format!("{}\n42", url_encode(resource)).as_bytes());
        let expected = url_encode(&encode_base64(&mac.finalize().into_bytes()));

        assert_eq!(field(&token, "sig"), Some(expected.as_str()));
        assert_eq!(field(&token, "skn"), Some("device"));
    }

    #[test]
    fn test_invalid_key() {
        assert!(matches!(
            create_token("not base64!", "res", "", 1),
            Err(Error::Crypto(_))
        ));
        assert!(matches!(
            create_token("", "res", "", 1),
            Err(Error::InvalidArg(_))
        ));
    }

    struct Capture {
        authorization: Option<String>,
    }

    impl HttpExecutor for Capture {
        fn execute(&mut self, request: &HttpRequest<'_>) -> Result<HttpResponse> {
            self.authorization = request.headers.get("Authorization").map(str::to_string);
            Ok(HttpResponse {
                status: 204,
                ..Default::default()
            })
        }

        fn set_option(&mut self, _name: &str, _value: &OptionValue) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_execute_signed_replaces_authorization() {
        let signer = SasSigner::new(KEY, "myhub.azure-devices.net/devices/dev1", "");
        let clock = ManualClock::new(1_000);
        let mut executor = Capture {
            authorization: None,
        };
        let mut headers = HttpHeaders::new();
        headers.add("Authorization", " ").unwrap();

        let request = HttpRequest {
            method: HttpMethod::Get,
            relative_path: "/devices/dev1/messages/devicebound",
            headers: &headers,
            body: None,
        };
        signer.execute_signed(&mut executor, &clock, &request).unwrap();

        let auth = executor.authorization.take().unwrap();
        assert_eq!(field(&auth, "se"), Some("4600"));
        assert_eq!(headers.get("Authorization"), Some(" "));

        clock.set_available(false);
        assert!(matches!(
            signer.execute_signed(&mut executor, &clock, &request),
            Err(Error::Clock)
        ));
    }
}
