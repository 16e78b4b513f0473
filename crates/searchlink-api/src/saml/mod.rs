//! SAML 2.0 service-provider machinery.
//!
//! Two flows, both driven by the appliance:
//! - Web-browser SSO: unauthenticated content requests redirect to the
//!   appliance's identity provider (HTTP-Redirect binding) and the
//!   assertion comes back to `/samlassertionconsumer` (HTTP-POST binding).
//! - Batched authorization: the appliance posts a SOAP batch of
//!   `AuthzDecisionQuery` elements to `/saml-authz`.
//!
//! Message trust sits behind [`TrustVerifier`] so deployments can choose
//! between relying on the mutually-authenticated TLS channel and
//! requiring enveloped signatures.

pub mod authn;
pub mod authz;
pub mod message;
pub mod metadata;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;

use metadata::SamlMetadata;

/// Session slot holding the authenticated principal.
pub const PRINCIPAL_SLOT: &str = "authn:principal";

/// Session slot holding the in-flight authentication record.
pub const PENDING_SLOT: &str = "authn:pending";

/// How far apart the appliance clock may drift from ours.
pub const CLOCK_SKEW_SECS: i64 = 5 * 60;

/// SAML processing errors.
#[derive(Debug, Error)]
pub enum SamlError {
    #[error("malformed SAML message: {0}")]
    Malformed(String),

    #[error("SAML XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("SAML validation failed: {0}")]
    Validation(String),
}

/// One authentication round-trip awaiting its assertion.
#[derive(Debug, Clone)]
pub struct PendingAuthn {
    /// The `ID` we sent in the `AuthnRequest`; the response must quote it
    /// in `InResponseTo`, once.
    pub request_id: String,
    /// Opaque token round-tripped through the identity provider.
    pub relay_state: String,
    /// Where to send the user-agent after authentication.
    pub original_url: String,
    pub issued_at: DateTime<Utc>,
}

/// Decides whether a decoded `Response` is trustworthy.
pub trait TrustVerifier: Send + Sync {
    fn verify(&self, raw_response: &[u8], parsed: &message::AuthnResponse)
        -> Result<(), SamlError>;
}

/// Trusts the transport: suitable when the appliance connects over
/// mutually-authenticated TLS and nothing else can reach the endpoint.
#[derive(Debug, Default)]
pub struct ChannelTrustVerifier;

impl TrustVerifier for ChannelTrustVerifier {
    fn verify(&self, _raw: &[u8], _parsed: &message::AuthnResponse) -> Result<(), SamlError> {
        Ok(())
    }
}

/// Requires an enveloped `ds:Signature` and checks its SHA-256 reference
/// digest: the `DigestValue` must match the digest of the document with
/// the signature element removed. Verification of the `SignatureValue`
/// itself (key material, canonicalization) stays with the signing
/// deployment.
#[derive(Debug, Default)]
pub struct SignaturePresenceVerifier;

impl TrustVerifier for SignaturePresenceVerifier {
    fn verify(&self, raw: &[u8], parsed: &message::AuthnResponse) -> Result<(), SamlError> {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;
        use sha2::{Digest, Sha256};

        if !parsed.has_signature {
            return Err(SamlError::Validation(
                "response carries no signature".to_string(),
            ));
        }
        let digest_value = parsed.digest_value.as_deref().ok_or_else(|| {
            SamlError::Validation("signature carries no reference digest".to_string())
        })?;
        if let Some(method) = parsed.digest_method.as_deref() {
            if !method.ends_with("sha256") {
                return Err(SamlError::Validation(format!(
                    "unsupported digest algorithm {method}"
                )));
            }
        }

        let text = std::str::from_utf8(raw)
            .map_err(|_| SamlError::Malformed("response is not UTF-8".to_string()))?;
        let signed_content = message::strip_signature_element(text);
        let computed = BASE64.encode(Sha256::digest(signed_content.as_bytes()));
        if computed == digest_value {
            Ok(())
        } else {
            Err(SamlError::Validation(
                "signature digest does not match the signed content".to_string(),
            ))
        }
    }
}

/// The service-provider side of both SAML flows.
pub struct SamlProvider {
    pub metadata: SamlMetadata,
    pub verifier: Arc<dyn TrustVerifier>,
}

impl SamlProvider {
    pub fn new(metadata: SamlMetadata, verifier: Arc<dyn TrustVerifier>) -> Self {
        Self { metadata, verifier }
    }
}

// ============================================================
// One-time process-wide bootstrap
// ============================================================

static MESSAGE_ID_PREFIX: Mutex<Option<String>> = Mutex::new(None);

/// One-time process-wide SAML initialization: seeds the message-id space
/// for this process. Returns false when already bootstrapped.
pub fn bootstrap() -> bool {
    let mut prefix = MESSAGE_ID_PREFIX.lock().expect("bootstrap lock poisoned");
    if prefix.is_some() {
        return false;
    }
    use rand::RngCore;
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    *prefix = Some(format!("_{}", hex::encode(bytes)));
    true
}

/// The process-wide message-id prefix; bootstraps on first use.
pub(crate) fn message_id_prefix() -> String {
    {
        let prefix = MESSAGE_ID_PREFIX.lock().expect("bootstrap lock poisoned");
        if let Some(prefix) = prefix.as_ref() {
            return prefix.clone();
        }
    }
    bootstrap();
    MESSAGE_ID_PREFIX
        .lock()
        .expect("bootstrap lock poisoned")
        .clone()
        .unwrap_or_else(|| "_sl".to_string())
}

/// Tears the bootstrap down. Only tests call this.
pub fn reset_bootstrap_for_tests() {
    *MESSAGE_ID_PREFIX.lock().expect("bootstrap lock poisoned") = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn digest_verifier_accepts_matching_digest_and_rejects_tampering() {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;
        use sha2::{Digest, Sha256};

        let before =
            r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="_r">"#;
        let after = concat!(
            r#"<Assertion ID="_a"><Subject><NameID>alice</NameID></Subject></Assertion>"#,
            r#"</samlp:Response>"#,
        );
        let digest = BASE64.encode(Sha256::digest(format!("{before}{after}").as_bytes()));
        let signature = format!(
            concat!(
                r#"<ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#">"#,
                r#"<ds:SignedInfo><ds:Reference URI="">"#,
                r#"<ds:DigestMethod Algorithm="http://www.w3.org/2001/04/xmlenc#sha256"/>"#,
                r#"<ds:DigestValue>{digest}</ds:DigestValue>"#,
                r#"</ds:Reference></ds:SignedInfo>"#,
                r#"<ds:SignatureValue>opaque</ds:SignatureValue></ds:Signature>"#,
            ),
            digest = digest
        );
        let signed = format!("{before}{signature}{after}");

        let parsed = message::parse_authn_response(signed.as_bytes()).unwrap();
        SignaturePresenceVerifier
            .verify(signed.as_bytes(), &parsed)
            .unwrap();

        // Any change to the signed content invalidates the digest.
        let tampered = signed.replace("alice", "mallory");
        let parsed = message::parse_authn_response(tampered.as_bytes()).unwrap();
        let err = SignaturePresenceVerifier
            .verify(tampered.as_bytes(), &parsed)
            .unwrap_err();
        assert!(err.to_string().contains("digest"), "{err}");
    }

    #[test]
    fn digest_verifier_requires_signature_and_digest() {
        let unsigned =
            r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="_r"/>"#;
        let parsed = message::parse_authn_response(unsigned.as_bytes()).unwrap();
        let err = SignaturePresenceVerifier
            .verify(unsigned.as_bytes(), &parsed)
            .unwrap_err();
        assert!(err.to_string().contains("no signature"), "{err}");

        // A signature without a reference digest is also refused.
        let digestless = concat!(
            r#"<samlp:Response ID="_r"><ds:Signature xmlns:ds="x">"#,
            r#"<ds:SignatureValue>s</ds:SignatureValue></ds:Signature></samlp:Response>"#,
        );
        let parsed = message::parse_authn_response(digestless.as_bytes()).unwrap();
        let err = SignaturePresenceVerifier
            .verify(digestless.as_bytes(), &parsed)
            .unwrap_err();
        assert!(err.to_string().contains("digest"), "{err}");
    }

    #[test]
    #[serial]
    fn bootstrap_runs_once() {
        reset_bootstrap_for_tests();
        assert!(bootstrap());
        assert!(!bootstrap());
        let prefix = message_id_prefix();
        assert!(prefix.starts_with('_'));
        assert_eq!(prefix, message_id_prefix());
        reset_bootstrap_for_tests();
    }
}
