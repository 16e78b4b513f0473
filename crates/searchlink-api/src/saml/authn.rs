//! Web-browser SSO: issuing `AuthnRequest`s and consuming assertions.
//!
//! Per-session states: no principal (unauthenticated), a pending record
//! in the session (request in flight), principal stored (authenticated).
//! Any validation failure clears the in-flight record and answers 403.

use std::sync::Arc;

use axum::extract::{Form, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use searchlink_core::{percent_encode, Principal};
use searchlink_server::SessionManager;

use crate::http::state::AppState;

use super::message::{
    compose_authn_request, encode_redirect_payload, is_success_status, parse_authn_response,
    random_message_id,
};
use super::{PendingAuthn, SamlError, SamlProvider, CLOCK_SKEW_SECS, PENDING_SLOT, PRINCIPAL_SLOT};

/// HTTP-POST binding form fields.
#[derive(Debug, Deserialize)]
pub struct AssertionConsumerForm {
    #[serde(rename = "SAMLResponse")]
    pub saml_response: String,
    #[serde(rename = "RelayState")]
    pub relay_state: Option<String>,
}

impl SamlProvider {
    /// Starts the SSO round-trip: records the in-flight request in the
    /// session and 302s the user-agent to the identity provider.
    pub fn start_authentication(
        &self,
        sessions: &SessionManager,
        cookie_header: Option<&str>,
        original_url: &str,
    ) -> Response {
        let Some(handle) = sessions.get_session(cookie_header, true) else {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        };

        let request_id = random_message_id();
        let relay_state = random_message_id();
        let xml = match compose_authn_request(&self.metadata, &request_id, Utc::now()) {
            Ok(xml) => xml,
            Err(err) => {
                warn!(%err, "failed to compose authentication request");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };
        let payload = match encode_redirect_payload(&xml) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "failed to encode authentication request");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        handle.session.put(
            PENDING_SLOT,
            PendingAuthn {
                request_id,
                relay_state: relay_state.clone(),
                original_url: original_url.to_string(),
                issued_at: Utc::now(),
            },
        );

        let location = format!(
            "{}?SAMLRequest={}&RelayState={}",
            self.metadata.idp_sso_url(),
            percent_encode(&payload),
            percent_encode(&relay_state),
        );
        debug!(location, "redirecting user-agent to identity provider");

        let mut response = (StatusCode::FOUND, ()).into_response();
        response
            .headers_mut()
            .insert(header::LOCATION, location.parse().expect("valid location"));
        if handle.created {
            response.headers_mut().insert(
                header::SET_COOKIE,
                sessions
                    .cookie_for(&handle.session)
                    .parse()
                    .expect("valid cookie"),
            );
        }
        response
    }

    /// Consumes a posted assertion: on success the session gains its
    /// principal and the user-agent returns to the original URL.
    pub fn consume_assertion(
        &self,
        sessions: &SessionManager,
        cookie_header: Option<&str>,
        form: &AssertionConsumerForm,
    ) -> Response {
        let Some(handle) = sessions.get_session(cookie_header, false) else {
            warn!("assertion posted without a session");
            return StatusCode::FORBIDDEN.into_response();
        };

        // One-shot consumption: whatever happens next, this in-flight
        // record can never match again.
        let Some(pending) = handle.session.take::<PendingAuthn>(PENDING_SLOT) else {
            warn!("assertion posted with no authentication in flight");
            return StatusCode::FORBIDDEN.into_response();
        };

        match self.validate_assertion(form, &pending) {
            Ok(principal) => {
                debug!(user = %principal.username, "authentication completed");
                handle.session.put(PRINCIPAL_SLOT, principal);
                let mut response = (StatusCode::FOUND, ()).into_response();
                response.headers_mut().insert(
                    header::LOCATION,
                    pending
                        .original_url
                        .parse()
                        .unwrap_or_else(|_| "/".parse().expect("valid fallback")),
                );
                response
            }
            Err(err) => {
                warn!(%err, "rejecting SAML assertion");
                StatusCode::FORBIDDEN.into_response()
            }
        }
    }

    fn validate_assertion(
        &self,
        form: &AssertionConsumerForm,
        pending: &PendingAuthn,
    ) -> Result<Principal, SamlError> {
        if let Some(relay_state) = form.relay_state.as_deref() {
            if relay_state != pending.relay_state {
                return Err(SamlError::Validation("relay state mismatch".to_string()));
            }
        }

        let raw = BASE64
            .decode(form.saml_response.as_bytes())
            .map_err(|e| SamlError::Malformed(format!("base64: {e}")))?;
        let parsed = parse_authn_response(&raw)?;

        if parsed.in_response_to.as_deref() != Some(pending.request_id.as_str()) {
            return Err(SamlError::Validation(
                "InResponseTo does not match any pending request".to_string(),
            ));
        }
        if parsed.issuer.as_deref() != Some(self.metadata.idp_entity_id().as_str()) {
            return Err(SamlError::Validation(format!(
                "untrusted issuer {:?}",
                parsed.issuer
            )));
        }
        match parsed.destination.as_deref() {
            Some(destination) if destination == self.metadata.assertion_consumer_url() => {}
            other => {
                return Err(SamlError::Validation(format!(
                    "wrong destination {other:?}"
                )))
            }
        }
        if !is_success_status(parsed.status_code.as_deref()) {
            return Err(SamlError::Validation(format!(
                "identity provider reported {:?}",
                parsed.status_code
            )));
        }

        let now = Utc::now();
        let skew = ChronoDuration::seconds(CLOCK_SKEW_SECS);
        if let Some(not_before) = parsed.not_before {
            if now + skew < not_before {
                return Err(SamlError::Validation("assertion not yet valid".to_string()));
            }
        }
        if let Some(not_on_or_after) = parsed.not_on_or_after {
            if now - skew >= not_on_or_after {
                return Err(SamlError::Validation("assertion expired".to_string()));
            }
        }

        self.verifier.verify(&raw, &parsed)?;

        let username = parsed
            .name_id
            .filter(|name| !name.is_empty())
            .ok_or_else(|| SamlError::Validation("assertion names no subject".to_string()))?;
        let mut principal = Principal::new(username);
        principal.groups = parsed.groups.into_iter().collect();
        principal.password = parsed.password;
        Ok(principal)
    }
}

/// `POST /samlassertionconsumer`
pub async fn assertion_consumer(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<AssertionConsumerForm>,
) -> Response {
    let Some(provider) = &state.saml else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let cookie = headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok());
    provider.consume_assertion(&state.sessions, cookie, &form)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::metadata::SamlMetadata;
    use crate::saml::ChannelTrustVerifier;

    fn provider() -> SamlProvider {
        SamlProvider::new(
            SamlMetadata::new("adaptor.example.com", 5678, true, "gsa.example.com"),
            Arc::new(ChannelTrustVerifier),
        )
    }

    fn pending() -> PendingAuthn {
        PendingAuthn {
            request_id: "_req1".to_string(),
            relay_state: "_relay1".to_string(),
            original_url: "https://adaptor.example.com:5678/doc/secret".to_string(),
            issued_at: Utc::now(),
        }
    }

    fn response_xml(in_response_to: &str, issuer: &str) -> String {
        let now = Utc::now();
        let not_before = (now - ChronoDuration::minutes(1)).to_rfc3339();
        let not_after = (now + ChronoDuration::minutes(5)).to_rfc3339();
        format!(
            r#"<?xml version="1.0"?>
<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"
    xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion"
    ID="_r" InResponseTo="{in_response_to}"
    Destination="https://adaptor.example.com:5678/samlassertionconsumer">
  <saml:Issuer>{issuer}</saml:Issuer>
  <samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status>
  <saml:Assertion ID="_a" Version="2.0" IssueInstant="{now}">
    <saml:Subject><saml:NameID>alice</saml:NameID></saml:Subject>
    <saml:Conditions NotBefore="{not_before}" NotOnOrAfter="{not_after}"/>
    <saml:AttributeStatement>
      <saml:Attribute Name="member-of">
        <saml:AttributeValue>eng</saml:AttributeValue>
      </saml:Attribute>
    </saml:AttributeStatement>
  </saml:Assertion>
</samlp:Response>"#,
            now = now.to_rfc3339(),
        )
    }

    fn form(xml: &str, relay_state: Option<&str>) -> AssertionConsumerForm {
        AssertionConsumerForm {
            saml_response: BASE64.encode(xml),
            relay_state: relay_state.map(|s| s.to_string()),
        }
    }

    #[test]
    fn valid_assertion_yields_principal() {
        let xml = response_xml("_req1", "https://gsa.example.com/security-manager");
        let principal = provider()
            .validate_assertion(&form(&xml, Some("_relay1")), &pending())
            .unwrap();
        assert_eq!(principal.username, "alice");
        assert!(principal.groups.contains("eng"));
    }

    #[test]
    fn mismatched_in_response_to_is_rejected() {
        let xml = response_xml("_other", "https://gsa.example.com/security-manager");
        let err = provider()
            .validate_assertion(&form(&xml, Some("_relay1")), &pending())
            .unwrap_err();
        assert!(err.to_string().contains("InResponseTo"), "{err}");
    }

    #[test]
    fn untrusted_issuer_is_rejected() {
        let xml = response_xml("_req1", "https://evil.example.com/idp");
        let err = provider()
            .validate_assertion(&form(&xml, Some("_relay1")), &pending())
            .unwrap_err();
        assert!(err.to_string().contains("issuer"), "{err}");
    }

    #[test]
    fn relay_state_mismatch_is_rejected() {
        let xml = response_xml("_req1", "https://gsa.example.com/security-manager");
        let err = provider()
            .validate_assertion(&form(&xml, Some("_wrong")), &pending())
            .unwrap_err();
        assert!(err.to_string().contains("relay state"), "{err}");
    }

    #[test]
    fn expired_assertion_is_rejected() {
        let now = Utc::now();
        let xml = format!(
            r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"
    xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion"
    ID="_r" InResponseTo="_req1"
    Destination="https://adaptor.example.com:5678/samlassertionconsumer">
  <saml:Issuer>https://gsa.example.com/security-manager</saml:Issuer>
  <samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status>
  <saml:Assertion ID="_a" Version="2.0" IssueInstant="{stamp}">
    <saml:Subject><saml:NameID>alice</saml:NameID></saml:Subject>
    <saml:Conditions NotBefore="{before}" NotOnOrAfter="{after}"/>
  </saml:Assertion>
</samlp:Response>"#,
            stamp = now.to_rfc3339(),
            before = (now - ChronoDuration::hours(2)).to_rfc3339(),
            after = (now - ChronoDuration::hours(1)).to_rfc3339(),
        );
        let err = provider()
            .validate_assertion(&form(&xml, Some("_relay1")), &pending())
            .unwrap_err();
        assert!(err.to_string().contains("expired"), "{err}");
    }

    #[test]
    fn small_clock_skew_is_tolerated() {
        let now = Utc::now();
        let xml = format!(
            r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"
    xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion"
    ID="_r" InResponseTo="_req1"
    Destination="https://adaptor.example.com:5678/samlassertionconsumer">
  <saml:Issuer>https://gsa.example.com/security-manager</saml:Issuer>
  <samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status>
  <saml:Assertion ID="_a" Version="2.0" IssueInstant="{stamp}">
    <saml:Subject><saml:NameID>alice</saml:NameID></saml:Subject>
    <saml:Conditions NotBefore="{before}" NotOnOrAfter="{after}"/>
  </saml:Assertion>
</samlp:Response>"#,
            stamp = now.to_rfc3339(),
            // A minute into the future is within the five-minute window.
            before = (now + ChronoDuration::minutes(1)).to_rfc3339(),
            after = (now + ChronoDuration::minutes(6)).to_rfc3339(),
        );
        let principal = provider()
            .validate_assertion(&form(&xml, Some("_relay1")), &pending())
            .unwrap();
        assert_eq!(principal.username, "alice");
    }

    #[test]
    fn signature_requirement_is_enforced_when_configured() {
        let provider = SamlProvider::new(
            SamlMetadata::new("adaptor.example.com", 5678, true, "gsa.example.com"),
            Arc::new(crate::saml::SignaturePresenceVerifier),
        );
        let xml = response_xml("_req1", "https://gsa.example.com/security-manager");
        let err = provider
            .validate_assertion(&form(&xml, Some("_relay1")), &pending())
            .unwrap_err();
        assert!(err.to_string().contains("signature"), "{err}");
    }
}
