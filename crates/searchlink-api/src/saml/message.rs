//! Wire formats for both SAML flows: request composition, response
//! parsing, and the redirect-binding payload codec.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use rand::RngCore;

use searchlink_core::AuthzStatus;

use super::metadata::SamlMetadata;
use super::SamlError;

const NS_PROTOCOL: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
const NS_ASSERTION: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
const NS_SOAP: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";

/// Fresh XML-safe message identifier, unique within this process.
pub fn random_message_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", super::message_id_prefix(), hex::encode(bytes))
}

fn timestamp(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ============================================================
// AuthnRequest (outgoing)
// ============================================================

/// Composes the `AuthnRequest` sent through the redirect binding.
pub fn compose_authn_request(
    metadata: &SamlMetadata,
    request_id: &str,
    issue_instant: DateTime<Utc>,
) -> Result<String, SamlError> {
    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut request = BytesStart::new("samlp:AuthnRequest");
    request.push_attribute(("xmlns:samlp", NS_PROTOCOL));
    request.push_attribute(("xmlns:saml", NS_ASSERTION));
    request.push_attribute(("ID", request_id));
    request.push_attribute(("Version", "2.0"));
    request.push_attribute(("IssueInstant", timestamp(issue_instant).as_str()));
    request.push_attribute(("Destination", metadata.idp_sso_url().as_str()));
    request.push_attribute((
        "AssertionConsumerServiceURL",
        metadata.assertion_consumer_url().as_str(),
    ));
    request.push_attribute((
        "ProtocolBinding",
        "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST",
    ));
    writer.write_event(Event::Start(request))?;

    writer.write_event(Event::Start(BytesStart::new("saml:Issuer")))?;
    writer.write_event(Event::Text(BytesText::new(metadata.sp_entity_id())))?;
    writer.write_event(Event::End(BytesEnd::new("saml:Issuer")))?;

    writer.write_event(Event::End(BytesEnd::new("samlp:AuthnRequest")))?;

    Ok(String::from_utf8(writer.into_inner()).expect("writer emitted invalid UTF-8"))
}

/// Deflates and base64-encodes a message for the redirect binding. The
/// caller still percent-escapes the result into the query string.
pub fn encode_redirect_payload(xml: &str) -> Result<String, SamlError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(xml.as_bytes())
        .and_then(|_| encoder.finish())
        .map(|compressed| BASE64.encode(compressed))
        .map_err(|e| SamlError::Malformed(format!("deflate failed: {e}")))
}

/// Reverses [`encode_redirect_payload`].
pub fn decode_redirect_payload(payload: &str) -> Result<String, SamlError> {
    let compressed = BASE64
        .decode(payload)
        .map_err(|e| SamlError::Malformed(format!("base64: {e}")))?;
    let mut xml = String::new();
    DeflateDecoder::new(compressed.as_slice())
        .read_to_string(&mut xml)
        .map_err(|e| SamlError::Malformed(format!("inflate: {e}")))?;
    Ok(xml)
}

// ============================================================
// Response (incoming assertion)
// ============================================================

/// The parts of a SAML `Response` the consumer validates.
#[derive(Debug, Default, Clone)]
pub struct AuthnResponse {
    pub id: Option<String>,
    pub in_response_to: Option<String>,
    pub destination: Option<String>,
    pub issuer: Option<String>,
    pub status_code: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub name_id: Option<String>,
    pub groups: Vec<String>,
    pub password: Option<String>,
    pub has_signature: bool,
    /// Algorithm URI from the signature's `DigestMethod`.
    pub digest_method: Option<String>,
    /// Base64 digest from the signature's `DigestValue`.
    pub digest_value: Option<String>,
}

/// Parses an assertion response. Structure errors are [`SamlError::Xml`];
/// a well-formed document missing required parts surfaces later, during
/// validation.
pub fn parse_authn_response(xml: &[u8]) -> Result<AuthnResponse, SamlError> {
    let mut reader = Reader::from_reader(xml);
    reader.trim_text(true);

    let mut parsed = AuthnResponse::default();
    let mut buf = Vec::new();
    let mut current = String::new();
    let mut attribute_name: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) => {
                let local = String::from_utf8_lossy(e.name().local_name().as_ref()).into_owned();
                match local.as_str() {
                    "Response" => {
                        for attr in e.attributes().flatten() {
                            let value = attr.unescape_value()?.into_owned();
                            match attr.key.local_name().as_ref() {
                                b"ID" => parsed.id = Some(value),
                                b"InResponseTo" => parsed.in_response_to = Some(value),
                                b"Destination" => parsed.destination = Some(value),
                                _ => {}
                            }
                        }
                    }
                    "StatusCode" => {
                        for attr in e.attributes().flatten() {
                            if attr.key.local_name().as_ref() == b"Value" {
                                parsed.status_code = Some(attr.unescape_value()?.into_owned());
                            }
                        }
                    }
                    "Conditions" => {
                        for attr in e.attributes().flatten() {
                            let value = attr.unescape_value()?.into_owned();
                            let instant = DateTime::parse_from_rfc3339(&value)
                                .map(|t| t.with_timezone(&Utc))
                                .map_err(|e| {
                                    SamlError::Malformed(format!("bad condition instant: {e}"))
                                })?;
                            match attr.key.local_name().as_ref() {
                                b"NotBefore" => parsed.not_before = Some(instant),
                                b"NotOnOrAfter" => parsed.not_on_or_after = Some(instant),
                                _ => {}
                            }
                        }
                    }
                    "Attribute" => {
                        attribute_name = e
                            .attributes()
                            .flatten()
                            .find(|attr| attr.key.local_name().as_ref() == b"Name")
                            .map(|attr| {
                                attr.unescape_value()
                                    .map(|value| value.into_owned())
                                    .unwrap_or_default()
                            });
                    }
                    "Signature" => parsed.has_signature = true,
                    "DigestMethod" => {
                        for attr in e.attributes().flatten() {
                            if attr.key.local_name().as_ref() == b"Algorithm" {
                                parsed.digest_method = Some(attr.unescape_value()?.into_owned());
                            }
                        }
                    }
                    _ => {}
                }
                current = local;
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(SamlError::from)?
                    .into_owned();
                match current.as_str() {
                    "Issuer" if parsed.issuer.is_none() => parsed.issuer = Some(text),
                    "NameID" if parsed.name_id.is_none() => parsed.name_id = Some(text),
                    "DigestValue" if parsed.digest_value.is_none() => {
                        parsed.digest_value = Some(text)
                    }
                    "AttributeValue" => match attribute_name.as_deref() {
                        Some("member-of") | Some("groups") => parsed.groups.push(text),
                        Some("password") => parsed.password = Some(text),
                        _ => {}
                    },
                    _ => {}
                }
            }
            Event::End(_) => current.clear(),
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(parsed)
}

/// True when a status code denotes success.
pub fn is_success_status(status_code: Option<&str>) -> bool {
    status_code == Some(STATUS_SUCCESS)
}

/// Removes the first enveloped `Signature` element, any namespace
/// prefix, from the document. The remainder is the octet stream an
/// enveloped-signature digest covers. A document without a signature
/// (or with an unterminated one) comes back unchanged.
pub fn strip_signature_element(xml: &str) -> String {
    let Some(open) = find_element_open(xml, "Signature") else {
        return xml.to_string();
    };
    let tail = &xml[open..];
    let mut search = 0;
    while let Some(pos) = tail[search..].find("</").map(|p| p + search) {
        let rest = &tail[pos + 2..];
        let Some(gt) = rest.find('>') else {
            break;
        };
        let name = rest[..gt].trim();
        if local_element_name(name) == "Signature" {
            let end = open + pos + 2 + gt + 1;
            let mut out = String::with_capacity(xml.len());
            out.push_str(&xml[..open]);
            out.push_str(&xml[end..]);
            return out;
        }
        search = pos + 2;
    }
    xml.to_string()
}

/// Byte offset of the opening `<` of the first element whose local name
/// is `local`, ignoring any namespace prefix.
fn find_element_open(xml: &str, local: &str) -> Option<usize> {
    let mut search = 0;
    while let Some(pos) = xml[search..].find('<').map(|p| p + search) {
        let rest = &xml[pos + 1..];
        let name_end = rest
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .unwrap_or(rest.len());
        if local_element_name(&rest[..name_end]) == local {
            return Some(pos);
        }
        search = pos + 1;
    }
    None
}

fn local_element_name(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

// ============================================================
// AuthzDecisionQuery batch (incoming) and its response
// ============================================================

/// One query out of the appliance's SOAP batch.
#[derive(Debug, Clone)]
pub struct AuthzQuery {
    pub id: String,
    pub resource: String,
    pub subject: Option<String>,
}

/// Parses every `AuthzDecisionQuery` in a SOAP envelope, in document
/// order.
pub fn parse_authz_queries(xml: &[u8]) -> Result<Vec<AuthzQuery>, SamlError> {
    let mut reader = Reader::from_reader(xml);
    reader.trim_text(true);

    let mut queries: Vec<AuthzQuery> = Vec::new();
    let mut buf = Vec::new();
    let mut current = String::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) => {
                let local = String::from_utf8_lossy(e.name().local_name().as_ref()).into_owned();
                if local == "AuthzDecisionQuery" {
                    let mut query = AuthzQuery {
                        id: String::new(),
                        resource: String::new(),
                        subject: None,
                    };
                    for attr in e.attributes().flatten() {
                        let value = attr.unescape_value()?.into_owned();
                        match attr.key.local_name().as_ref() {
                            b"ID" => query.id = value,
                            b"Resource" => query.resource = value,
                            _ => {}
                        }
                    }
                    queries.push(query);
                }
                current = local;
            }
            Event::Text(t) => {
                if current == "NameID" {
                    if let Some(query) = queries.last_mut() {
                        if query.subject.is_none() {
                            query.subject =
                                Some(t.unescape().map_err(SamlError::from)?.into_owned());
                        }
                    }
                }
            }
            Event::End(_) => current.clear(),
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if queries.is_empty() {
        return Err(SamlError::Malformed(
            "no AuthzDecisionQuery in request".to_string(),
        ));
    }
    Ok(queries)
}

fn decision_str(status: AuthzStatus) -> &'static str {
    match status {
        AuthzStatus::Permit => "Permit",
        AuthzStatus::Deny => "Deny",
        AuthzStatus::Indeterminate => "Indeterminate",
    }
}

/// Composes the SOAP answer to an authorization batch: one `Response`
/// per query, in query order.
pub fn compose_authz_response(
    metadata: &SamlMetadata,
    decisions: &[(AuthzQuery, AuthzStatus)],
    issue_instant: DateTime<Utc>,
) -> Result<String, SamlError> {
    let stamp = timestamp(issue_instant);
    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut envelope = BytesStart::new("soap11:Envelope");
    envelope.push_attribute(("xmlns:soap11", NS_SOAP));
    writer.write_event(Event::Start(envelope))?;
    writer.write_event(Event::Start(BytesStart::new("soap11:Body")))?;

    for (query, decision) in decisions {
        let mut response = BytesStart::new("samlp:Response");
        response.push_attribute(("xmlns:samlp", NS_PROTOCOL));
        response.push_attribute(("xmlns:saml", NS_ASSERTION));
        response.push_attribute(("ID", random_message_id().as_str()));
        response.push_attribute(("Version", "2.0"));
        response.push_attribute(("IssueInstant", stamp.as_str()));
        if !query.id.is_empty() {
            response.push_attribute(("InResponseTo", query.id.as_str()));
        }
        writer.write_event(Event::Start(response))?;

        writer.write_event(Event::Start(BytesStart::new("saml:Issuer")))?;
        writer.write_event(Event::Text(BytesText::new(metadata.sp_entity_id())))?;
        writer.write_event(Event::End(BytesEnd::new("saml:Issuer")))?;

        writer.write_event(Event::Start(BytesStart::new("samlp:Status")))?;
        let mut status_code = BytesStart::new("samlp:StatusCode");
        status_code.push_attribute(("Value", STATUS_SUCCESS));
        writer.write_event(Event::Empty(status_code))?;
        writer.write_event(Event::End(BytesEnd::new("samlp:Status")))?;

        let mut assertion = BytesStart::new("saml:Assertion");
        assertion.push_attribute(("ID", random_message_id().as_str()));
        assertion.push_attribute(("Version", "2.0"));
        assertion.push_attribute(("IssueInstant", stamp.as_str()));
        writer.write_event(Event::Start(assertion))?;

        writer.write_event(Event::Start(BytesStart::new("saml:Issuer")))?;
        writer.write_event(Event::Text(BytesText::new(metadata.sp_entity_id())))?;
        writer.write_event(Event::End(BytesEnd::new("saml:Issuer")))?;

        writer.write_event(Event::Start(BytesStart::new("saml:Subject")))?;
        writer.write_event(Event::Start(BytesStart::new("saml:NameID")))?;
        writer.write_event(Event::Text(BytesText::new(
            query.subject.as_deref().unwrap_or(""),
        )))?;
        writer.write_event(Event::End(BytesEnd::new("saml:NameID")))?;
        writer.write_event(Event::End(BytesEnd::new("saml:Subject")))?;

        let mut statement = BytesStart::new("saml:AuthzDecisionStatement");
        statement.push_attribute(("Decision", decision_str(*decision)));
        statement.push_attribute(("Resource", query.resource.as_str()));
        writer.write_event(Event::Start(statement))?;
        let mut action = BytesStart::new("saml:Action");
        action.push_attribute(("Namespace", "urn:oasis:names:tc:SAML:1.0:action:ghpp"));
        writer.write_event(Event::Start(action))?;
        writer.write_event(Event::Text(BytesText::new("GET")))?;
        writer.write_event(Event::End(BytesEnd::new("saml:Action")))?;
        writer.write_event(Event::End(BytesEnd::new("saml:AuthzDecisionStatement")))?;

        writer.write_event(Event::End(BytesEnd::new("saml:Assertion")))?;
        writer.write_event(Event::End(BytesEnd::new("samlp:Response")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("soap11:Body")))?;
    writer.write_event(Event::End(BytesEnd::new("soap11:Envelope")))?;

    Ok(String::from_utf8(writer.into_inner()).expect("writer emitted invalid UTF-8"))
}
