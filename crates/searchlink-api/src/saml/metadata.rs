//! Entity identifiers and endpoint locations for both SAML parties.

/// Where this service provider and the appliance's identity provider
/// live. Everything is derived from the two configured hostnames so the
/// handlers never re-assemble URLs ad hoc.
#[derive(Debug, Clone)]
pub struct SamlMetadata {
    server_base: String,
    gsa_base: String,
}

impl SamlMetadata {
    pub fn new(server_hostname: &str, server_port: u16, secure: bool, gsa_hostname: &str) -> Self {
        let scheme = if secure { "https" } else { "http" };
        Self {
            server_base: format!("{scheme}://{server_hostname}:{server_port}"),
            gsa_base: format!("https://{gsa_hostname}"),
        }
    }

    /// Our entity id, quoted as `Issuer` in outgoing messages.
    pub fn sp_entity_id(&self) -> &str {
        &self.server_base
    }

    /// The appliance's entity id; incoming responses must quote it.
    pub fn idp_entity_id(&self) -> String {
        format!("{}/security-manager", self.gsa_base)
    }

    /// Single-sign-on endpoint the user-agent is redirected to.
    pub fn idp_sso_url(&self) -> String {
        format!("{}/security-manager/samlauthn", self.gsa_base)
    }

    /// Where assertions come back; `Destination` must match.
    pub fn assertion_consumer_url(&self) -> String {
        format!("{}/samlassertionconsumer", self.server_base)
    }

    /// Where the appliance posts authorization batches.
    pub fn authz_service_url(&self) -> String {
        format!("{}/saml-authz", self.server_base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_derive_from_hostnames() {
        let metadata = SamlMetadata::new("adaptor.example.com", 5678, true, "gsa.example.com");
        assert_eq!(metadata.sp_entity_id(), "https://adaptor.example.com:5678");
        assert_eq!(
            metadata.idp_sso_url(),
            "https://gsa.example.com/security-manager/samlauthn"
        );
        assert_eq!(
            metadata.assertion_consumer_url(),
            "https://adaptor.example.com:5678/samlassertionconsumer"
        );
        assert_eq!(
            metadata.idp_entity_id(),
            "https://gsa.example.com/security-manager"
        );
    }
}
