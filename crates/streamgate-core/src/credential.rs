//! Per-request platform credentials
//!
//! The client hands over an access token and instance URL with every request
//! that touches the platform. Nothing here is persisted.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{excerpt, GatewayError, Result};

/// Organization ids are 15 or 18 characters and start with this key prefix
const ORG_ID_PREFIX: &str = "00D";

/// Credential fields as they arrive in request parameters
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialParams {
    pub access_token: String,
    pub instance_url: String,
}

impl fmt::Debug for CredentialParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialParams")
            .field("access_token", &redact(&self.access_token))
            .field("instance_url", &self.instance_url)
            .finish()
    }
}

/// A validated credential with its derived organization id
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    access_token: String,
    instance_url: String,
    org_id: String,
}

/// Key under which long-poll clients are pooled: (instance, access token)
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub instance_url: String,
    access_token: String,
}

impl fmt::Debug for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.instance_url, redact(&self.access_token))
    }
}

impl Credential {
    /// Validate raw params and derive the organization id from the token
    pub fn from_params(params: CredentialParams) -> Result<Self> {
        let access_token = params.access_token.trim().to_string();
        if access_token.is_empty() {
            return Err(GatewayError::validation("accessToken is required"));
        }

        let instance_url = params.instance_url.trim().trim_end_matches('/').to_string();
        if !(instance_url.starts_with("https://") || instance_url.starts_with("http://"))
            || instance_url.len() <= "https://".len()
        {
            return Err(GatewayError::validation(format!(
                "instanceUrl '{}' must be an absolute http(s) URL",
                excerpt(&instance_url)
            )));
        }

        let org_id = org_id_from_token(&access_token)?;
        Ok(Self {
            access_token,
            instance_url,
            org_id,
        })
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn instance_url(&self) -> &str {
        &self.instance_url
    }

    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    pub fn pool_key(&self) -> PoolKey {
        PoolKey {
            instance_url: self.instance_url.clone(),
            access_token: self.access_token.clone(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &redact(&self.access_token))
            .field("instance_url", &self.instance_url)
            .field("org_id", &self.org_id)
            .finish()
    }
}

/// Derive the organization id from a session-style access token
///
/// Tokens look like `00D5g000004XXXX!AQ4AQ...`: the organization id is the
/// part before the `!`.
pub fn org_id_from_token(token: &str) -> Result<String> {
    let (prefix, rest) = token.split_once('!').ok_or_else(|| {
        GatewayError::validation("access token does not carry an organization prefix")
    })?;

    let valid_len = prefix.len() == 15 || prefix.len() == 18;
    if !valid_len
        || !prefix.starts_with(ORG_ID_PREFIX)
        || !prefix.chars().all(|c| c.is_ascii_alphanumeric())
        || rest.is_empty()
    {
        return Err(GatewayError::validation(
            "access token organization prefix is malformed",
        ));
    }

    Ok(prefix.to_string())
}

fn redact(token: &str) -> String {
    let visible: String = token.chars().take(6).collect();
    format!("{visible}…")
}
