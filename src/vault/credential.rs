//! Credential handling for the secret store
//!
//! Credentials exist in memory only as long as needed, zeroized on drop,
//! with a redacted `Debug`. Transfer to the consuming context is always
//! stdin-piped - never an argument list - and the durable copy lives in one
//! namespaced Secret under a fixed well-known name so a restarted controller
//! can recover.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use zeroize::Zeroizing;

use crate::control_plane::{ControlPlane, QueryKind, ResourceApply, ResourceQuery};
use crate::{Error, Result};

/// Fixed name of the Secret holding the store credentials
pub const CREDENTIAL_SECRET_NAME: &str = "terrarium-vault-keys";

/// An unseal key and root token issued by one initialize call
pub struct Credential {
    /// Key that unseals the store
    pub unseal_key: Zeroizing<String>,
    /// Root token for post-unseal configuration
    pub root_token: Zeroizing<String>,
    /// When the credential was issued
    pub issued_at: DateTime<Utc>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("unseal_key", &"<redacted>")
            .field("root_token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Shape of the store's initialize response
#[derive(Deserialize)]
struct InitResponse {
    unseal_keys_b64: Vec<String>,
    root_token: String,
}

impl Credential {
    /// Decode an initialize response into a credential.
    ///
    /// Any missing or empty field is a [`Error::CredentialParse`]; a
    /// malformed response must never silently yield empty strings.
    pub fn from_init_output(raw: &str) -> Result<Self> {
        let response: InitResponse = serde_json::from_str(raw)
            .map_err(|e| Error::credential_parse(format!("bad initialize response: {}", e)))?;

        let unseal_key = response
            .unseal_keys_b64
            .into_iter()
            .next()
            .ok_or_else(|| Error::credential_parse("initialize response has no unseal keys"))?;
        if unseal_key.is_empty() {
            return Err(Error::credential_parse("initialize response unseal key is empty"));
        }
        if response.root_token.is_empty() {
            return Err(Error::credential_parse("initialize response root token is empty"));
        }

        Ok(Self {
            unseal_key: Zeroizing::new(unseal_key),
            root_token: Zeroizing::new(response.root_token),
            issued_at: Utc::now(),
        })
    }
}

/// Durable persistence and recovery of store credentials
#[derive(Clone)]
pub struct CredentialStore {
    control_plane: Arc<dyn ControlPlane>,
    namespace: String,
}

impl CredentialStore {
    /// Create a store writing into the given namespace
    pub fn new(control_plane: Arc<dyn ControlPlane>, namespace: impl Into<String>) -> Self {
        Self {
            control_plane,
            namespace: namespace.into(),
        }
    }

    /// Persist the credential to the well-known Secret.
    ///
    /// Storing the unseal key and root token next to the store they open is
    /// a development-environment convenience for controller-restart
    /// recovery, NOT a production credential-management pattern. The
    /// manifest is piped to the control plane via stdin and never appears
    /// in an argument list.
    pub async fn persist(&self, credential: &Credential) -> Result<()> {
        let manifest = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": CREDENTIAL_SECRET_NAME,
                "namespace": self.namespace,
            },
            "type": "Opaque",
            "stringData": {
                "unseal_key": &*credential.unseal_key,
                "root_token": &*credential.root_token,
                "issued_at": credential.issued_at.to_rfc3339(),
            }
        });
        let content = serde_json::to_string(&manifest)
            .map_err(|e| Error::serialization(format!("credential secret: {}", e)))?;

        self.control_plane
            .apply(&ResourceApply::Manifest { content })
            .await?;
        debug!(secret = CREDENTIAL_SECRET_NAME, namespace = %self.namespace, "credential persisted");
        Ok(())
    }

    /// Load the persisted credential, if any.
    ///
    /// `Ok(None)` means no credential was ever stored (or it was lost with
    /// the namespace) - the caller decides whether that means the reset
    /// path. A present-but-undecodable secret is a parse failure.
    pub async fn load(&self) -> Result<Option<Credential>> {
        let query = ResourceQuery::object(QueryKind::Secret, CREDENTIAL_SECRET_NAME, &self.namespace);
        let doc = match self.control_plane.query(&query).await? {
            Some(doc) => doc,
            None => return Ok(None),
        };

        let unseal_key = Self::data_field(&doc, "unseal_key")?;
        let root_token = Self::data_field(&doc, "root_token")?;
        let issued_at = Self::data_field(&doc, "issued_at")
            .ok()
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Some(Credential {
            unseal_key,
            root_token,
            issued_at,
        }))
    }

    /// Decode one base64 field from a Secret's `data` map
    fn data_field(doc: &Value, field: &str) -> Result<Zeroizing<String>> {
        let encoded = doc
            .pointer(&format!("/data/{}", field))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::credential_parse(format!("stored credential missing field {}", field))
            })?;
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| Error::credential_parse(format!("stored {} not base64: {}", field, e)))?;
        let value = String::from_utf8(bytes)
            .map_err(|e| Error::credential_parse(format!("stored {} not utf-8: {}", field, e)))?;
        Ok(Zeroizing::new(value))
    }
}
