use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;
use tracing::info;

use crate::errors::{Error, Result};
use crate::security::SafeUrlGuard;

/// What the user typed into the login box, classified exactly once at the
/// entry point instead of being re-sniffed by every helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    Handle(String),
    Did(String),
    ServerUrl(String),
}

impl Identifier {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if is_valid_handle(raw) {
            Ok(Identifier::Handle(raw.to_string()))
        } else if is_valid_did(raw) {
            Ok(Identifier::Did(raw.to_string()))
        } else if raw.starts_with("https://") || raw.starts_with("http://") {
            Ok(Identifier::ServerUrl(raw.to_string()))
        } else {
            Err(Error::BadIdentifier(raw.to_string()))
        }
    }
}

fn handle_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^([a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?$",
        )
        .expect("handle regex")
    })
}

fn did_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^did:[a-z]+:[a-zA-Z0-9._:%-]*[a-zA-Z0-9._-]$").expect("did regex")
    })
}

pub fn is_valid_handle(s: &str) -> bool {
    s.len() <= 253 && handle_regex().is_match(s)
}

pub fn is_valid_did(s: &str) -> bool {
    s.len() <= 2048 && did_regex().is_match(s)
}

/// The subset of a DID document this flow needs.
#[derive(Debug, Clone, Deserialize)]
pub struct DidDocument {
    pub id: String,
    #[serde(default, rename = "alsoKnownAs")]
    pub also_known_as: Vec<String>,
    #[serde(default)]
    pub service: Vec<Service>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Service {
    pub id: String,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(rename = "serviceEndpoint")]
    pub service_endpoint: String,
}

/// Extract the declared PDS endpoint from a DID document.
pub fn pds_endpoint(doc: &DidDocument) -> Result<String> {
    doc.service
        .iter()
        .find(|s| s.id.ends_with("#atproto_pds") && s.service_type == "AtprotoPersonalDataServer")
        .map(|s| s.service_endpoint.trim_end_matches('/').to_string())
        .ok_or(Error::EndpointNotFound)
}

/// Resolves handles and DIDs to DID documents via the AppView and the PLC
/// directory (both treated as platform directory services).
#[derive(Clone)]
pub struct IdentityResolver {
    http: reqwest::Client,
    guard: SafeUrlGuard,
    appview_url: String,
    plc_directory_url: String,
}

#[derive(Deserialize)]
struct ResolveHandleOutput {
    did: String,
}

impl IdentityResolver {
    pub fn new(
        http: reqwest::Client,
        guard: SafeUrlGuard,
        appview_url: String,
        plc_directory_url: String,
    ) -> Self {
        Self {
            http,
            guard,
            appview_url: appview_url.trim_end_matches('/').to_string(),
            plc_directory_url: plc_directory_url.trim_end_matches('/').to_string(),
        }
    }

    /// Resolve a handle or DID to `(did, handle, did_document)`.
    pub async fn resolve(&self, identifier: &Identifier) -> Result<(String, String, DidDocument)> {
        let did = match identifier {
            Identifier::Handle(handle) => self.resolve_handle(handle).await?,
            Identifier::Did(did) => did.clone(),
            Identifier::ServerUrl(url) => {
                return Err(Error::BadIdentifier(url.clone()));
            }
        };

        let doc = self.resolve_did_document(&did).await?;
        let handle = doc
            .also_known_as
            .iter()
            .find_map(|aka| aka.strip_prefix("at://"))
            .unwrap_or(&did)
            .to_string();

        Ok((did, handle, doc))
    }

    /// Resolve a handle to a DID via the AppView XRPC endpoint.
    async fn resolve_handle(&self, handle: &str) -> Result<String> {
        let url = format!(
            "{}/xrpc/com.atproto.identity.resolveHandle",
            self.appview_url
        );
        info!("Resolving handle {} via {}", handle, url);

        let resp = self
            .http
            .get(&url)
            .query(&[("handle", handle)])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::IdentityNotFound(handle.to_string()));
        }

        let out: ResolveHandleOutput = resp
            .json()
            .await
            .map_err(|_| Error::IdentityNotFound(handle.to_string()))?;
        if !is_valid_did(&out.did) {
            return Err(Error::IdentityNotFound(handle.to_string()));
        }
        Ok(out.did)
    }

    /// Fetch the DID document for a `did:plc` or `did:web` identifier.
    pub async fn resolve_did_document(&self, did: &str) -> Result<DidDocument> {
        let url = if did.starts_with("did:plc:") {
            format!("{}/{}", self.plc_directory_url, urlencoding::encode(did))
        } else if let Some(host) = did.strip_prefix("did:web:") {
            // did:web encodes path segments with ':'; only bare-domain DIDs
            // are supported here, matching the PDS bootstrap flow.
            let host = host.replace("%3A", ":");
            let url = format!("https://{}/.well-known/did.json", host);
            self.guard.ensure_safe(&url).await?;
            url
        } else {
            return Err(Error::IdentityNotFound(did.to_string()));
        };

        info!("Fetching DID document from {}", url);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::IdentityNotFound(did.to_string()));
        }

        let doc: DidDocument = resp
            .json()
            .await
            .map_err(|_| Error::IdentityNotFound(did.to_string()))?;
        if doc.id != did {
            return Err(Error::IdentityNotFound(did.to_string()));
        }
        Ok(doc)
    }
}
