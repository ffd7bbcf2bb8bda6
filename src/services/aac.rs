//! Authorization gateway.
//!
//! Every reveal of metadata or content, and every commit that changes a
//! marking, passes through an [`AuthorizationService`]: the remote policy
//! service over HTTP, or a local stand-in for single-node deployments.
//! [`AuthorizationGateway`] wraps either one with the per-user snippet cache
//! and performance timing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, PoisonError, RwLock},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    models::marking::{EVERYONE_GROUP, Marking, MarkingError, flatten_grantee},
    services::performance::{PerformanceHandle, ReporterId},
};

pub const TOKEN_TYPE: &str = "pki_dias";
pub const SNIPPET_TYPE: &str = "odrive-raw";

const SHARE_FIELD: &str = "f_share";

#[derive(Debug, Error)]
pub enum AacError {
    #[error("authorization service unreachable: {0}")]
    Unreachable(String),
    #[error("marking not valid: {0}")]
    InvalidMarking(String),
    #[error("user not specified")]
    UserNotSpecified,
    #[error("user not authorized: {0}")]
    Rejected(String),
}

impl From<MarkingError> for AacError {
    fn from(err: MarkingError) -> Self {
        AacError::InvalidMarking(err.to_string())
    }
}

/// Answer of an access check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckAccessResponse {
    pub success: bool,
    pub has_access: bool,
    #[serde(default)]
    pub messages: Vec<String>,
}

/// One attribute field of a user snippet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnippetField {
    pub field: String,
    #[serde(default)]
    pub treatment: String,
    #[serde(default)]
    pub values: Vec<String>,
}

/// A user's attribute set, keyed by the marking field it is compared with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snippets {
    pub fields: BTreeMap<String, SnippetField>,
}

impl Snippets {
    /// Parse the `odrive-raw` snippet document. The document may arrive
    /// JSON-quoted inside a string.
    pub fn parse(raw: &str) -> Result<Self, AacError> {
        let mut value: Value = serde_json::from_str(raw)
            .map_err(|e| AacError::Rejected(format!("unparseable snippets: {e}")))?;
        if let Value::String(inner) = &value {
            value = serde_json::from_str(inner)
                .map_err(|e| AacError::Rejected(format!("unparseable snippets: {e}")))?;
        }
        let Value::Object(map) = value else {
            return Err(AacError::Rejected("snippets are not an object".into()));
        };
        let mut fields = BTreeMap::new();
        for (key, raw_field) in map {
            let mut field: SnippetField = serde_json::from_value(raw_field)
                .map_err(|e| AacError::Rejected(format!("snippet field {key}: {e}")))?;
            let target = match key.as_str() {
                "f_sap" => "f_sar_id".to_string(),
                "f_aea" => "f_atom_energy".to_string(),
                _ => key,
            };
            field.field = target.clone();
            fields.insert(target, field);
        }
        Ok(Self { fields })
    }

    /// Snippet of an unclassified user whose only share value is their own
    /// flattened DN plus any extra groups.
    pub fn standalone(dn: &str, groups: &[String]) -> Self {
        let mut fields = BTreeMap::new();
        let mut add = |name: &str, values: Vec<String>| {
            fields.insert(
                name.to_string(),
                SnippetField {
                    field: name.to_string(),
                    treatment: "allow".into(),
                    values,
                },
            );
        };
        add("f_clearance", vec!["u".into()]);
        add("dissem_countries", vec!["USA".into()]);
        let mut share = vec![flatten_grantee(dn)];
        share.extend(groups.iter().map(|g| flatten_grantee(g)));
        add(SHARE_FIELD, share);
        Self { fields }
    }

    pub fn values(&self, field: &str) -> &[String] {
        self.fields
            .get(field)
            .map(|f| f.values.as_slice())
            .unwrap_or_default()
    }

    /// Flattened groups the user belongs to.
    pub fn f_share(&self) -> BTreeSet<String> {
        self.values(SHARE_FIELD).iter().cloned().collect()
    }
}

#[async_trait]
pub trait AuthorizationService: Send + Sync {
    async fn check_access(
        &self,
        user_dn: &str,
        token_type: &str,
        marking: &Marking,
    ) -> Result<CheckAccessResponse, AacError>;

    async fn get_snippets(
        &self,
        user_dn: &str,
        token_type: &str,
        snippet_type: &str,
    ) -> Result<Snippets, AacError>;

    /// Marking with its computed `f_*` fields filled in.
    async fn flatten(&self, marking: &Marking) -> Result<Marking, AacError>;

    fn name(&self) -> &str;
}

/// HTTP JSON client for the remote policy service.
pub struct AacClient {
    http: reqwest::Client,
    base_url: String,
    retries: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnippetResponse {
    success: bool,
    #[serde(default)]
    found: Option<bool>,
    #[serde(default)]
    snippets: String,
    #[serde(default)]
    messages: Vec<String>,
}

#[derive(Deserialize)]
struct AcmInfo {
    acm: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcmResponse {
    success: bool,
    #[serde(default)]
    acm_valid: bool,
    #[serde(default)]
    acm_info: Option<AcmInfo>,
    #[serde(default)]
    messages: Vec<String>,
}

impl AacClient {
    pub fn new(base_url: &str, timeout: Duration, retries: u32) -> Result<Self, AacError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AacError::Unreachable(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            retries: retries.max(1),
        })
    }

    /// POST `body` to `path`, retrying transport failures and 5xx answers.
    async fn call<T: serde::de::DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, AacError> {
        let url = format!("{}/{}", self.base_url, path);
        let mut last_error = String::new();
        for attempt in 1..=self.retries {
            match self.http.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_server_error() => {
                    last_error = format!("{url} returned {}", resp.status());
                }
                Ok(resp) if !resp.status().is_success() => {
                    return Err(AacError::Unreachable(format!("{url} returned {}", resp.status())));
                }
                Ok(resp) => {
                    return resp
                        .json::<T>()
                        .await
                        .map_err(|e| AacError::Unreachable(format!("decoding {url}: {e}")));
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }
            warn!(url = %url, attempt, error = %last_error, "authorization service call failed");
            if attempt < self.retries {
                tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
            }
        }
        Err(AacError::Unreachable(last_error))
    }
}

#[async_trait]
impl AuthorizationService for AacClient {
    async fn check_access(
        &self,
        user_dn: &str,
        token_type: &str,
        marking: &Marking,
    ) -> Result<CheckAccessResponse, AacError> {
        let resp: CheckAccessResponse = self
            .call(
                "checkAccess",
                json!({"userToken": user_dn, "tokenType": token_type, "acm": marking.to_json()}),
            )
            .await?;
        for msg in &resp.messages {
            debug!(message = %msg, "checkAccess");
        }
        Ok(resp)
    }

    async fn get_snippets(
        &self,
        user_dn: &str,
        token_type: &str,
        snippet_type: &str,
    ) -> Result<Snippets, AacError> {
        let resp: SnippetResponse = self
            .call(
                "snippets",
                json!({"userToken": user_dn, "tokenType": token_type, "snippetType": snippet_type}),
            )
            .await?;
        if !resp.success || resp.found == Some(false) {
            return Err(AacError::Rejected(resp.messages.join("/")));
        }
        Snippets::parse(&resp.snippets)
    }

    async fn flatten(&self, marking: &Marking) -> Result<Marking, AacError> {
        let resp: AcmResponse = self
            .call("populateAndValidateAcm", json!({"acm": marking.to_json()}))
            .await?;
        if !resp.success || !resp.acm_valid {
            return Err(AacError::InvalidMarking(resp.messages.join("/")));
        }
        let info = resp
            .acm_info
            .ok_or_else(|| AacError::InvalidMarking("no acm returned".into()))?;
        Ok(Marking::parse(&info.acm)?)
    }

    fn name(&self) -> &str {
        "aac"
    }
}

/// Local policy: a marking is readable when its `f_share` is empty or
/// shares a value with the caller's snippet.
#[derive(Debug, Default, Clone)]
pub struct StandaloneAac {
    groups: HashMap<String, Vec<String>>,
}

impl StandaloneAac {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `dn` in the given flattened groups (e.g. `dctc_odrive_g2`).
    pub fn with_user_groups(mut self, dn: &str, groups: &[&str]) -> Self {
        self.groups.insert(
            flatten_grantee(dn),
            groups.iter().map(|g| g.to_string()).collect(),
        );
        self
    }

    fn snippets_for(&self, user_dn: &str) -> Snippets {
        let groups = self
            .groups
            .get(&flatten_grantee(user_dn))
            .cloned()
            .unwrap_or_default();
        Snippets::standalone(user_dn, &groups)
    }

    fn flatten_local(marking: &Marking) -> Result<Marking, AacError> {
        let mut flat = marking.clone();
        flat.set_f_share(&marking.share()?.flattened());
        Ok(flat)
    }
}

#[async_trait]
impl AuthorizationService for StandaloneAac {
    async fn check_access(
        &self,
        user_dn: &str,
        _token_type: &str,
        marking: &Marking,
    ) -> Result<CheckAccessResponse, AacError> {
        let required = Self::flatten_local(marking)?.f_share();
        let held = self.snippets_for(user_dn).f_share();
        let has_access = required.is_empty() || !required.is_disjoint(&held);
        Ok(CheckAccessResponse {
            success: true,
            has_access,
            messages: Vec::new(),
        })
    }

    async fn get_snippets(
        &self,
        user_dn: &str,
        _token_type: &str,
        _snippet_type: &str,
    ) -> Result<Snippets, AacError> {
        Ok(self.snippets_for(user_dn))
    }

    async fn flatten(&self, marking: &Marking) -> Result<Marking, AacError> {
        Self::flatten_local(marking)
    }

    fn name(&self) -> &str {
        "standalone"
    }
}

/// How long fetched snippets stay usable before they are fetched again.
pub const SNIPPET_TTL: Duration = Duration::from_secs(10 * 60);

/// Per-user snippet cache. Entries older than the TTL read as misses and
/// are pruned on the next insert.
#[derive(Debug)]
pub struct SnippetCache {
    enabled: bool,
    ttl: Duration,
    entries: RwLock<HashMap<String, (Snippets, Instant)>>,
}

impl SnippetCache {
    pub fn new(enabled: bool) -> Self {
        Self::with_ttl(enabled, SNIPPET_TTL)
    }

    pub fn with_ttl(enabled: bool, ttl: Duration) -> Self {
        Self {
            enabled,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, user_dn: &str) -> Option<Snippets> {
        if !self.enabled {
            return None;
        }
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_dn)
            .filter(|(_, fetched)| fetched.elapsed() < self.ttl)
            .map(|(snippets, _)| snippets.clone())
    }

    pub fn set(&self, user_dn: &str, snippets: Snippets) {
        if !self.enabled {
            return;
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, (_, fetched)| fetched.elapsed() < self.ttl);
        entries.insert(user_dn.to_string(), (snippets, Instant::now()));
    }

    pub fn delete(&self, user_dn: &str) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user_dn);
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Authorization entry point used by the services.
pub struct AuthorizationGateway {
    service: Arc<dyn AuthorizationService>,
    snippets: SnippetCache,
    perf: PerformanceHandle,
}

impl AuthorizationGateway {
    pub fn new(service: Arc<dyn AuthorizationService>, cache_snippets: bool, perf: PerformanceHandle) -> Self {
        info!(service = service.name(), cache_snippets, "authorization gateway ready");
        Self {
            service,
            snippets: SnippetCache::new(cache_snippets),
            perf,
        }
    }

    pub fn snippet_cache(&self) -> &SnippetCache {
        &self.snippets
    }

    pub async fn snippets(&self, user_dn: &str) -> Result<Snippets, AacError> {
        if user_dn.trim().is_empty() {
            return Err(AacError::UserNotSpecified);
        }
        if let Some(hit) = self.snippets.get(user_dn) {
            return Ok(hit);
        }
        let job = self.perf.begin(ReporterId::AacGetSnippets);
        let snippets = self
            .service
            .get_snippets(user_dn, TOKEN_TYPE, SNIPPET_TYPE)
            .await?;
        job.finish(0);
        self.snippets.set(user_dn, snippets.clone());
        Ok(snippets)
    }

    pub async fn flatten(&self, marking: &Marking) -> Result<Marking, AacError> {
        let job = self.perf.begin(ReporterId::AacFlatten);
        let flat = self.service.flatten(marking).await?;
        job.finish(0);
        Ok(flat)
    }

    /// Fails with [`AacError::Rejected`] unless `user_dn` may see `marking`.
    pub async fn check_access(&self, user_dn: &str, marking: &Marking) -> Result<(), AacError> {
        if user_dn.trim().is_empty() {
            return Err(AacError::UserNotSpecified);
        }
        let job = self.perf.begin(ReporterId::AacCheckAccess);
        let resp = self.service.check_access(user_dn, TOKEN_TYPE, marking).await?;
        job.finish(0);
        if !resp.success {
            return Err(AacError::Rejected(format!(
                "access check unsuccessful: {}",
                resp.messages.join("/")
            )));
        }
        if !resp.has_access {
            return Err(AacError::Rejected(resp.messages.join("/")));
        }
        Ok(())
    }

    /// `Ok(false)` for a denial, errors only for service failures.
    pub async fn is_authorized(&self, user_dn: &str, marking: &Marking) -> Result<bool, AacError> {
        match self.check_access(user_dn, marking).await {
            Ok(()) => Ok(true),
            Err(AacError::Rejected(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Flattened grantees a caller can match a permission by: their own
    /// DN, their snippet share groups and everyone.
    pub async fn caller_grantees(&self, user_dn: &str) -> Result<BTreeSet<String>, AacError> {
        let mut grantees = self.snippets(user_dn).await?.f_share();
        grantees.insert(flatten_grantee(user_dn));
        grantees.insert(flatten_grantee(EVERYONE_GROUP));
        Ok(grantees)
    }
}
