//! Access control markings (ACMs).
//!
//! A marking is an open JSON object. Only `share`, `f_share` and `banner` are
//! interpreted here; every other field rides along untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Sentinel grantee meaning every authenticated user.
pub const EVERYONE_GROUP: &str = "-Everyone";

const SHARE_KEY: &str = "share";
const FLAT_SHARE_KEY: &str = "f_share";
const BANNER_KEY: &str = "banner";

#[derive(Debug, Error)]
pub enum MarkingError {
    #[error("marking is empty")]
    Empty,
    #[error("marking must be a JSON object")]
    NotAnObject,
    #[error("invalid marking JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Normalized, case-folded grantee used for set membership.
pub fn flatten_grantee(value: &str) -> String {
    value
        .to_lowercase()
        .chars()
        .filter(|c| {
            !matches!(
                c,
                ' ' | ',' | '=' | '\'' | '"' | ':' | '(' | ')' | '$' | '[' | ']' | '{' | '}' | '|' | '\\'
            )
        })
        .map(|c| if c == '.' || c == '-' { '_' } else { c })
        .collect()
}

/// Flattened name of a project group grant.
pub fn flatten_project_group(project: &str, group: &str) -> String {
    flatten_grantee(&format!("{project}_{group}"))
}

/// `projects.{name}` entry of a share clause.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectShare {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub disp_nm: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The `share` clause: who besides the classification may see the object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Share {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub projects: BTreeMap<String, ProjectShare>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Share {
    pub fn user(dn: &str) -> Self {
        Self {
            users: vec![dn.to_lowercase()],
            ..Self::default()
        }
    }

    pub fn group(project: &str, disp_nm: &str, group: &str) -> Self {
        let mut projects = BTreeMap::new();
        projects.insert(
            project.to_lowercase(),
            ProjectShare {
                disp_nm: disp_nm.to_string(),
                groups: vec![group.to_lowercase()],
                extra: Map::new(),
            },
        );
        Self {
            projects,
            ..Self::default()
        }
    }

    /// Parse a share fragment. Empty strings and `null` are an empty share.
    pub fn from_fragment(fragment: &str) -> Result<Self, MarkingError> {
        if fragment.trim().is_empty() {
            return Ok(Self::default());
        }
        match serde_json::from_str::<Value>(fragment)? {
            Value::Null => Ok(Self::default()),
            Value::Object(_) => Ok(serde_json::from_str(fragment)?),
            _ => Err(MarkingError::NotAnObject),
        }
    }

    pub fn to_fragment(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// No user and no group is named: the object is visible to everyone.
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.projects.values().all(|p| p.groups.is_empty())
    }

    /// Union `other` into `self`. Names are case-folded; an existing
    /// `disp_nm` is retained.
    pub fn merge(&mut self, other: &Share) {
        for user in &other.users {
            let user = user.to_lowercase();
            if !self.users.contains(&user) {
                self.users.push(user);
            }
        }
        for (name, incoming) in &other.projects {
            let entry = self.projects.entry(name.to_lowercase()).or_default();
            if entry.disp_nm.is_empty() {
                entry.disp_nm = incoming.disp_nm.clone();
            }
            for group in &incoming.groups {
                let group = group.to_lowercase();
                if !entry.groups.contains(&group) {
                    entry.groups.push(group);
                }
            }
            for (k, v) in &incoming.extra {
                entry.extra.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        for (k, v) in &other.extra {
            self.extra.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    /// Flattened grantee set named by this clause.
    pub fn flattened(&self) -> BTreeSet<String> {
        let mut out: BTreeSet<String> = self.users.iter().map(|u| flatten_grantee(u)).collect();
        for (project, share) in &self.projects {
            for group in &share.groups {
                out.insert(flatten_project_group(project, group));
            }
        }
        out
    }

    /// Split the clause into one fragment per grantee:
    /// `(grantee, display name, fragment)`.
    pub fn grantees(&self) -> Vec<(String, String, Share)> {
        let mut out = Vec::new();
        for user in &self.users {
            out.push((user.clone(), user.clone(), Share::user(user)));
        }
        for (project, share) in &self.projects {
            let disp = if share.disp_nm.is_empty() {
                project.clone()
            } else {
                share.disp_nm.clone()
            };
            for group in &share.groups {
                out.push((
                    flatten_project_group(project, group),
                    format!("{disp} {group}"),
                    Share::group(project, &share.disp_nm, group),
                ));
            }
        }
        out
    }

    /// Fragment describing the flattened grantee `flat`, if this clause names it.
    pub fn fragment_for(&self, flat: &str) -> Option<(String, String, Share)> {
        self.grantees()
            .into_iter()
            .find(|(grantee, _, _)| flatten_grantee(grantee) == flat)
    }
}

/// A marking document.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Marking {
    fields: Map<String, Value>,
}

impl Marking {
    pub fn parse(raw: &str) -> Result<Self, MarkingError> {
        if raw.trim().is_empty() {
            return Err(MarkingError::Empty);
        }
        Self::from_value(serde_json::from_str(raw)?)
    }

    /// Accepts either an object or a string containing one.
    pub fn from_value(value: Value) -> Result<Self, MarkingError> {
        match value {
            Value::Object(fields) if fields.is_empty() => Err(MarkingError::Empty),
            Value::Object(fields) => Ok(Self { fields }),
            Value::String(raw) => Self::parse(&raw),
            Value::Null => Err(MarkingError::Empty),
            _ => Err(MarkingError::NotAnObject),
        }
    }

    /// Canonical serialization (sorted keys).
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.fields).unwrap_or_else(|_| "{}".into())
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    pub fn share(&self) -> Result<Share, MarkingError> {
        match self.fields.get(SHARE_KEY) {
            None | Some(Value::Null) => Ok(Share::default()),
            Some(value @ Value::Object(_)) => Ok(serde_json::from_value(value.clone())?),
            Some(_) => Err(MarkingError::NotAnObject),
        }
    }

    /// Replace the share clause. An empty clause removes the key.
    pub fn set_share(&mut self, share: &Share) {
        if share.is_empty() && share.extra.is_empty() {
            self.fields.remove(SHARE_KEY);
            return;
        }
        match serde_json::to_value(share) {
            Ok(value) => {
                self.fields.insert(SHARE_KEY.into(), value);
            }
            Err(_) => {
                self.fields.remove(SHARE_KEY);
            }
        }
    }

    pub fn clear_share(&mut self) {
        self.fields.remove(SHARE_KEY);
    }

    /// Flattened grantees computed by the authorization service.
    pub fn f_share(&self) -> BTreeSet<String> {
        match self.fields.get(FLAT_SHARE_KEY) {
            Some(Value::Array(values)) => values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => BTreeSet::new(),
        }
    }

    pub fn set_f_share(&mut self, values: &BTreeSet<String>) {
        self.fields.insert(
            FLAT_SHARE_KEY.into(),
            Value::Array(values.iter().cloned().map(Value::String).collect()),
        );
    }

    pub fn banner(&self) -> Option<&str> {
        self.fields.get(BANNER_KEY).and_then(Value::as_str)
    }

    /// True when the share clause or its flattened form differ.
    pub fn share_differs(&self, other: &Marking) -> Result<bool, MarkingError> {
        let mine = self.share()?;
        let theirs = other.share()?;
        Ok(mine.flattened() != theirs.flattened() || self.f_share() != other.f_share())
    }
}
