//! Work queue keys.
//!
//! A key is a single string token. Reconcile keys use the usual
//! `namespace/name` shape (just `name` for cluster-scoped objects). Deletion
//! keys carry a reserved `deletion:` prefix; `:` never appears in a reconcile
//! key, so the two shapes cannot collide.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const DELETION_PREFIX: &str = "deletion:";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("empty name")]
    EmptyName,
    #[error("empty deletion identifier")]
    EmptyUid,
    #[error("invalid character {ch:?} in {field} {value:?}")]
    InvalidChar { field: &'static str, value: String, ch: char },
}

/// Opaque queue token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

/// A key decoded into what the worker has to do with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    Reconcile { namespace: String, name: String },
    Deletion { uid: String },
    Invalid { reason: String },
}

fn check_segment(field: &'static str, value: &str) -> Result<(), KeyError> {
    match value.chars().find(|c| *c == '/' || *c == ':') {
        Some(ch) => Err(KeyError::InvalidChar { field, value: value.to_string(), ch }),
        None => Ok(()),
    }
}

impl ResourceKey {
    /// `namespace/name`, or `name` when `namespace` is empty.
    pub fn reconcile(namespace: &str, name: &str) -> Result<Self, KeyError> {
        if name.is_empty() {
            return Err(KeyError::EmptyName);
        }
        check_segment("namespace", namespace)?;
        check_segment("name", name)?;
        if namespace.is_empty() {
            Ok(Self(name.to_string()))
        } else {
            Ok(Self(format!("{}/{}", namespace, name)))
        }
    }

    pub fn deletion(uid: &str) -> Result<Self, KeyError> {
        if uid.is_empty() {
            return Err(KeyError::EmptyUid);
        }
        Ok(Self(format!("{}{}", DELETION_PREFIX, uid)))
    }

    /// Wrap a token as received from elsewhere; nothing is validated until
    /// [`ResourceKey::classify`].
    pub fn from_raw(raw: impl Into<String>) -> Self { Self(raw.into()) }

    pub fn as_str(&self) -> &str { &self.0 }

    pub fn classify(&self) -> KeyKind {
        if let Some(uid) = self.0.strip_prefix(DELETION_PREFIX) {
            return if uid.is_empty() {
                KeyKind::Invalid { reason: "deletion key without identifier".into() }
            } else {
                KeyKind::Deletion { uid: uid.to_string() }
            };
        }
        match split_namespace_key(&self.0) {
            Some((namespace, name)) => KeyKind::Reconcile { namespace: namespace.to_string(), name: name.to_string() },
            None => KeyKind::Invalid { reason: format!("unexpected key format: {:?}", self.0) },
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

fn split_namespace_key(key: &str) -> Option<(&str, &str)> {
    if key.contains(':') {
        return None;
    }
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Some(("", name)),
        [namespace, name] if !name.is_empty() => Some((namespace, name)),
        _ => None,
    }
}
