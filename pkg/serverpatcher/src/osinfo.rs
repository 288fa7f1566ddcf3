// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Host identity from an os-release style `KEY=VALUE` descriptor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdentity {
    pub name: String,
    pub id: String,
    pub version_id: String,
    pub pretty_name: String,
    /// Lowercased raw `ID_LIKE`.
    pub like: String,
    /// `id` plus every `ID_LIKE` token, all lowercase.
    pub family: BTreeSet<String>,
}

impl HostIdentity {
    /// Exact family token match: "rhel" does not match "rhel-like".
    pub fn is_like(&self, token: &str) -> bool {
        self.family.contains(&token.to_ascii_lowercase())
    }

    /// Best human-readable label.
    pub fn display_name(&self) -> &str {
        if !self.pretty_name.is_empty() {
            &self.pretty_name
        } else if !self.name.is_empty() {
            &self.name
        } else {
            &self.id
        }
    }
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Strip one layer of matching single or double quotes.
fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

pub fn parse(text: &str) -> HostIdentity {
    let mut identity = HostIdentity::default();
    let mut name = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = unquote(value.trim());
        match key.trim() {
            "NAME" => name = Some(value.to_string()),
            "ID" => identity.id = value.to_ascii_lowercase(),
            "ID_LIKE" => identity.like = value.to_ascii_lowercase(),
            "VERSION_ID" => identity.version_id = value.to_string(),
            "PRETTY_NAME" => identity.pretty_name = value.to_string(),
            _ => {}
        }
    }

    identity.name = name
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| identity.pretty_name.clone());
    if !identity.id.is_empty() {
        identity.family.insert(identity.id.clone());
    }
    identity
        .family
        .extend(identity.like.split_whitespace().map(str::to_string));
    identity
}

pub fn detect(path: &Path) -> Result<HostIdentity, DetectError> {
    let text = std::fs::read_to_string(path).map_err(|source| DetectError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse(&text))
}
