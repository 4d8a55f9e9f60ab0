// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// File-backed JSON document store.
//
// Documents are rewritten whole: serialise to a sibling temp file, then
// rename over the target, so a crash mid-write never leaves half a document.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use printwatch_core::error::{PrintwatchError, Result};

use crate::traits::PersistentStore;

/// Byte-order mark some editors prepend to UTF-8 files.
const UTF8_BOM: char = '\u{feff}';

/// Plain files on the local filesystem.
#[derive(Debug, Default, Clone)]
pub struct JsonFileStore;

impl JsonFileStore {
    pub fn new() -> Self {
        Self
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Parse a JSON document, tolerating a leading BOM.
pub fn parse_document(raw: &str) -> Result<serde_json::Value> {
    let text = raw.strip_prefix(UTF8_BOM).unwrap_or(raw);
    serde_json::from_str(text).map_err(|e| PrintwatchError::MalformedData(e.to_string()))
}

#[async_trait]
impl PersistentStore for JsonFileStore {
    async fn read_json(&self, path: &Path) -> Result<Option<serde_json::Value>> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        parse_document(&raw).map(Some)
    }

    async fn write_json(&self, path: &Path, value: &serde_json::Value) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PrintwatchError::Persist(format!("{}: {e}", parent.display())))?;
        }
        let tmp = temp_path(path);
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| PrintwatchError::Persist(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| PrintwatchError::Persist(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "document written");
        Ok(())
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }
}
