// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::NodeId;

const DKG_SUCCESS: &str = "SUCCESSFUL";

#[derive(Debug, Error)]
pub enum KeyConfigError {
    #[error("cannot read key file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse key file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid key file {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// Distributed key produced by the DKG ceremony, one file per curve
/// (`frost-key-<curve>.json`). The parsed file is forwarded verbatim to the signing
/// service with every signature request.
#[derive(Debug, Clone)]
pub struct DistKeyConfig {
    pub threshold: usize,
    pub public_key: String,
    pub party: Vec<NodeId>,
    raw: Value,
}

#[derive(Deserialize)]
struct KeyFile {
    threshold: usize,
    public_key: String,
    party: Vec<NodeId>,
    #[serde(default)]
    result: Option<String>,
}

impl DistKeyConfig {
    pub fn file_name(curve: &str) -> String {
        format!("frost-key-{curve}.json")
    }

    pub fn load(key_dir: &Path, curve: &str) -> Result<Self, KeyConfigError> {
        let path = key_dir.join(Self::file_name(curve));
        let text = std::fs::read_to_string(&path).map_err(|source| KeyConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_json(&path, &text)
    }

    pub fn from_json(path: &Path, text: &str) -> Result<Self, KeyConfigError> {
        let raw: Value = serde_json::from_str(text).map_err(|source| KeyConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let file = KeyFile::deserialize(&raw).map_err(|source| KeyConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let invalid = |reason: String| KeyConfigError::Invalid {
            path: path.to_path_buf(),
            reason,
        };

        if let Some(result) = file.result.as_deref().filter(|result| *result != DKG_SUCCESS) {
            return Err(invalid(format!("DKG result is {result}")));
        }
        if file.party.is_empty() {
            return Err(invalid("party is empty".to_string()));
        }
        if file.threshold == 0 || file.threshold > file.party.len() {
            return Err(invalid(format!(
                "threshold {} out of range for a party of {}",
                file.threshold,
                file.party.len()
            )));
        }

        Ok(Self {
            threshold: file.threshold,
            public_key: file.public_key,
            party: file.party,
            raw,
        })
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::{DistKeyConfig, KeyConfigError};
    use std::path::Path;
    use tempfile::TempDir;

    #[test]
    fn loads_key_file_by_curve() {
        let dir = TempDir::new().expect("temp dir");
        std::fs::write(
            dir.path().join("frost-key-ed25519.json"),
            r#"{"threshold": 2, "public_key": "0xabc", "party": ["1", "2", "3"], "result": "SUCCESSFUL", "key_type": "ed25519"}"#,
        )
        .expect("write key");

        let key = DistKeyConfig::load(dir.path(), "ed25519").expect("load key");
        assert_eq!(key.threshold, 2);
        assert_eq!(key.public_key, "0xabc");
        assert_eq!(key.party, vec!["1", "2", "3"]);
        assert_eq!(key.raw()["key_type"], "ed25519");
    }

    #[test]
    fn missing_key_file_is_a_read_error() {
        let dir = TempDir::new().expect("temp dir");
        assert!(matches!(
            DistKeyConfig::load(dir.path(), "secp256k1"),
            Err(KeyConfigError::Read { .. })
        ));
    }

    #[test]
    fn rejects_inconsistent_keys() {
        let path = Path::new("frost-key-ed25519.json");
        for text in [
            r#"{"threshold": 3, "public_key": "k", "party": ["1", "2"]}"#,
            r#"{"threshold": 0, "public_key": "k", "party": ["1"]}"#,
            r#"{"threshold": 1, "public_key": "k", "party": ["1"], "result": "FAILED"}"#,
        ] {
            assert!(matches!(
                DistKeyConfig::from_json(path, text),
                Err(KeyConfigError::Invalid { .. })
            ));
        }
        assert!(matches!(
            DistKeyConfig::from_json(path, r#"{"threshold": 1}"#),
            Err(KeyConfigError::Parse { .. })
        ));
    }
}
