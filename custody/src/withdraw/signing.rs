// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use super::NodeId;
use super::key::DistKeyConfig;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("{stage} request failed")]
    Transport {
        stage: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{stage} response malformed: {reason}")]
    Malformed { stage: &'static str, reason: String },
    #[error("node {node} returned {got} nonce commitments, {wanted} needed")]
    NotEnoughNonces {
        node: NodeId,
        got: usize,
        wanted: usize,
    },
}

/// One nonce commitment per selected node, for exactly one signature request. Not
/// cloneable: a signature request consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct NonceRound {
    commitments: BTreeMap<NodeId, Value>,
}

impl NonceRound {
    pub fn into_commitments(self) -> BTreeMap<NodeId, Value> {
        self.commitments
    }
}

/// Nonce commitments returned by round one, handed out one round at a time. A commitment
/// leaves the pool when its round is taken, so no commitment can back two signatures.
#[derive(Debug)]
pub struct NoncePool {
    by_node: BTreeMap<NodeId, Vec<Value>>,
}

impl NoncePool {
    /// Requires at least `rounds` commitments from every node of `party`.
    pub fn new(
        party: &[NodeId],
        mut commitments: BTreeMap<NodeId, Vec<Value>>,
        rounds: usize,
    ) -> Result<Self, SigningError> {
        let mut by_node = BTreeMap::new();
        for node in party {
            let nonces = commitments.remove(node).unwrap_or_default();
            if nonces.len() < rounds {
                return Err(SigningError::NotEnoughNonces {
                    node: node.clone(),
                    got: nonces.len(),
                    wanted: rounds,
                });
            }
            by_node.insert(node.clone(), nonces);
        }
        Ok(Self { by_node })
    }

    pub fn take_round(&mut self) -> Option<NonceRound> {
        if self.by_node.values().any(Vec::is_empty) {
            return None;
        }
        let commitments = self
            .by_node
            .iter_mut()
            .filter_map(|(node, nonces)| Some((node.clone(), nonces.pop()?)))
            .collect();
        Some(NonceRound { commitments })
    }
}

/// Threshold-signature service: nonce commitments (round one) and aggregated signatures
/// (round two) from a selected party.
#[async_trait]
pub trait SigningService: Send + Sync {
    async fn request_nonces(
        &self,
        party: &[NodeId],
        public_key: &str,
        count: usize,
    ) -> Result<BTreeMap<NodeId, Vec<Value>>, SigningError>;

    async fn request_signature(
        &self,
        key: &DistKeyConfig,
        nonces: NonceRound,
        message: &Value,
        party: &[NodeId],
    ) -> Result<String, SigningError>;
}

/// Signing aggregator reached over HTTP: `POST {base}/nonces` and `POST {base}/sign`.
pub struct HttpSigningService {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NoncesRequest<'a> {
    party: &'a [NodeId],
    public_key: &'a str,
    count: usize,
}

#[derive(Deserialize)]
struct NodeNonces {
    commitments: Vec<Value>,
}

#[derive(Deserialize)]
struct SignatureResponse {
    signature: SignatureValue,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SignatureValue {
    Text(String),
    Number(u64),
}

impl HttpSigningService {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, SigningError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|source| SigningError::Transport {
                stage: "client",
                source,
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize + ?Sized, T: for<'de> Deserialize<'de>>(
        &self,
        stage: &'static str,
        path: &str,
        body: &B,
    ) -> Result<T, SigningError> {
        debug!(stage, "signing service request");
        self.client
            .post(format!("{}/{path}", self.base_url))
            .json(body)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|source| SigningError::Transport { stage, source })?
            .json()
            .await
            .map_err(|source| SigningError::Transport { stage, source })
    }
}

#[async_trait]
impl SigningService for HttpSigningService {
    async fn request_nonces(
        &self,
        party: &[NodeId],
        public_key: &str,
        count: usize,
    ) -> Result<BTreeMap<NodeId, Vec<Value>>, SigningError> {
        let request = NoncesRequest {
            party,
            public_key,
            count,
        };
        let response: BTreeMap<NodeId, NodeNonces> =
            self.post("nonces", "nonces", &request).await?;
        Ok(response
            .into_iter()
            .map(|(node, nonces)| (node, nonces.commitments))
            .collect())
    }

    async fn request_signature(
        &self,
        key: &DistKeyConfig,
        nonces: NonceRound,
        message: &Value,
        party: &[NodeId],
    ) -> Result<String, SigningError> {
        let request = json!({
            "distKey": key.raw(),
            "nonces": nonces.into_commitments(),
            "data": message,
            "party": party,
        });
        let response: SignatureResponse = self.post("signature", "sign", &request).await?;
        match response.signature {
            SignatureValue::Text(signature) if !signature.is_empty() => Ok(signature),
            SignatureValue::Text(_) => Err(SigningError::Malformed {
                stage: "signature",
                reason: "empty signature".to_string(),
            }),
            SignatureValue::Number(signature) => Ok(signature.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{NoncePool, SigningError};
    use serde_json::{Value, json};
    use std::collections::{BTreeMap, BTreeSet};

    fn party() -> Vec<String> {
        vec!["n1".to_string(), "n2".to_string()]
    }

    fn commitments(per_node: usize) -> BTreeMap<String, Vec<Value>> {
        party()
            .into_iter()
            .map(|node| {
                let nonces = (0..per_node).map(|i| json!(format!("{node}-{i}"))).collect();
                (node, nonces)
            })
            .collect()
    }

    #[test]
    fn every_commitment_backs_exactly_one_round() {
        let mut pool = NoncePool::new(&party(), commitments(3), 3).expect("pool");
        let mut seen = BTreeSet::new();
        for _ in 0..3 {
            let round = pool.take_round().expect("round");
            let commitments = round.into_commitments();
            assert_eq!(commitments.len(), 2);
            for nonce in commitments.into_values() {
                assert!(seen.insert(nonce.to_string()), "nonce reused");
            }
        }
        assert_eq!(seen.len(), 6);
        assert!(pool.take_round().is_none());
    }

    #[test]
    fn short_nonce_batches_are_rejected() {
        let mut short = commitments(2);
        short.insert("n2".to_string(), vec![json!("only-one")]);
        let err = NoncePool::new(&party(), short, 2).expect_err("short batch");
        assert!(matches!(
            err,
            SigningError::NotEnoughNonces { ref node, got: 1, wanted: 2 } if node == "n2"
        ));

        let mut missing = commitments(2);
        missing.remove("n1");
        assert!(NoncePool::new(&party(), missing, 1).is_err());
    }
}
