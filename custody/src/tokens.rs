// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::BTreeMap;

use custody_core::{ChainId, TokenInfo};

const BUNDLED_TOKENS: &str = include_str!("../data/available-tokens.json");

/// Tokens the service accepts per chain, bundled with the binary.
#[derive(Debug, Clone, Default)]
pub struct TokenRegistry {
    by_chain: BTreeMap<ChainId, Vec<TokenInfo>>,
}

impl TokenRegistry {
    pub fn bundled() -> Result<Self, serde_json::Error> {
        Self::from_json(BUNDLED_TOKENS)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self {
            by_chain: serde_json::from_str(json)?,
        })
    }

    pub fn all(&self) -> &BTreeMap<ChainId, Vec<TokenInfo>> {
        &self.by_chain
    }

    pub fn for_chain(&self, chain: ChainId) -> &[TokenInfo] {
        self.by_chain.get(&chain).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn by_symbol(&self, chain: ChainId, symbol: &str) -> Option<&TokenInfo> {
        self.for_chain(chain)
            .iter()
            .find(|token| token.symbol == symbol)
    }
}
