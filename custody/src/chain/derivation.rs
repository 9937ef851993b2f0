// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Deterministic deposit-address derivation, one formula per chain.

use alloy_primitives::hex;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use custody_core::ChainId;
use ed25519_dalek::VerifyingKey;
use sha2::{Digest, Sha256};
use thiserror::Error;

const USER_VAULT_SEED: &[u8] = b"user-vault";
const PDA_MARKER: &[u8] = b"ProgramDerivedAddress";
const TON_MEMO_HEX_LEN: usize = 30;
const TON_MAX_USER: u64 = (1 << 40) - 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DerivationError {
    #[error("invalid program id {0}")]
    InvalidProgramId(String),
    #[error("invalid agent id {0}")]
    InvalidAgent(String),
    #[error("invalid TON address {0}")]
    InvalidTonAddress(String),
    #[error("user index {0} does not fit in 40 bits")]
    UserOutOfRange(u64),
    #[error("no off-curve program address for these seeds")]
    NoViableBump,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedAddress {
    pub address: String,
    pub memo: Option<String>,
}

/// Solana user vault: the program-derived address of the asset manager program over
/// `["user-vault", agent, account, user]`.
pub fn solana_deposit_address(
    program_id: &str,
    agent: &str,
    account: u64,
    user: u64,
) -> Result<DerivedAddress, DerivationError> {
    let program: [u8; 32] = bs58::decode(program_id)
        .into_vec()
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| DerivationError::InvalidProgramId(program_id.to_string()))?;

    let agent_bytes = agent_bytes(agent)?;
    if agent_bytes.len() > 32 {
        return Err(DerivationError::InvalidAgent(agent.to_string()));
    }
    let mut agent_seed = [0u8; 32];
    agent_seed[32 - agent_bytes.len()..].copy_from_slice(&agent_bytes);

    let seeds: [&[u8]; 4] = [
        USER_VAULT_SEED,
        &agent_seed,
        &account.to_be_bytes(),
        &user.to_be_bytes(),
    ];
    let address = find_program_address(&seeds, &program)?;
    Ok(DerivedAddress {
        address: bs58::encode(address).into_string(),
        memo: None,
    })
}

fn find_program_address(seeds: &[&[u8]], program: &[u8; 32]) -> Result<[u8; 32], DerivationError> {
    for bump in (0..=u8::MAX).rev() {
        let mut hasher = Sha256::new();
        for seed in seeds {
            hasher.update(seed);
        }
        hasher.update([bump]);
        hasher.update(program);
        hasher.update(PDA_MARKER);
        let candidate: [u8; 32] = hasher.finalize().into();
        // A program address must not be a valid ed25519 public key.
        if VerifyingKey::from_bytes(&candidate).is_err() {
            return Ok(candidate);
        }
    }
    Err(DerivationError::NoViableBump)
}

/// TON deposits all go to the shared asset manager; the user slot is carried by a memo.
pub fn ton_deposit_address(
    assetman: &str,
    agent: &str,
    account: u64,
    user: u64,
) -> Result<DerivedAddress, DerivationError> {
    if user > TON_MAX_USER {
        return Err(DerivationError::UserOutOfRange(user));
    }
    let (workchain, hash) = parse_ton_address(assetman)?;

    let mut hasher = Sha256::new();
    hasher.update(hash);
    hasher.update(workchain.to_be_bytes());
    hasher.update(agent_bytes(agent)?);
    hasher.update(account.to_be_bytes());
    hasher.update(&user.to_be_bytes()[3..]);
    let digest = hex::encode(hasher.finalize());

    Ok(DerivedAddress {
        address: assetman.to_string(),
        memo: Some(digest[..TON_MEMO_HEX_LEN].to_string()),
    })
}

/// Per-chain asset-manager addresses used to derive deposit addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressDeriver {
    pub solana_program: String,
    pub ton_assetman: String,
}

impl AddressDeriver {
    pub fn derive(
        &self,
        chain: ChainId,
        agent: &str,
        account: u64,
        user: u64,
    ) -> Result<DerivedAddress, DerivationError> {
        match chain {
            ChainId::Solana => solana_deposit_address(&self.solana_program, agent, account, user),
            ChainId::Ton => ton_deposit_address(&self.ton_assetman, agent, account, user),
        }
    }
}

fn agent_bytes(agent: &str) -> Result<Vec<u8>, DerivationError> {
    hex::decode(agent).map_err(|_| DerivationError::InvalidAgent(agent.to_string()))
}

/// Accepts the raw form `<workchain>:<hex hash>` and the 48-character user-friendly form
/// (either base64 alphabet).
fn parse_ton_address(address: &str) -> Result<(i32, [u8; 32]), DerivationError> {
    let invalid = || DerivationError::InvalidTonAddress(address.to_string());

    if let Some((workchain, hash)) = address.split_once(':') {
        let workchain: i32 = workchain.parse().map_err(|_| invalid())?;
        let hash: [u8; 32] = hex::decode(hash)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(invalid)?;
        return Ok((workchain, hash));
    }

    if address.len() != 48 {
        return Err(invalid());
    }
    let decoded = URL_SAFE
        .decode(address)
        .or_else(|_| STANDARD.decode(address))
        .map_err(|_| invalid())?;
    let bytes: [u8; 36] = decoded.try_into().map_err(|_| invalid())?;
    let checksum = u16::from_be_bytes([bytes[34], bytes[35]]);
    if crc16_xmodem(&bytes[..34]) != checksum {
        return Err(invalid());
    }
    let workchain = i32::from(bytes[1] as i8);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes[2..34]);
    Ok((workchain, hash))
}

fn crc16_xmodem(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in data {
        crc ^= u16::from(*byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}
