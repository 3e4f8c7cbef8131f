//! Verdict signing for the escrow contract, plus the personal-message
//! ECDSA primitives used for reconnect authentication.
//!
//! The escrow recovers signatures against its configured trusted signer, so
//! payload construction must match the contract byte for byte:
//! `keccak256(abi.encodePacked(prefix, uint256 gameId, address claimant,
//! uint256 chainId, address module))`, wrapped in the
//! `"\x19Ethereum Signed Message:\n32"` envelope before signing.

use chess_domain::WalletAddress;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use sha3::{Digest, Keccak256};
use thiserror::Error;

const WIN_PREFIX: &[u8] = b"GAME_WIN";
const DRAW_PREFIX: &[u8] = b"GAME_DRAW";

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid private key material")]
    InvalidKey,
    #[error("signature must be 65 hex-encoded bytes")]
    MalformedSignature,
    #[error("signature recovery failed")]
    RecoveryFailed,
    #[error("signing failed: {0}")]
    Signing(String),
}

/// A 65-byte `r || s || v` signature, rendered as 0x-prefixed hex. Once a
/// verdict signature is produced it is cached verbatim, so every retrieval
/// is bit-identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcdsaSignature(pub [u8; 65]);

impl EcdsaSignature {
    #[must_use]
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn from_hex(value: &str) -> Result<Self, SignerError> {
        let raw = value.trim();
        let raw = raw.strip_prefix("0x").unwrap_or(raw);
        let bytes = hex::decode(raw).map_err(|_| SignerError::MalformedSignature)?;
        let bytes: [u8; 65] = bytes
            .try_into()
            .map_err(|_| SignerError::MalformedSignature)?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Display for EcdsaSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[must_use]
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// `personal_sign` digest: `keccak256("\x19Ethereum Signed Message:\n" ||
/// len(message) || message)`.
#[must_use]
pub fn personal_message_hash(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

#[must_use]
pub fn address_from_verifying_key(key: &VerifyingKey) -> WalletAddress {
    let point = key.to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&digest[12..]);
    WalletAddress::from_bytes(bytes)
}

/// Sign an arbitrary message under the personal-message envelope, returning
/// the 65-byte recoverable signature.
pub fn sign_personal_message(
    key: &SigningKey,
    message: &[u8],
) -> Result<EcdsaSignature, SignerError> {
    let digest = personal_message_hash(message);
    let (signature, recovery_id) = key
        .sign_prehash_recoverable(&digest)
        .map_err(|err| SignerError::Signing(err.to_string()))?;
    let mut out = [0u8; 65];
    out[..64].copy_from_slice(&signature.to_bytes());
    out[64] = 27 + recovery_id.to_byte();
    Ok(EcdsaSignature(out))
}

/// Recover the wallet that produced a personal-message signature. This is
/// the sole authentication primitive for mid-game reconnects.
pub fn recover_personal_signer(
    message: &[u8],
    signature_hex: &str,
) -> Result<WalletAddress, SignerError> {
    let signature = EcdsaSignature::from_hex(signature_hex)?;
    let digest = personal_message_hash(message);
    let v = signature.0[64];
    let recovery_byte = if v >= 27 { v - 27 } else { v };
    let recovery_id =
        RecoveryId::from_byte(recovery_byte).ok_or(SignerError::MalformedSignature)?;
    let parsed = Signature::from_slice(&signature.0[..64])
        .map_err(|_| SignerError::MalformedSignature)?;
    let key = VerifyingKey::recover_from_prehash(&digest, &parsed, recovery_id)
        .map_err(|_| SignerError::RecoveryFailed)?;
    Ok(address_from_verifying_key(&key))
}

fn u256_be(value: u64) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[24..].copy_from_slice(&value.to_be_bytes());
    out
}

/// Holds the trusted signing key for the whole process. The key is read
/// from the environment at startup and never leaves memory.
pub struct VerdictSigner {
    key: SigningKey,
    chain_id: u64,
    module: WalletAddress,
}

impl VerdictSigner {
    pub fn new(key: SigningKey, chain_id: u64, module: WalletAddress) -> Self {
        Self {
            key,
            chain_id,
            module,
        }
    }

    pub fn from_hex_key(
        private_key_hex: &str,
        chain_id: u64,
        module: WalletAddress,
    ) -> Result<Self, SignerError> {
        let raw = private_key_hex.trim();
        let raw = raw.strip_prefix("0x").unwrap_or(raw);
        let bytes = hex::decode(raw).map_err(|_| SignerError::InvalidKey)?;
        let key = SigningKey::from_slice(&bytes).map_err(|_| SignerError::InvalidKey)?;
        Ok(Self::new(key, chain_id, module))
    }

    /// Address the escrow must have registered as its trusted signer.
    #[must_use]
    pub fn signer_address(&self) -> WalletAddress {
        address_from_verifying_key(self.key.verifying_key())
    }

    #[must_use]
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    #[must_use]
    pub fn module_address(&self) -> WalletAddress {
        self.module
    }

    fn claim_digest(&self, prefix: &[u8], game_id: u64, claimant: &WalletAddress) -> [u8; 32] {
        let mut hasher = Keccak256::new();
        hasher.update(prefix);
        hasher.update(u256_be(game_id));
        hasher.update(claimant.as_bytes());
        hasher.update(u256_be(self.chain_id));
        hasher.update(self.module.as_bytes());
        hasher.finalize().into()
    }

    fn sign_claim(
        &self,
        prefix: &[u8],
        game_id: u64,
        claimant: &WalletAddress,
    ) -> Result<EcdsaSignature, SignerError> {
        let digest = self.claim_digest(prefix, game_id, claimant);
        sign_personal_message(&self.key, &digest)
    }

    /// Signature for `claimGameWin(gameId, signature)`.
    pub fn sign_win(
        &self,
        game_id: u64,
        winner: &WalletAddress,
    ) -> Result<EcdsaSignature, SignerError> {
        self.sign_claim(WIN_PREFIX, game_id, winner)
    }

    /// Two signatures for `claimGameDraw`, one per claimant. They differ
    /// only in the embedded claimant address.
    pub fn sign_draw(
        &self,
        game_id: u64,
        white: &WalletAddress,
        black: &WalletAddress,
    ) -> Result<(EcdsaSignature, EcdsaSignature), SignerError> {
        let white_signature = self.sign_claim(DRAW_PREFIX, game_id, white)?;
        let black_signature = self.sign_claim(DRAW_PREFIX, game_id, black)?;
        Ok((white_signature, black_signature))
    }

    /// Recover the signer of a win claim, as the escrow contract would.
    pub fn recover_win_claim(
        &self,
        game_id: u64,
        winner: &WalletAddress,
        signature: &EcdsaSignature,
    ) -> Result<WalletAddress, SignerError> {
        let digest = self.claim_digest(WIN_PREFIX, game_id, winner);
        recover_personal_signer(&digest, &signature.to_hex())
    }

    /// Recover the signer of a draw claim for one claimant.
    pub fn recover_draw_claim(
        &self,
        game_id: u64,
        claimant: &WalletAddress,
        signature: &EcdsaSignature,
    ) -> Result<WalletAddress, SignerError> {
        let digest = self.claim_digest(DRAW_PREFIX, game_id, claimant);
        recover_personal_signer(&digest, &signature.to_hex())
    }
}

impl std::fmt::Debug for VerdictSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerdictSigner")
            .field("signer", &self.signer_address())
            .field("chain_id", &self.chain_id)
            .field("module", &self.module)
            .finish_non_exhaustive()
    }
}
