//! Asynchronous admission gate against the on-chain escrow.
//!
//! Rooms are admitted optimistically; this crate is the safety net. It polls
//! the escrow's `getGameInfo` view over a rotating list of JSON-RPC
//! endpoints and decides whether a wallet's stake is actually locked for
//! the claimed game.

use async_trait::async_trait;
use chess_domain::WalletAddress;
use ethabi::{Function, Param, ParamType, StateMutability, Token};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Escrow status encoding: 0 Pending, 1 Active, 2 Completed, 3 Cancelled.
/// Anything >= 2 (including commit-reveal vestiges) is terminal from the
/// coordinator's perspective.
pub const STATUS_TERMINAL: u8 = 2;

#[derive(Debug, Error)]
pub enum EscrowRpcError {
    #[error("all rpc endpoints failed: {0}")]
    Transport(String),
    #[error("rpc error code={code} message={message}")]
    Rpc { code: i64, message: String },
    #[error("abi decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameInfo {
    pub player1: WalletAddress,
    pub player2: WalletAddress,
    pub stake_per_player: u128,
    pub total_staked: u128,
    pub created_at: u64,
    pub status: u8,
    pub winner: WalletAddress,
}

impl GameInfo {
    #[must_use]
    pub fn has_player(&self, wallet: &WalletAddress) -> bool {
        self.player1 == *wallet || self.player2 == *wallet
    }

    /// True for records the chain has not materialized yet (reads of a
    /// game id whose creating transaction is still pending decode to all
    /// zeroes).
    #[must_use]
    pub fn is_empty_record(&self) -> bool {
        self.player1.is_zero() && self.player2.is_zero()
    }
}

#[async_trait]
pub trait EscrowClient: Send + Sync {
    async fn get_game_info(&self, game_id: u64) -> Result<GameInfo, EscrowRpcError>;
    async fn trusted_signer(&self) -> Result<WalletAddress, EscrowRpcError>;
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'a str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    #[allow(dead_code)]
    jsonrpc: String,
    #[allow(dead_code)]
    id: Value,
    result: Option<T>,
    error: Option<JsonRpcErrorObj>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorObj {
    code: i64,
    message: String,
}

/// `eth_call`-based escrow reader. Keeps a cursor into the endpoint list
/// and advances it whenever an endpoint fails at the transport level, so a
/// single dead node does not stall admission.
#[derive(Debug)]
pub struct JsonRpcEscrowClient {
    endpoints: Vec<String>,
    active: AtomicUsize,
    module: WalletAddress,
    client: reqwest::Client,
}

impl JsonRpcEscrowClient {
    #[must_use]
    pub fn new(endpoints: Vec<String>, module: WalletAddress) -> Self {
        Self {
            endpoints,
            active: AtomicUsize::new(0),
            module,
            client: reqwest::Client::new(),
        }
    }

    async fn eth_call(&self, call_data: Vec<u8>) -> Result<Vec<u8>, EscrowRpcError> {
        if self.endpoints.is_empty() {
            return Err(EscrowRpcError::Transport("no rpc endpoints configured".to_string()));
        }
        let params = serde_json::json!([
            {
                "to": self.module.to_lower_hex(),
                "data": format!("0x{}", hex::encode(call_data)),
            },
            "latest",
        ]);

        let start = self.active.load(Ordering::Relaxed);
        let mut last_error = String::new();
        for offset in 0..self.endpoints.len() {
            let index = (start + offset) % self.endpoints.len();
            let endpoint = &self.endpoints[index];
            let body = JsonRpcRequest {
                jsonrpc: "2.0",
                id: 1,
                method: "eth_call",
                params: params.clone(),
            };
            let sent = self.client.post(endpoint).json(&body).send().await;
            let response = match sent {
                Ok(response) => response,
                Err(err) => {
                    warn!(endpoint, error = %err, "escrow rpc transport failure, rotating endpoint");
                    last_error = err.to_string();
                    self.active.store((index + 1) % self.endpoints.len(), Ordering::Relaxed);
                    continue;
                }
            };
            let payload: JsonRpcResponse<String> = match response.json().await {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(endpoint, error = %err, "escrow rpc returned unreadable body, rotating endpoint");
                    last_error = err.to_string();
                    self.active.store((index + 1) % self.endpoints.len(), Ordering::Relaxed);
                    continue;
                }
            };
            if let Some(err) = payload.error {
                return Err(EscrowRpcError::Rpc {
                    code: err.code,
                    message: err.message,
                });
            }
            let result = payload
                .result
                .ok_or_else(|| EscrowRpcError::Decode("missing result".to_string()))?;
            let raw = result.trim().trim_start_matches("0x");
            return hex::decode(raw).map_err(|err| EscrowRpcError::Decode(err.to_string()));
        }
        Err(EscrowRpcError::Transport(last_error))
    }
}

#[allow(deprecated)]
fn get_game_info_function() -> Function {
    Function {
        name: "getGameInfo".to_string(),
        inputs: vec![Param {
            name: "gameId".to_string(),
            kind: ParamType::Uint(256),
            internal_type: None,
        }],
        outputs: vec![
            Param {
                name: "player1".to_string(),
                kind: ParamType::Address,
                internal_type: None,
            },
            Param {
                name: "player2".to_string(),
                kind: ParamType::Address,
                internal_type: None,
            },
            Param {
                name: "stakePerPlayer".to_string(),
                kind: ParamType::Uint(256),
                internal_type: None,
            },
            Param {
                name: "totalStaked".to_string(),
                kind: ParamType::Uint(256),
                internal_type: None,
            },
            Param {
                name: "createdAt".to_string(),
                kind: ParamType::Uint(256),
                internal_type: None,
            },
            Param {
                name: "status".to_string(),
                kind: ParamType::Uint(8),
                internal_type: None,
            },
            Param {
                name: "winner".to_string(),
                kind: ParamType::Address,
                internal_type: None,
            },
        ],
        constant: None,
        state_mutability: StateMutability::View,
    }
}

#[allow(deprecated)]
fn trusted_signer_function() -> Function {
    Function {
        name: "trustedSigner".to_string(),
        inputs: vec![],
        outputs: vec![Param {
            name: "signer".to_string(),
            kind: ParamType::Address,
            internal_type: None,
        }],
        constant: None,
        state_mutability: StateMutability::View,
    }
}

fn token_address(token: Token) -> Result<WalletAddress, EscrowRpcError> {
    token
        .into_address()
        .map(|address| WalletAddress::from_bytes(address.0))
        .ok_or_else(|| EscrowRpcError::Decode("expected address token".to_string()))
}

fn token_u128(token: Token) -> Result<u128, EscrowRpcError> {
    let value = token
        .into_uint()
        .ok_or_else(|| EscrowRpcError::Decode("expected uint token".to_string()))?;
    if value.bits() > 128 {
        return Err(EscrowRpcError::Decode("uint exceeds 128 bits".to_string()));
    }
    Ok(value.low_u128())
}

fn token_u64(token: Token) -> Result<u64, EscrowRpcError> {
    let value = token
        .into_uint()
        .ok_or_else(|| EscrowRpcError::Decode("expected uint token".to_string()))?;
    if value.bits() > 64 {
        return Err(EscrowRpcError::Decode("uint exceeds 64 bits".to_string()));
    }
    Ok(value.low_u64())
}

#[async_trait]
impl EscrowClient for JsonRpcEscrowClient {
    async fn get_game_info(&self, game_id: u64) -> Result<GameInfo, EscrowRpcError> {
        let function = get_game_info_function();
        let call_data = function
            .encode_input(&[Token::Uint(ethabi::ethereum_types::U256::from(game_id))])
            .map_err(|err| EscrowRpcError::Decode(err.to_string()))?;
        let output = self.eth_call(call_data).await?;
        let mut tokens = function
            .decode_output(&output)
            .map_err(|err| EscrowRpcError::Decode(err.to_string()))?
            .into_iter();
        let mut next = |name: &str| {
            tokens
                .next()
                .ok_or_else(|| EscrowRpcError::Decode(format!("missing output {name}")))
        };
        Ok(GameInfo {
            player1: token_address(next("player1")?)?,
            player2: token_address(next("player2")?)?,
            stake_per_player: token_u128(next("stakePerPlayer")?)?,
            total_staked: token_u128(next("totalStaked")?)?,
            created_at: token_u64(next("createdAt")?)?,
            status: token_u64(next("status")?)? as u8,
            winner: token_address(next("winner")?)?,
        })
    }

    async fn trusted_signer(&self) -> Result<WalletAddress, EscrowRpcError> {
        let function = trusted_signer_function();
        let call_data = function
            .encode_input(&[])
            .map_err(|err| EscrowRpcError::Decode(err.to_string()))?;
        let output = self.eth_call(call_data).await?;
        let token = function
            .decode_output(&output)
            .map_err(|err| EscrowRpcError::Decode(err.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| EscrowRpcError::Decode("missing trustedSigner output".to_string()))?;
        token_address(token)
    }
}

/// Linear backoff: attempt N sleeps N x base before retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 15,
            base_delay: Duration::from_secs(3),
        }
    }
}

impl LinearBackoff {
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Admitted,
    Denied(String),
}

/// Retry-with-backoff admission check. RPC failures and not-yet-visible
/// records are retryable; an explicit terminal status or a record naming
/// other players denies immediately.
pub struct StakeVerifier {
    client: Arc<dyn EscrowClient>,
    backoff: LinearBackoff,
}

impl StakeVerifier {
    #[must_use]
    pub fn new(client: Arc<dyn EscrowClient>, backoff: LinearBackoff) -> Self {
        Self { client, backoff }
    }

    #[must_use]
    pub fn client(&self) -> Arc<dyn EscrowClient> {
        Arc::clone(&self.client)
    }

    pub async fn verify(
        &self,
        game_id: u64,
        wallet: &WalletAddress,
        expected_stake: u128,
    ) -> VerificationOutcome {
        for attempt in 1..=self.backoff.max_attempts {
            match self.client.get_game_info(game_id).await {
                Ok(info) => {
                    if info.status >= STATUS_TERMINAL {
                        return VerificationOutcome::Denied(format!(
                            "escrow game {game_id} is no longer open (status {})",
                            info.status
                        ));
                    }
                    if info.is_empty_record() {
                        debug!(game_id, attempt, "escrow record not visible yet");
                    } else if info.has_player(wallet) {
                        if expected_stake > 0 && info.stake_per_player != expected_stake {
                            // The on-chain amount is authoritative; the
                            // client-announced stake is informational only.
                            warn!(
                                game_id,
                                wallet = %wallet,
                                announced = expected_stake,
                                onchain = info.stake_per_player,
                                "announced stake differs from escrow record"
                            );
                        }
                        return VerificationOutcome::Admitted;
                    } else {
                        return VerificationOutcome::Denied(format!(
                            "wallet {wallet} is not a player of escrow game {game_id}"
                        ));
                    }
                }
                Err(err) => {
                    debug!(game_id, attempt, error = %err, "escrow verification attempt failed");
                }
            }
            if attempt < self.backoff.max_attempts {
                tokio::time::sleep(self.backoff.delay_for(attempt)).await;
            }
        }
        VerificationOutcome::Denied(format!(
            "escrow verification for game {game_id} exhausted {} attempts",
            self.backoff.max_attempts
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn wallet(fill: u8) -> WalletAddress {
        WalletAddress::from_bytes([fill; 20])
    }

    fn open_game(p1: WalletAddress, p2: WalletAddress) -> GameInfo {
        GameInfo {
            player1: p1,
            player2: p2,
            stake_per_player: 1000,
            total_staked: 2000,
            created_at: 1_700_000_000,
            status: 1,
            winner: WalletAddress::ZERO,
        }
    }

    struct ScriptedClient {
        responses: Mutex<Vec<Result<GameInfo, EscrowRpcError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Result<GameInfo, EscrowRpcError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(0),
            }
        }

        fn call_count(&self) -> u32 {
            *self.calls.lock().expect("calls")
        }
    }

    #[async_trait]
    impl EscrowClient for ScriptedClient {
        async fn get_game_info(&self, _game_id: u64) -> Result<GameInfo, EscrowRpcError> {
            *self.calls.lock().expect("calls") += 1;
            let mut responses = self.responses.lock().expect("responses");
            if responses.is_empty() {
                return Err(EscrowRpcError::Transport("script exhausted".to_string()));
            }
            responses.remove(0)
        }

        async fn trusted_signer(&self) -> Result<WalletAddress, EscrowRpcError> {
            Ok(wallet(0xaa))
        }
    }

    fn verifier(client: Arc<ScriptedClient>, max_attempts: u32) -> StakeVerifier {
        StakeVerifier::new(
            client,
            LinearBackoff {
                max_attempts,
                base_delay: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn admits_member_wallet_of_open_game() {
        let p1 = wallet(1);
        let p2 = wallet(2);
        let client = Arc::new(ScriptedClient::new(vec![Ok(open_game(p1, p2))]));
        let outcome = verifier(client.clone(), 3).verify(7, &p2, 1000).await;
        assert_eq!(outcome, VerificationOutcome::Admitted);
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn retries_transport_failures_then_admits() {
        let p1 = wallet(1);
        let client = Arc::new(ScriptedClient::new(vec![
            Err(EscrowRpcError::Transport("down".to_string())),
            Err(EscrowRpcError::Rpc {
                code: -32000,
                message: "overloaded".to_string(),
            }),
            Ok(open_game(p1, wallet(2))),
        ]));
        let outcome = verifier(client.clone(), 5).verify(7, &p1, 0).await;
        assert_eq!(outcome, VerificationOutcome::Admitted);
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn terminal_status_denies_immediately() {
        let mut info = open_game(wallet(1), wallet(2));
        info.status = 2;
        let client = Arc::new(ScriptedClient::new(vec![Ok(info)]));
        let outcome = verifier(client.clone(), 5).verify(7, &wallet(1), 0).await;
        assert!(matches!(outcome, VerificationOutcome::Denied(_)));
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn foreign_wallet_denies_immediately() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(open_game(wallet(1), wallet(2)))]));
        let outcome = verifier(client.clone(), 5).verify(7, &wallet(9), 0).await;
        assert!(matches!(outcome, VerificationOutcome::Denied(_)));
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn empty_record_is_retried_until_visible() {
        let empty = GameInfo {
            player1: WalletAddress::ZERO,
            player2: WalletAddress::ZERO,
            stake_per_player: 0,
            total_staked: 0,
            created_at: 0,
            status: 0,
            winner: WalletAddress::ZERO,
        };
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(empty),
            Ok(open_game(wallet(1), wallet(2))),
        ]));
        let outcome = verifier(client.clone(), 5).verify(7, &wallet(1), 0).await;
        assert_eq!(outcome, VerificationOutcome::Admitted);
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_attempts_deny() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let outcome = verifier(client.clone(), 3).verify(7, &wallet(1), 0).await;
        assert!(matches!(outcome, VerificationOutcome::Denied(_)));
        assert_eq!(client.call_count(), 3);
    }

    #[test]
    fn linear_backoff_scales_with_attempt() {
        let backoff = LinearBackoff {
            max_attempts: 15,
            base_delay: Duration::from_secs(3),
        };
        assert_eq!(backoff.delay_for(1), Duration::from_secs(3));
        assert_eq!(backoff.delay_for(5), Duration::from_secs(15));
    }

    #[test]
    fn get_game_info_call_data_selects_expected_function() {
        let function = get_game_info_function();
        let data = function
            .encode_input(&[Token::Uint(ethabi::ethereum_types::U256::from(1u64))])
            .expect("encode");
        // 4-byte selector plus one 32-byte argument.
        assert_eq!(data.len(), 36);
        assert_eq!(&data[4..35], &[0u8; 31]);
        assert_eq!(data[35], 1);
    }
}
