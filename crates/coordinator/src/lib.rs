//! Registry of live rooms and wallet session bindings, plus the admission
//! rules that tie them together: one live game per wallet, optimistic
//! stake verification in the background, and signature-gated reconnects.

use std::collections::HashMap;
use std::sync::Arc;

use chess_domain::{EventSink, RoomId, SubscriberId, WalletAddress};
use escrow_verifier::{StakeVerifier, VerificationOutcome};
use handle_registry::{HandleRegistry, HandleRegistryError};
use room_service::{
    RoomHandle, RoomInfo, RoomRetired, RoomSettings, RoomSnapshot, RoomState, spawn_room,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};
use verdict_signer::{SignerError, VerdictSigner, recover_personal_signer};

/// Constant reconnect challenge. The client signs this text with the
/// wallet key; recovery of that signature is the only proof of identity
/// accepted for rebinding a mid-game session.
pub const RECONNECT_MESSAGE: &str = "Reconnecting to CoffeeChess";

const RETIREMENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("room not found")]
    RoomNotFound,
    #[error("room already has two players")]
    RoomFull,
    #[error("game already started")]
    AlreadyStarted,
    #[error("wallet is already in a live game")]
    AlreadyInGame,
    #[error("cannot join your own room")]
    SelfPlay,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("no active session for this wallet")]
    NoActiveSession,
    #[error("room no longer exists")]
    RoomNoLongerExists,
    #[error("signature does not recover to the claimed wallet")]
    SignatureMismatch,
    #[error("signature is malformed")]
    InvalidSignature,
}

impl From<SignerError> for ReconnectError {
    fn from(_: SignerError) -> Self {
        Self::InvalidSignature
    }
}

#[derive(Debug, Clone)]
pub struct SessionBinding {
    pub room_id: RoomId,
    pub subscriber: SubscriberId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenRoomSummary {
    pub room_id: RoomId,
    pub game_id: u64,
    pub stake: u128,
    pub time_budget_seconds: u64,
    pub host: String,
}

#[derive(Debug, Clone)]
pub struct CreatedRoom {
    pub room_id: RoomId,
    pub color: chess_domain::Color,
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    pub default_time_seconds: u64,
    pub draw_offer_ttl_seconds: u64,
    pub reconnect_window_seconds: u64,
    pub retire_after_seconds: u64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            default_time_seconds: 300,
            draw_offer_ttl_seconds: 30,
            reconnect_window_seconds: 60,
            retire_after_seconds: 30,
        }
    }
}

struct RoomEntry {
    handle: RoomHandle,
    onchain_game_id: u64,
    stake: u128,
    time_budget_seconds: u64,
    host: WalletAddress,
}

#[derive(Default)]
struct Registry {
    rooms: HashMap<RoomId, RoomEntry>,
    sessions: HashMap<WalletAddress, SessionBinding>,
}

pub struct Coordinator {
    registry: Mutex<Registry>,
    handles: Mutex<HandleRegistry>,
    sink: Arc<dyn EventSink>,
    signer: Option<Arc<VerdictSigner>>,
    verifier: Arc<StakeVerifier>,
    settings: CoordinatorSettings,
    retired_tx: mpsc::Sender<RoomRetired>,
}

impl Coordinator {
    /// Returns the coordinator together with the retirement notice
    /// receiver; the caller spawns [`Coordinator::run_reaper`] on it.
    pub fn new(
        sink: Arc<dyn EventSink>,
        signer: Option<Arc<VerdictSigner>>,
        verifier: Arc<StakeVerifier>,
        handles: HandleRegistry,
        settings: CoordinatorSettings,
    ) -> (Arc<Self>, mpsc::Receiver<RoomRetired>) {
        let (retired_tx, retired_rx) = mpsc::channel(RETIREMENT_CHANNEL_CAPACITY);
        let coordinator = Arc::new(Self {
            registry: Mutex::new(Registry::default()),
            handles: Mutex::new(handles),
            sink,
            signer,
            verifier,
            settings,
            retired_tx,
        });
        (coordinator, retired_rx)
    }

    /// Consumes room retirement notices and drops the registry entries
    /// plus any session bindings still pointing at the dead room.
    pub async fn run_reaper(self: Arc<Self>, mut retired_rx: mpsc::Receiver<RoomRetired>) {
        while let Some(notice) = retired_rx.recv().await {
            self.reap(notice).await;
        }
    }

    pub async fn reap(&self, notice: RoomRetired) {
        let mut registry = self.registry.lock().await;
        registry.rooms.remove(&notice.room_id);
        for wallet in &notice.wallets {
            if registry
                .sessions
                .get(wallet)
                .is_some_and(|binding| binding.room_id == notice.room_id)
            {
                registry.sessions.remove(wallet);
            }
        }
        info!(room_id = %notice.room_id.0, "room reaped");
    }

    /// Single-wallet rule: a wallet bound to a room that is still alive
    /// and not ended cannot enter another game. Stale bindings (room
    /// ended or already reaped) are cleaned up on the way.
    async fn check_not_in_game(
        &self,
        registry: &mut Registry,
        wallet: &WalletAddress,
    ) -> Result<(), AdmissionError> {
        let Some(binding) = registry.sessions.get(wallet) else {
            return Ok(());
        };
        let room_id = binding.room_id;
        let live = match registry.rooms.get(&room_id) {
            Some(entry) => match entry.handle.info().await {
                Ok(info) => !info.ended,
                Err(_) => false,
            },
            None => false,
        };
        if live {
            return Err(AdmissionError::AlreadyInGame);
        }
        registry.sessions.remove(wallet);
        Ok(())
    }

    fn spawn_stake_verification(&self, handle: RoomHandle, game_id: u64, wallet: WalletAddress, stake: u128) {
        let verifier = Arc::clone(&self.verifier);
        tokio::spawn(async move {
            match verifier.verify(game_id, &wallet, stake).await {
                VerificationOutcome::Admitted => {
                    let _ = handle.stake_verified(wallet).await;
                }
                VerificationOutcome::Denied(reason) => {
                    warn!(game_id, wallet = %wallet, reason, "stake verification denied, cancelling room");
                    let _ = handle
                        .cancel(format!("stake verification failed: {reason}"))
                        .await;
                }
            }
        });
    }

    /// Optimistic admission: the room goes live immediately and the
    /// escrow check runs in the background, tearing the room down on
    /// denial.
    pub async fn create_room(
        &self,
        wallet: WalletAddress,
        subscriber: SubscriberId,
        game_id: u64,
        stake: u128,
        time_budget_seconds: Option<u64>,
    ) -> Result<CreatedRoom, AdmissionError> {
        let mut registry = self.registry.lock().await;
        self.check_not_in_game(&mut registry, &wallet).await?;

        let room_id = RoomId::new();
        let time_budget_seconds =
            time_budget_seconds.unwrap_or(self.settings.default_time_seconds);
        let state = RoomState::new(
            room_id,
            game_id,
            stake,
            RoomSettings {
                time_budget_seconds,
                draw_offer_ttl_seconds: self.settings.draw_offer_ttl_seconds,
                reconnect_window_seconds: self.settings.reconnect_window_seconds,
                retire_after_seconds: self.settings.retire_after_seconds,
            },
            wallet,
            subscriber,
            self.signer.clone(),
        );
        let handle = spawn_room(state, Arc::clone(&self.sink), self.retired_tx.clone());
        registry.rooms.insert(
            room_id,
            RoomEntry {
                handle: handle.clone(),
                onchain_game_id: game_id,
                stake,
                time_budget_seconds,
                host: wallet,
            },
        );
        registry.sessions.insert(
            wallet,
            SessionBinding {
                room_id,
                subscriber,
            },
        );
        drop(registry);

        self.spawn_stake_verification(handle, game_id, wallet, stake);
        info!(room_id = %room_id.0, game_id, wallet = %wallet, "room created");
        Ok(CreatedRoom {
            room_id,
            color: chess_domain::Color::White,
        })
    }

    pub async fn join_room(
        &self,
        wallet: WalletAddress,
        subscriber: SubscriberId,
        room_id: RoomId,
    ) -> Result<CreatedRoom, AdmissionError> {
        let mut registry = self.registry.lock().await;
        self.check_not_in_game(&mut registry, &wallet).await?;
        let Some(entry) = registry.rooms.get(&room_id) else {
            return Err(AdmissionError::RoomNotFound);
        };
        let handle = entry.handle.clone();
        let game_id = entry.onchain_game_id;
        let stake = entry.stake;
        let joined = handle
            .join(wallet, subscriber)
            .await
            .map_err(|_| AdmissionError::RoomNotFound)?;
        match joined {
            Ok(()) => {}
            Err(chess_domain::RoomError::RoomFull) => return Err(AdmissionError::RoomFull),
            Err(chess_domain::RoomError::SelfPlay) => return Err(AdmissionError::SelfPlay),
            Err(chess_domain::RoomError::GameOver) => return Err(AdmissionError::RoomNotFound),
            Err(_) => return Err(AdmissionError::AlreadyStarted),
        }
        registry.sessions.insert(
            wallet,
            SessionBinding {
                room_id,
                subscriber,
            },
        );
        drop(registry);

        self.spawn_stake_verification(handle, game_id, wallet, stake);
        info!(room_id = %room_id.0, game_id, wallet = %wallet, "player joined room");
        Ok(CreatedRoom {
            room_id,
            color: chess_domain::Color::Black,
        })
    }

    /// Signature-gated session rebind. The signature must be a
    /// personal-message signature over [`RECONNECT_MESSAGE`] recovering to
    /// the claimed wallet.
    pub async fn reconnect(
        &self,
        wallet: WalletAddress,
        signature: &str,
        subscriber: SubscriberId,
    ) -> Result<RoomSnapshot, ReconnectError> {
        let recovered = recover_personal_signer(RECONNECT_MESSAGE.as_bytes(), signature)?;
        if recovered != wallet {
            return Err(ReconnectError::SignatureMismatch);
        }

        let mut registry = self.registry.lock().await;
        let Some(binding) = registry.sessions.get(&wallet) else {
            return Err(ReconnectError::NoActiveSession);
        };
        let room_id = binding.room_id;
        let Some(entry) = registry.rooms.get(&room_id) else {
            registry.sessions.remove(&wallet);
            return Err(ReconnectError::RoomNoLongerExists);
        };
        let handle = entry.handle.clone();
        let snapshot = handle
            .reconnect(wallet, subscriber)
            .await
            .map_err(|_| ReconnectError::RoomNoLongerExists)?
            .map_err(|_| ReconnectError::NoActiveSession)?;
        registry.sessions.insert(
            wallet,
            SessionBinding {
                room_id,
                subscriber,
            },
        );
        Ok(snapshot)
    }

    /// Implicit disconnect on transport loss; resolves the subscriber
    /// back to its wallet and arms the room's reconnect window.
    pub async fn drop_subscriber(&self, subscriber: &SubscriberId) {
        let registry = self.registry.lock().await;
        let Some((wallet, binding)) = registry
            .sessions
            .iter()
            .find(|(_, binding)| binding.subscriber == *subscriber)
            .map(|(wallet, binding)| (*wallet, binding.clone()))
        else {
            return;
        };
        let Some(entry) = registry.rooms.get(&binding.room_id) else {
            return;
        };
        let handle = entry.handle.clone();
        drop(registry);
        let _ = handle.disconnect(wallet).await;
    }

    pub async fn room_for(&self, wallet: &WalletAddress) -> Option<RoomHandle> {
        let registry = self.registry.lock().await;
        let binding = registry.sessions.get(wallet)?;
        registry
            .rooms
            .get(&binding.room_id)
            .map(|entry| entry.handle.clone())
    }

    pub async fn room_info(&self, room_id: RoomId) -> Option<RoomInfo> {
        let handle = {
            let registry = self.registry.lock().await;
            registry.rooms.get(&room_id).map(|entry| entry.handle.clone())?
        };
        handle.info().await.ok()
    }

    /// Open means joinable: one seat filled, not started, not ended.
    pub async fn list_open_rooms(&self) -> Vec<OpenRoomSummary> {
        let entries: Vec<(RoomId, RoomHandle, u64, u128, u64, WalletAddress)> = {
            let registry = self.registry.lock().await;
            registry
                .rooms
                .iter()
                .map(|(room_id, entry)| {
                    (
                        *room_id,
                        entry.handle.clone(),
                        entry.onchain_game_id,
                        entry.stake,
                        entry.time_budget_seconds,
                        entry.host,
                    )
                })
                .collect()
        };
        let mut open = Vec::new();
        for (room_id, handle, game_id, stake, time_budget_seconds, host) in entries {
            if let Ok(info) = handle.info().await
                && !info.started
                && !info.ended
                && info.players.len() < 2
            {
                open.push(OpenRoomSummary {
                    room_id,
                    game_id,
                    stake,
                    time_budget_seconds,
                    host: host.to_checksum(),
                });
            }
        }
        open
    }

    pub async fn find_room_by_game_id(&self, game_id: u64) -> Option<OpenRoomSummary> {
        self.list_open_rooms()
            .await
            .into_iter()
            .find(|summary| summary.game_id == game_id)
    }

    pub async fn counts(&self) -> (usize, usize) {
        let registry = self.registry.lock().await;
        (registry.rooms.len(), registry.sessions.len())
    }

    pub async fn username_for(&self, wallet: &WalletAddress) -> Option<String> {
        let handles = self.handles.lock().await;
        handles.handle_for(wallet).map(str::to_string)
    }

    pub async fn set_username(
        &self,
        wallet: &WalletAddress,
        username: &str,
    ) -> Result<(), HandleRegistryError> {
        let mut handles = self.handles.lock().await;
        handles.register(wallet, username)
    }
}
