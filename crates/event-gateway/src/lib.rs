//! Authenticated ingress for client messages: rate limiting, input
//! validation, routing to the coordinator and rooms, acks back to the
//! caller, and fan-out of room events through the subscriber hub. This is
//! the only layer that knows about transport identities; rooms and the
//! coordinator see wallets and subscriber handles only.

mod hub;
mod limiter;
mod messages;

pub use hub::SubscriberHub;
pub use limiter::{FixedWindowLimiter, RateBucket, RateLimited, RateLimits, WindowLimit};
pub use messages::ClientRequest;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chess_domain::{RoomError, RoomId, ServerEvent, SubscriberId, WalletAddress};
use coordinator::{AdmissionError, Coordinator, ReconnectError};
use handle_registry::HandleRegistryError;
use platform_core::{ErrorCode, ResponseEnvelope};
use room_service::{RoomClosed, RoomHandle};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

pub type Ack = ResponseEnvelope<Value>;

fn room_error_code(err: RoomError) -> ErrorCode {
    match err {
        RoomError::NotParticipant => ErrorCode::NotParticipant,
        RoomError::NotYourTurn => ErrorCode::NotYourTurn,
        RoomError::IllegalMove => ErrorCode::IllegalMove,
        RoomError::InvalidMoveFormat => ErrorCode::InvalidMoveFormat,
        RoomError::GameOver => ErrorCode::GameOver,
        RoomError::NotStarted => ErrorCode::GameNotStarted,
        RoomError::RoomFull => ErrorCode::RoomFull,
        RoomError::SelfPlay => ErrorCode::SelfPlay,
        RoomError::InvalidChatMessage => ErrorCode::RequestInvalid,
    }
}

fn admission_error_code(err: &AdmissionError) -> ErrorCode {
    match err {
        AdmissionError::RoomNotFound => ErrorCode::RoomNotFound,
        AdmissionError::RoomFull => ErrorCode::RoomFull,
        AdmissionError::AlreadyStarted => ErrorCode::AlreadyStarted,
        AdmissionError::AlreadyInGame => ErrorCode::AlreadyInGame,
        AdmissionError::SelfPlay => ErrorCode::SelfPlay,
    }
}

fn reconnect_error_code(err: &ReconnectError) -> ErrorCode {
    match err {
        ReconnectError::NoActiveSession => ErrorCode::NoActiveSession,
        ReconnectError::RoomNoLongerExists => ErrorCode::RoomNoLongerExists,
        ReconnectError::SignatureMismatch => ErrorCode::SignatureMismatch,
        ReconnectError::InvalidSignature => ErrorCode::InvalidSignature,
    }
}

fn handle_error_code(err: &HandleRegistryError) -> ErrorCode {
    match err {
        HandleRegistryError::AlreadyRegistered => ErrorCode::AlreadyRegistered,
        HandleRegistryError::InvalidFormat => ErrorCode::InvalidFormat,
        HandleRegistryError::Taken => ErrorCode::Taken,
        _ => ErrorCode::InternalError,
    }
}

pub struct EventGateway {
    coordinator: Arc<Coordinator>,
    hub: Arc<SubscriberHub>,
    limiter: FixedWindowLimiter,
    bindings: Mutex<HashMap<SubscriberId, WalletAddress>>,
}

impl EventGateway {
    #[must_use]
    pub fn new(coordinator: Arc<Coordinator>, hub: Arc<SubscriberHub>) -> Self {
        Self::with_limits(coordinator, hub, RateLimits::default())
    }

    #[must_use]
    pub fn with_limits(
        coordinator: Arc<Coordinator>,
        hub: Arc<SubscriberHub>,
        limits: RateLimits,
    ) -> Self {
        Self {
            coordinator,
            hub,
            limiter: FixedWindowLimiter::new(limits),
            bindings: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn hub(&self) -> Arc<SubscriberHub> {
        Arc::clone(&self.hub)
    }

    /// New transport connection: allocate a subscriber handle and its
    /// event stream.
    pub fn connect(&self) -> (SubscriberId, mpsc::Receiver<ServerEvent>) {
        self.hub.register()
    }

    /// Transport loss. The session binding survives so the wallet can
    /// reconnect with a fresh handle; the room arms its forfeit window.
    pub async fn connection_closed(&self, subscriber: &SubscriberId) {
        self.hub.unregister(subscriber);
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner).remove(subscriber);
        self.coordinator.drop_subscriber(subscriber).await;
    }

    pub fn sweep_rate_limiter(&self) {
        self.limiter.sweep();
    }

    fn bound_wallet(&self, subscriber: &SubscriberId) -> Option<WalletAddress> {
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subscriber)
            .copied()
    }

    fn bind(&self, subscriber: SubscriberId, wallet: WalletAddress) {
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subscriber, wallet);
    }

    async fn resolve_room(
        &self,
        subscriber: &SubscriberId,
    ) -> Result<(WalletAddress, RoomHandle), Ack> {
        let Some(wallet) = self.bound_wallet(subscriber) else {
            return Err(Ack::err(
                ErrorCode::NoActiveSession,
                "no wallet bound to this connection",
            ));
        };
        match self.coordinator.room_for(&wallet).await {
            Some(handle) => Ok((wallet, handle)),
            None => Err(Ack::err(ErrorCode::RoomNotFound, "no live room for this wallet")),
        }
    }

    fn room_ack(result: Result<Result<(), RoomError>, RoomClosed>) -> Ack {
        match result {
            Ok(Ok(())) => Ack::ok(Value::Null),
            Ok(Err(err)) => Ack::err(room_error_code(err), err.to_string()),
            Err(closed) => Ack::err(ErrorCode::RoomNotFound, closed.to_string()),
        }
    }

    pub async fn handle(&self, subscriber: SubscriberId, request: ClientRequest) -> Ack {
        let bucket = match &request {
            ClientRequest::MakeMove { .. } => RateBucket::Moves,
            ClientRequest::ChatMessage { .. } => RateBucket::Chat,
            ClientRequest::SetUsername { .. } => RateBucket::SetUsername,
            _ => RateBucket::General,
        };
        if let Err(err) = self
            .limiter
            .check_and_record(&subscriber.0.to_string(), bucket)
        {
            return Ack::err(ErrorCode::TooManyRequests, err.to_string());
        }

        match request {
            ClientRequest::CreateRoom {
                game_id,
                stake,
                wallet_address,
                time_limit,
            } => {
                let Ok(wallet) = wallet_address.parse::<WalletAddress>() else {
                    return Ack::err(ErrorCode::RequestInvalid, "invalid wallet address");
                };
                if time_limit.is_some_and(|minutes| minutes == 0 || minutes > 180) {
                    return Ack::err(ErrorCode::RequestInvalid, "time limit out of range");
                }
                match self
                    .coordinator
                    .create_room(
                        wallet,
                        subscriber,
                        game_id,
                        stake,
                        time_limit.map(|minutes| minutes * 60),
                    )
                    .await
                {
                    Ok(created) => {
                        self.bind(subscriber, wallet);
                        Ack::ok(json!({
                            "roomId": created.room_id,
                            "color": created.color,
                            "gameId": game_id,
                        }))
                    }
                    Err(err) => Ack::err(admission_error_code(&err), err.to_string()),
                }
            }
            ClientRequest::JoinRoom {
                room_id,
                game_id: _,
                wallet_address,
            } => {
                let Ok(wallet) = wallet_address.parse::<WalletAddress>() else {
                    return Ack::err(ErrorCode::RequestInvalid, "invalid wallet address");
                };
                let Ok(room_id) = room_id.parse::<RoomId>() else {
                    return Ack::err(ErrorCode::RoomNotFound, "unknown room id");
                };
                match self.coordinator.join_room(wallet, subscriber, room_id).await {
                    Ok(joined) => {
                        self.bind(subscriber, wallet);
                        Ack::ok(json!({
                            "roomId": joined.room_id,
                            "color": joined.color,
                        }))
                    }
                    Err(err) => Ack::err(admission_error_code(&err), err.to_string()),
                }
            }
            ClientRequest::MakeMove { mv } => match self.resolve_room(&subscriber).await {
                Ok((wallet, handle)) => Self::room_ack(handle.apply_move(wallet, mv).await),
                Err(ack) => ack,
            },
            ClientRequest::OfferDraw => match self.resolve_room(&subscriber).await {
                Ok((wallet, handle)) => Self::room_ack(handle.offer_draw(wallet).await),
                Err(ack) => ack,
            },
            ClientRequest::AcceptDraw => match self.resolve_room(&subscriber).await {
                Ok((wallet, handle)) => Self::room_ack(handle.accept_draw(wallet).await),
                Err(ack) => ack,
            },
            ClientRequest::DeclineDraw => match self.resolve_room(&subscriber).await {
                Ok((wallet, handle)) => Self::room_ack(handle.decline_draw(wallet).await),
                Err(ack) => ack,
            },
            ClientRequest::Resign => match self.resolve_room(&subscriber).await {
                Ok((wallet, handle)) => Self::room_ack(handle.resign(wallet).await),
                Err(ack) => ack,
            },
            ClientRequest::ChatMessage { message } => match self.resolve_room(&subscriber).await {
                Ok((wallet, handle)) => Self::room_ack(handle.chat(wallet, message).await),
                Err(ack) => ack,
            },
            ClientRequest::Reconnect {
                wallet_address,
                signature,
            } => {
                let Ok(wallet) = wallet_address.parse::<WalletAddress>() else {
                    return Ack::err(ErrorCode::RequestInvalid, "invalid wallet address");
                };
                match self
                    .coordinator
                    .reconnect(wallet, &signature, subscriber)
                    .await
                {
                    Ok(snapshot) => {
                        self.bind(subscriber, wallet);
                        match serde_json::to_value(&snapshot) {
                            Ok(value) => Ack::ok(value),
                            Err(err) => Ack::err(ErrorCode::InternalError, err.to_string()),
                        }
                    }
                    Err(err) => Ack::err(reconnect_error_code(&err), err.to_string()),
                }
            }
            ClientRequest::ListRooms => {
                let rooms = self.coordinator.list_open_rooms().await;
                match serde_json::to_value(&rooms) {
                    Ok(value) => Ack::ok(value),
                    Err(err) => Ack::err(ErrorCode::InternalError, err.to_string()),
                }
            }
            ClientRequest::FindRoomByGameId { game_id } => {
                match self.coordinator.find_room_by_game_id(game_id).await {
                    Some(summary) => match serde_json::to_value(&summary) {
                        Ok(value) => Ack::ok(value),
                        Err(err) => Ack::err(ErrorCode::InternalError, err.to_string()),
                    },
                    None => Ack::err(
                        ErrorCode::RoomNotFound,
                        format!("no open room for game {game_id}"),
                    ),
                }
            }
            ClientRequest::GetRoomInfo { room_id } => {
                let Ok(room_id) = room_id.parse::<RoomId>() else {
                    return Ack::err(ErrorCode::RoomNotFound, "unknown room id");
                };
                match self.coordinator.room_info(room_id).await {
                    Some(info) => match serde_json::to_value(&info) {
                        Ok(value) => Ack::ok(value),
                        Err(err) => Ack::err(ErrorCode::InternalError, err.to_string()),
                    },
                    None => Ack::err(ErrorCode::RoomNotFound, "room not found"),
                }
            }
            ClientRequest::CheckUsername { wallet_address } => {
                let Ok(wallet) = wallet_address.parse::<WalletAddress>() else {
                    return Ack::err(ErrorCode::RequestInvalid, "invalid wallet address");
                };
                let username = self.coordinator.username_for(&wallet).await;
                Ack::ok(json!({ "username": username }))
            }
            ClientRequest::SetUsername {
                wallet_address,
                username,
            } => {
                let Ok(wallet) = wallet_address.parse::<WalletAddress>() else {
                    return Ack::err(ErrorCode::RequestInvalid, "invalid wallet address");
                };
                match self.coordinator.set_username(&wallet, &username).await {
                    Ok(()) => Ack::ok(json!({ "username": username })),
                    Err(err) => Ack::err(handle_error_code(&err), err.to_string()),
                }
            }
            ClientRequest::Ping => {
                debug!(subscriber = %subscriber.0, "heartbeat");
                Ack::ok(json!({ "pong": true }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chess_domain::EventSink;
    use coordinator::{CoordinatorSettings, RECONNECT_MESSAGE};
    use escrow_verifier::{
        EscrowClient, EscrowRpcError, GameInfo, LinearBackoff, StakeVerifier,
    };
    use handle_registry::HandleRegistry;
    use k256::ecdsa::SigningKey;
    use std::time::Duration as StdDuration;
    use verdict_signer::{VerdictSigner, address_from_verifying_key, sign_personal_message};

    struct OpenEscrow {
        player1: WalletAddress,
        player2: WalletAddress,
    }

    #[async_trait]
    impl EscrowClient for OpenEscrow {
        async fn get_game_info(&self, _game_id: u64) -> Result<GameInfo, EscrowRpcError> {
            Ok(GameInfo {
                player1: self.player1,
                player2: self.player2,
                stake_per_player: 1000,
                total_staked: 2000,
                created_at: 0,
                status: 1,
                winner: WalletAddress::ZERO,
            })
        }

        async fn trusted_signer(&self) -> Result<WalletAddress, EscrowRpcError> {
            Ok(WalletAddress::ZERO)
        }
    }

    const WHITE_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn white_key() -> SigningKey {
        SigningKey::from_slice(&hex::decode(WHITE_KEY).expect("hex")).expect("key")
    }

    fn wallet(fill: u8) -> WalletAddress {
        WalletAddress::from_bytes([fill; 20])
    }

    fn gateway_with_players(player1: WalletAddress, player2: WalletAddress) -> EventGateway {
        let verifier = Arc::new(StakeVerifier::new(
            Arc::new(OpenEscrow { player1, player2 }),
            LinearBackoff {
                max_attempts: 2,
                base_delay: StdDuration::from_millis(1),
            },
        ));
        let signer = Arc::new(
            VerdictSigner::from_hex_key(WHITE_KEY, 71, wallet(0xee)).expect("signer"),
        );
        let registry = HandleRegistry::load(std::env::temp_dir().join(format!(
            "gateway-test-{}.json",
            SubscriberId::new().0
        )))
        .expect("registry");
        let hub = Arc::new(SubscriberHub::new());
        let (coordinator, retired_rx) = Coordinator::new(
            Arc::clone(&hub) as Arc<dyn EventSink>,
            Some(signer),
            verifier,
            registry,
            CoordinatorSettings::default(),
        );
        tokio::spawn(Arc::clone(&coordinator).run_reaper(retired_rx));
        EventGateway::new(coordinator, hub)
    }

    async fn expect_ok(gateway: &EventGateway, subscriber: SubscriberId, request: ClientRequest) -> Value {
        let ack = gateway.handle(subscriber, request).await;
        assert!(ack.ok, "expected ok ack, got {:?}", ack.error);
        ack.data.expect("data")
    }

    async fn expect_err(
        gateway: &EventGateway,
        subscriber: SubscriberId,
        request: ClientRequest,
        code: ErrorCode,
    ) {
        let ack = gateway.handle(subscriber, request).await;
        assert!(!ack.ok, "expected error ack");
        assert_eq!(ack.error.expect("error").code, code);
    }

    fn create_request(wallet: &WalletAddress, game_id: u64) -> ClientRequest {
        ClientRequest::CreateRoom {
            game_id,
            stake: 1000,
            wallet_address: wallet.to_lower_hex(),
            time_limit: Some(5),
        }
    }

    async fn drain_until<F>(rx: &mut mpsc::Receiver<ServerEvent>, predicate: F) -> ServerEvent
    where
        F: Fn(&ServerEvent) -> bool,
    {
        for _ in 0..64 {
            let event = tokio::time::timeout(StdDuration::from_secs(2), rx.recv())
                .await
                .expect("event timeout")
                .expect("stream open");
            if predicate(&event) {
                return event;
            }
        }
        panic!("predicate never matched");
    }

    #[tokio::test]
    async fn create_join_and_play_through_gateway() {
        let white = wallet(1);
        let black = wallet(2);
        let gateway = gateway_with_players(white, black);
        let (white_sub, mut white_rx) = gateway.connect();
        let (black_sub, mut black_rx) = gateway.connect();

        let created = expect_ok(&gateway, white_sub, create_request(&white, 1)).await;
        assert_eq!(created["color"], "white");
        let room_id = created["roomId"].as_str().expect("room id").to_string();

        let joined = expect_ok(
            &gateway,
            black_sub,
            ClientRequest::JoinRoom {
                room_id,
                game_id: Some(1),
                wallet_address: black.to_lower_hex(),
            },
        )
        .await;
        assert_eq!(joined["color"], "black");

        drain_until(&mut white_rx, |event| {
            matches!(event, ServerEvent::StartGame { player_number: 1, .. })
        })
        .await;
        drain_until(&mut black_rx, |event| {
            matches!(event, ServerEvent::StartGame { player_number: 2, .. })
        })
        .await;

        // Black cannot move first.
        expect_err(
            &gateway,
            black_sub,
            ClientRequest::MakeMove { mv: "e5".to_string() },
            ErrorCode::NotYourTurn,
        )
        .await;

        for (subscriber, mv) in [
            (white_sub, "f3"),
            (black_sub, "e5"),
            (white_sub, "g4"),
            (black_sub, "Qh4#"),
        ] {
            expect_ok(
                &gateway,
                subscriber,
                ClientRequest::MakeMove { mv: mv.to_string() },
            )
            .await;
        }

        let ended = drain_until(&mut white_rx, |event| {
            matches!(event, ServerEvent::GameEnded { .. })
        })
        .await;
        let ServerEvent::GameEnded { winner, reason, scores, .. } = ended else {
            unreachable!();
        };
        assert_eq!(winner, chess_domain::Winner::Black);
        assert_eq!(reason, "checkmate");
        assert_eq!(scores.black, 1000);
    }

    #[tokio::test]
    async fn unbound_subscriber_cannot_act() {
        let gateway = gateway_with_players(wallet(1), wallet(2));
        let (subscriber, _rx) = gateway.connect();
        expect_err(
            &gateway,
            subscriber,
            ClientRequest::MakeMove { mv: "e4".to_string() },
            ErrorCode::NoActiveSession,
        )
        .await;
        expect_err(
            &gateway,
            subscriber,
            ClientRequest::Resign,
            ErrorCode::NoActiveSession,
        )
        .await;
    }

    #[tokio::test]
    async fn rate_limit_kicks_in_per_bucket() {
        let white = wallet(1);
        let gateway = {
            let mut limits = RateLimits::default();
            limits.general = WindowLimit {
                max_requests: 2,
                window: StdDuration::from_secs(60),
            };
            let base = gateway_with_players(white, wallet(2));
            EventGateway::with_limits(base.coordinator, base.hub, limits)
        };
        let (subscriber, _rx) = gateway.connect();
        expect_ok(&gateway, subscriber, ClientRequest::Ping).await;
        expect_ok(&gateway, subscriber, ClientRequest::Ping).await;
        expect_err(
            &gateway,
            subscriber,
            ClientRequest::Ping,
            ErrorCode::TooManyRequests,
        )
        .await;
    }

    #[tokio::test]
    async fn username_flow_and_validation() {
        let gateway = gateway_with_players(wallet(1), wallet(2));
        let (subscriber, _rx) = gateway.connect();
        let player = wallet(7);

        let checked = expect_ok(
            &gateway,
            subscriber,
            ClientRequest::CheckUsername {
                wallet_address: player.to_lower_hex(),
            },
        )
        .await;
        assert_eq!(checked["username"], Value::Null);

        expect_ok(
            &gateway,
            subscriber,
            ClientRequest::SetUsername {
                wallet_address: player.to_lower_hex(),
                username: "gambit_girl".to_string(),
            },
        )
        .await;
        expect_err(
            &gateway,
            subscriber,
            ClientRequest::SetUsername {
                wallet_address: player.to_lower_hex(),
                username: "again".to_string(),
            },
            ErrorCode::AlreadyRegistered,
        )
        .await;
        expect_err(
            &gateway,
            subscriber,
            ClientRequest::SetUsername {
                wallet_address: wallet(8).to_lower_hex(),
                username: "x".to_string(),
            },
            ErrorCode::InvalidFormat,
        )
        .await;

        let checked = expect_ok(
            &gateway,
            subscriber,
            ClientRequest::CheckUsername {
                wallet_address: player.to_lower_hex(),
            },
        )
        .await;
        assert_eq!(checked["username"], "gambit_girl");
    }

    #[tokio::test]
    async fn reconnect_rebinds_subscriber_after_drop() {
        let key = white_key();
        let white = address_from_verifying_key(key.verifying_key());
        let black = wallet(2);
        let gateway = gateway_with_players(white, black);
        let (white_sub, _white_rx) = gateway.connect();
        let (black_sub, mut black_rx) = gateway.connect();

        let created = expect_ok(&gateway, white_sub, create_request(&white, 3)).await;
        let room_id = created["roomId"].as_str().expect("room id").to_string();
        expect_ok(
            &gateway,
            black_sub,
            ClientRequest::JoinRoom {
                room_id,
                game_id: Some(3),
                wallet_address: black.to_lower_hex(),
            },
        )
        .await;

        gateway.connection_closed(&white_sub).await;
        drain_until(&mut black_rx, |event| {
            matches!(event, ServerEvent::OpponentDisconnected { .. })
        })
        .await;

        // Forged signature cannot hijack the session.
        let intruder = SigningKey::from_slice(&[3u8; 32]).expect("key");
        let forged = sign_personal_message(&intruder, RECONNECT_MESSAGE.as_bytes())
            .expect("sign")
            .to_hex();
        let (hijack_sub, _hijack_rx) = gateway.connect();
        expect_err(
            &gateway,
            hijack_sub,
            ClientRequest::Reconnect {
                wallet_address: white.to_lower_hex(),
                signature: forged,
            },
            ErrorCode::SignatureMismatch,
        )
        .await;

        let (new_sub, _new_rx) = gateway.connect();
        let signature = sign_personal_message(&key, RECONNECT_MESSAGE.as_bytes())
            .expect("sign")
            .to_hex();
        let snapshot = expect_ok(
            &gateway,
            new_sub,
            ClientRequest::Reconnect {
                wallet_address: white.to_lower_hex(),
                signature,
            },
        )
        .await;
        assert_eq!(snapshot["started"], true);
        assert_eq!(snapshot["color"], "white");
        drain_until(&mut black_rx, |event| {
            matches!(event, ServerEvent::OpponentReconnected { .. })
        })
        .await;

        // The fresh binding can act immediately.
        expect_ok(
            &gateway,
            new_sub,
            ClientRequest::MakeMove { mv: "e4".to_string() },
        )
        .await;
    }

    #[tokio::test]
    async fn discovery_requests_answer() {
        let white = wallet(1);
        let gateway = gateway_with_players(white, wallet(2));
        let (subscriber, _rx) = gateway.connect();
        expect_ok(&gateway, subscriber, create_request(&white, 9)).await;

        let rooms = expect_ok(&gateway, subscriber, ClientRequest::ListRooms).await;
        assert_eq!(rooms.as_array().expect("array").len(), 1);

        let found = expect_ok(
            &gateway,
            subscriber,
            ClientRequest::FindRoomByGameId { game_id: 9 },
        )
        .await;
        assert_eq!(found["gameId"], 9);
        let room_id = found["roomId"].as_str().expect("room id").to_string();

        let info = expect_ok(
            &gateway,
            subscriber,
            ClientRequest::GetRoomInfo { room_id },
        )
        .await;
        assert_eq!(info["started"], false);
        assert_eq!(info["onchainGameId"], 9);

        expect_err(
            &gateway,
            subscriber,
            ClientRequest::FindRoomByGameId { game_id: 404 },
            ErrorCode::RoomNotFound,
        )
        .await;
        expect_err(
            &gateway,
            subscriber,
            ClientRequest::GetRoomInfo {
                room_id: "not-a-room".to_string(),
            },
            ErrorCode::RoomNotFound,
        )
        .await;
    }
}
