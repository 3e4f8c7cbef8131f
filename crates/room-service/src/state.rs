use std::collections::VecDeque;
use std::sync::Arc;

use chess_domain::{
    ChatEntry, ClockTimers, Color, EndReason, Outbound, RoomError, RoomId, RoomMeta, ScorePair,
    ServerEvent, SubscriberId, WalletAddress, Winner,
};
use chess_rules::{BoardState, MoveRejection};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use verdict_signer::VerdictSigner;

const CHAT_RING_CAPACITY: usize = 100;
const MAX_CHAT_CHARS: usize = 200;

// Masked in chat before fan-out; replacement preserves length.
const PROFANITY: &[&str] = &["fuck", "shit", "bitch", "asshole", "cunt", "dick"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomSettings {
    pub time_budget_seconds: u64,
    pub draw_offer_ttl_seconds: u64,
    pub reconnect_window_seconds: u64,
    pub retire_after_seconds: u64,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            time_budget_seconds: 300,
            draw_offer_ttl_seconds: 30,
            reconnect_window_seconds: 60,
            retire_after_seconds: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlayerSeat {
    pub wallet: WalletAddress,
    pub color: Color,
    pub subscriber: SubscriberId,
    pub connected: bool,
    pub reconnect_deadline: Option<DateTime<Utc>>,
    pub stake_verified: bool,
}

impl PlayerSeat {
    #[must_use]
    pub fn player_number(&self) -> u8 {
        match self.color {
            Color::White => 1,
            Color::Black => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ClockState {
    white_remaining: u64,
    black_remaining: u64,
    running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DrawOffer {
    offerer: WalletAddress,
    expires_at: DateTime<Utc>,
}

/// Terminal result, cached on the room so every retrieval after the first
/// is bit-identical. Signatures are attached once escrow verification has
/// succeeded, and never recomputed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub winner: Winner,
    pub reason: String,
    pub scores: ScorePair,
    pub winner_address: Option<String>,
    pub pgn: String,
    pub signature_white: Option<String>,
    pub signature_black: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatInfo {
    pub wallet: String,
    pub color: Color,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub room_id: RoomId,
    pub onchain_game_id: u64,
    pub stake: u128,
    pub time_budget_seconds: u64,
    pub players: Vec<SeatInfo>,
    pub started: bool,
    pub ended: bool,
    pub cancelled: bool,
    pub verified: bool,
}

/// Everything a reconnecting client needs to repaint its board.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub game_id: u64,
    pub color: Color,
    pub fen: String,
    pub pgn: String,
    pub timers: ClockTimers,
    pub chat_history: Vec<ChatEntry>,
    pub started: bool,
    pub ended: bool,
    pub verdict: Option<Verdict>,
}

pub struct RoomState {
    room_id: RoomId,
    onchain_game_id: u64,
    stake: u128,
    settings: RoomSettings,
    board: BoardState,
    players: Vec<PlayerSeat>,
    clock: ClockState,
    chat: VecDeque<ChatEntry>,
    draw_offer: Option<DrawOffer>,
    started: bool,
    ended: bool,
    cancelled: bool,
    verified: bool,
    verdict: Option<Verdict>,
    retire_at: Option<DateTime<Utc>>,
    retired: bool,
    signer: Option<Arc<VerdictSigner>>,
}

impl RoomState {
    pub fn new(
        room_id: RoomId,
        onchain_game_id: u64,
        stake: u128,
        settings: RoomSettings,
        creator: WalletAddress,
        creator_subscriber: SubscriberId,
        signer: Option<Arc<VerdictSigner>>,
    ) -> Self {
        let clock = ClockState {
            white_remaining: settings.time_budget_seconds,
            black_remaining: settings.time_budget_seconds,
            running: false,
        };
        Self {
            room_id,
            onchain_game_id,
            stake,
            settings,
            board: BoardState::new(),
            players: vec![PlayerSeat {
                wallet: creator,
                color: Color::White,
                subscriber: creator_subscriber,
                connected: true,
                reconnect_deadline: None,
                stake_verified: false,
            }],
            clock,
            chat: VecDeque::new(),
            draw_offer: None,
            started: false,
            ended: false,
            cancelled: false,
            verified: false,
            verdict: None,
            retire_at: None,
            retired: false,
            signer,
        }
    }

    #[must_use]
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    #[must_use]
    pub fn onchain_game_id(&self) -> u64 {
        self.onchain_game_id
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.retired
    }

    #[must_use]
    pub fn wallets(&self) -> Vec<WalletAddress> {
        self.players.iter().map(|seat| seat.wallet).collect()
    }

    fn seat(&self, wallet: &WalletAddress) -> Option<&PlayerSeat> {
        self.players.iter().find(|seat| seat.wallet == *wallet)
    }

    fn seat_mut(&mut self, wallet: &WalletAddress) -> Option<&mut PlayerSeat> {
        self.players.iter_mut().find(|seat| seat.wallet == *wallet)
    }

    fn seat_by_color(&self, color: Color) -> Option<&PlayerSeat> {
        self.players.iter().find(|seat| seat.color == color)
    }

    fn opponent_of(&self, wallet: &WalletAddress) -> Option<&PlayerSeat> {
        self.players.iter().find(|seat| seat.wallet != *wallet)
    }

    fn timers(&self) -> ClockTimers {
        ClockTimers {
            white: self.clock.white_remaining,
            black: self.clock.black_remaining,
        }
    }

    fn meta(&self) -> RoomMeta {
        RoomMeta {
            room_id: self.room_id,
            stake: self.stake,
            time_budget_seconds: self.settings.time_budget_seconds,
        }
    }

    fn broadcast(&self, events: &mut Vec<Outbound>, event: ServerEvent) {
        for seat in &self.players {
            events.push(Outbound::new(seat.subscriber, event.clone()));
        }
    }

    /// Second player takes black and the match goes live. The clock stays
    /// parked until the first move lands.
    pub fn join(
        &mut self,
        wallet: WalletAddress,
        subscriber: SubscriberId,
        _now: DateTime<Utc>,
    ) -> (Result<(), RoomError>, Vec<Outbound>) {
        let mut events = Vec::new();
        if self.ended {
            return (Err(RoomError::GameOver), events);
        }
        if self.players.len() >= 2 {
            return (Err(RoomError::RoomFull), events);
        }
        if self.seat(&wallet).is_some() {
            return (Err(RoomError::SelfPlay), events);
        }
        self.players.push(PlayerSeat {
            wallet,
            color: Color::Black,
            subscriber,
            connected: true,
            reconnect_deadline: None,
            stake_verified: false,
        });
        self.started = true;
        let chat_history: Vec<ChatEntry> = self.chat.iter().cloned().collect();
        for seat in &self.players {
            let opponent = self
                .opponent_of(&seat.wallet)
                .map(|other| other.wallet.to_checksum());
            events.push(Outbound::new(
                seat.subscriber,
                ServerEvent::StartGame {
                    player_number: seat.player_number(),
                    color: seat.color,
                    opponent,
                    timers: self.timers(),
                    game_id: self.onchain_game_id,
                    meta: self.meta(),
                    chat_history: chat_history.clone(),
                },
            ));
        }
        info!(room_id = %self.room_id.0, game_id = self.onchain_game_id, "second player joined, game started");
        (Ok(()), events)
    }

    pub fn apply_move(
        &mut self,
        wallet: &WalletAddress,
        input: &str,
        now: DateTime<Utc>,
    ) -> (Result<(), RoomError>, Vec<Outbound>) {
        let mut events = Vec::new();
        if self.ended {
            return (Err(RoomError::GameOver), events);
        }
        let Some(seat) = self.seat(wallet) else {
            return (Err(RoomError::NotParticipant), events);
        };
        let color = seat.color;
        let player_num = seat.player_number();
        let subscriber = seat.subscriber;
        if !self.started {
            return (Err(RoomError::NotStarted), events);
        }
        if self.board.side_to_move() != color {
            return (Err(RoomError::NotYourTurn), events);
        }
        let accepted = match self.board.try_apply(input) {
            Ok(accepted) => accepted,
            Err(MoveRejection::InvalidFormat) => {
                events.push(Outbound::new(
                    subscriber,
                    ServerEvent::MoveRejected {
                        reason: "invalid move format".to_string(),
                    },
                ));
                return (Err(RoomError::InvalidMoveFormat), events);
            }
            Err(MoveRejection::Illegal) => {
                events.push(Outbound::new(
                    subscriber,
                    ServerEvent::MoveRejected {
                        reason: "illegal move".to_string(),
                    },
                ));
                return (Err(RoomError::IllegalMove), events);
            }
        };
        if self.board.move_count() == 1 {
            self.clock.running = true;
        }
        self.broadcast(
            &mut events,
            ServerEvent::MoveAccepted {
                mv: accepted.san,
                fen: self.board.fen(),
                pgn: self.board.pgn(),
                turn: self.board.side_to_move(),
                player_num,
            },
        );
        if let Some((winner, reason)) = self.board.terminal_outcome() {
            self.end(winner, reason, now, &mut events);
        }
        (Ok(()), events)
    }

    /// Records an offer with a 30 s fuse. A second offer while one is
    /// pending is silently ignored, so offers cannot be used to probe.
    pub fn offer_draw(
        &mut self,
        wallet: &WalletAddress,
        now: DateTime<Utc>,
    ) -> (Result<(), RoomError>, Vec<Outbound>) {
        let mut events = Vec::new();
        if self.ended {
            return (Err(RoomError::GameOver), events);
        }
        let Some(seat) = self.seat(wallet) else {
            return (Err(RoomError::NotParticipant), events);
        };
        let offerer = seat.wallet;
        if !self.started {
            return (Err(RoomError::NotStarted), events);
        }
        if self.draw_offer.is_some() {
            return (Ok(()), events);
        }
        self.draw_offer = Some(DrawOffer {
            offerer,
            expires_at: now + Duration::seconds(self.settings.draw_offer_ttl_seconds as i64),
        });
        if let Some(opponent) = self.opponent_of(wallet) {
            events.push(Outbound::new(opponent.subscriber, ServerEvent::DrawOffered));
        }
        (Ok(()), events)
    }

    pub fn accept_draw(
        &mut self,
        wallet: &WalletAddress,
        now: DateTime<Utc>,
    ) -> (Result<(), RoomError>, Vec<Outbound>) {
        let mut events = Vec::new();
        if self.ended {
            return (Err(RoomError::GameOver), events);
        }
        if self.seat(wallet).is_none() {
            return (Err(RoomError::NotParticipant), events);
        }
        match self.draw_offer {
            Some(offer) if offer.offerer != *wallet => {
                self.end(Winner::Draw, EndReason::MutualAgreement, now, &mut events);
                (Ok(()), events)
            }
            // Accepting your own offer, or accepting with none pending,
            // is a silent no-op.
            _ => (Ok(()), events),
        }
    }

    pub fn decline_draw(
        &mut self,
        wallet: &WalletAddress,
        _now: DateTime<Utc>,
    ) -> (Result<(), RoomError>, Vec<Outbound>) {
        let mut events = Vec::new();
        if self.ended {
            return (Err(RoomError::GameOver), events);
        }
        if self.seat(wallet).is_none() {
            return (Err(RoomError::NotParticipant), events);
        }
        match self.draw_offer {
            Some(offer) if offer.offerer != *wallet => {
                self.draw_offer = None;
                if let Some(seat) = self.seat(&offer.offerer) {
                    events.push(Outbound::new(seat.subscriber, ServerEvent::DrawDeclined));
                }
                (Ok(()), events)
            }
            _ => (Ok(()), events),
        }
    }

    pub fn resign(
        &mut self,
        wallet: &WalletAddress,
        now: DateTime<Utc>,
    ) -> (Result<(), RoomError>, Vec<Outbound>) {
        let mut events = Vec::new();
        if self.ended {
            return (Err(RoomError::GameOver), events);
        }
        let Some(seat) = self.seat(wallet) else {
            return (Err(RoomError::NotParticipant), events);
        };
        let color = seat.color;
        if !self.started {
            return (Err(RoomError::NotStarted), events);
        }
        self.end(
            Winner::from(color.opposite()),
            EndReason::Resignation,
            now,
            &mut events,
        );
        (Ok(()), events)
    }

    pub fn chat(
        &mut self,
        wallet: &WalletAddress,
        text: &str,
        now: DateTime<Utc>,
    ) -> (Result<(), RoomError>, Vec<Outbound>) {
        let mut events = Vec::new();
        if self.ended {
            return (Err(RoomError::GameOver), events);
        }
        let Some(seat) = self.seat(wallet) else {
            return (Err(RoomError::NotParticipant), events);
        };
        let sender = seat.wallet;
        let Some(message) = sanitize_chat(text) else {
            return (Err(RoomError::InvalidChatMessage), events);
        };
        let entry = ChatEntry {
            sender: sender.to_checksum(),
            sender_short: sender.short(),
            message,
            timestamp: now,
        };
        if self.chat.len() == CHAT_RING_CAPACITY {
            self.chat.pop_front();
        }
        self.chat.push_back(entry.clone());
        self.broadcast(
            &mut events,
            ServerEvent::ChatMessage {
                sender: entry.sender,
                sender_short: entry.sender_short,
                message: entry.message,
                timestamp: entry.timestamp,
            },
        );
        (Ok(()), events)
    }

    /// Transport loss. Before the game starts the room is simply torn
    /// down; mid-game the opponent is told and a reconnect window armed.
    pub fn disconnect(&mut self, wallet: &WalletAddress, now: DateTime<Utc>) -> Vec<Outbound> {
        let mut events = Vec::new();
        if self.ended || self.seat(wallet).is_none() {
            return events;
        }
        if !self.started {
            self.cancel("creator disconnected before an opponent joined", now, &mut events);
            return events;
        }
        let window = self.settings.reconnect_window_seconds;
        if let Some(seat) = self.seat_mut(wallet) {
            seat.connected = false;
            seat.reconnect_deadline = Some(now + Duration::seconds(window as i64));
        }
        if let Some(opponent) = self.opponent_of(wallet) {
            events.push(Outbound::new(
                opponent.subscriber,
                ServerEvent::OpponentDisconnected {
                    message: format!(
                        "Opponent disconnected. They have {window} seconds to reconnect."
                    ),
                },
            ));
        }
        info!(room_id = %self.room_id.0, wallet = %wallet, "player disconnected, reconnect window armed");
        events
    }

    /// Rebinds the player's transport identity and hands back a full
    /// snapshot. Works inside the post-game grace window too, so a client
    /// that dropped during the final move can still fetch its signatures.
    pub fn reconnect(
        &mut self,
        wallet: &WalletAddress,
        subscriber: SubscriberId,
        _now: DateTime<Utc>,
    ) -> (Result<RoomSnapshot, RoomError>, Vec<Outbound>) {
        let mut events = Vec::new();
        if self.seat(wallet).is_none() {
            return (Err(RoomError::NotParticipant), events);
        }
        if let Some(seat) = self.seat_mut(wallet) {
            seat.subscriber = subscriber;
            seat.connected = true;
            seat.reconnect_deadline = None;
        }
        if !self.ended
            && let Some(opponent) = self.opponent_of(wallet)
        {
            events.push(Outbound::new(
                opponent.subscriber,
                ServerEvent::OpponentReconnected {
                    message: "Opponent reconnected.".to_string(),
                },
            ));
        }
        info!(room_id = %self.room_id.0, wallet = %wallet, "player reconnected");
        (Ok(self.snapshot_for(wallet)), events)
    }

    /// Escrow verification resolved positively for one wallet. Once both
    /// stakes check out the room is verified; a verdict that was held
    /// unsigned is signed and re-broadcast now.
    pub fn stake_verified(&mut self, wallet: &WalletAddress, now: DateTime<Utc>) -> Vec<Outbound> {
        let mut events = Vec::new();
        if let Some(seat) = self.seat_mut(wallet) {
            seat.stake_verified = true;
        }
        let all_verified = self.players.len() == 2
            && self.players.iter().all(|seat| seat.stake_verified);
        if all_verified && !self.verified {
            self.verified = true;
            info!(room_id = %self.room_id.0, game_id = self.onchain_game_id, "both stakes verified on-chain");
            if self.ended && !self.cancelled {
                let unsigned = self
                    .verdict
                    .as_ref()
                    .is_some_and(|verdict| {
                        verdict.signature_white.is_none() && verdict.signature_black.is_none()
                    });
                if unsigned {
                    self.sign_verdict();
                    if let Some(event) = self.game_ended_event() {
                        self.broadcast(&mut events, event);
                    }
                    // Give late clients a fresh window to pick the
                    // signatures up.
                    self.retire_at =
                        Some(now + Duration::seconds(self.settings.retire_after_seconds as i64));
                }
            }
        }
        events
    }

    /// Verifier denial or operator teardown. Cancellation never signs
    /// anything and the room is garbage-collected immediately.
    pub fn cancel(&mut self, reason: &str, _now: DateTime<Utc>, events: &mut Vec<Outbound>) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.cancelled = true;
        self.clock.running = false;
        self.draw_offer = None;
        self.broadcast(
            events,
            ServerEvent::GameCancelled {
                reason: reason.to_string(),
            },
        );
        self.retired = true;
        warn!(room_id = %self.room_id.0, game_id = self.onchain_game_id, reason, "room cancelled");
    }

    /// 1 Hz heartbeat: draw-offer expiry, reconnect forfeits, clock
    /// decrement, and post-game retirement.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Outbound> {
        let mut events = Vec::new();
        if self.ended {
            if let Some(at) = self.retire_at
                && now >= at
            {
                self.retired = true;
            }
            return events;
        }

        if let Some(offer) = self.draw_offer
            && now >= offer.expires_at
        {
            self.draw_offer = None;
            if let Some(seat) = self.seat(&offer.offerer) {
                events.push(Outbound::new(seat.subscriber, ServerEvent::DrawDeclined));
            }
        }

        let forfeited = self
            .players
            .iter()
            .find(|seat| seat.reconnect_deadline.is_some_and(|deadline| now > deadline))
            .map(|seat| seat.color);
        if let Some(color) = forfeited {
            self.end(
                Winner::from(color.opposite()),
                EndReason::Disconnect,
                now,
                &mut events,
            );
            return events;
        }

        if self.clock.running {
            let side = self.board.side_to_move();
            match side {
                Color::White => {
                    self.clock.white_remaining = self.clock.white_remaining.saturating_sub(1);
                }
                Color::Black => {
                    self.clock.black_remaining = self.clock.black_remaining.saturating_sub(1);
                }
            }
            self.broadcast(
                &mut events,
                ServerEvent::TimerUpdate {
                    white: self.clock.white_remaining,
                    black: self.clock.black_remaining,
                },
            );
            let flagged = match side {
                Color::White => self.clock.white_remaining == 0,
                Color::Black => self.clock.black_remaining == 0,
            };
            if flagged {
                self.end(
                    Winner::from(side.opposite()),
                    EndReason::Timeout,
                    now,
                    &mut events,
                );
            }
        }
        events
    }

    fn end(
        &mut self,
        winner: Winner,
        reason: EndReason,
        now: DateTime<Utc>,
        events: &mut Vec<Outbound>,
    ) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.clock.running = false;
        self.draw_offer = None;
        let scores = match winner {
            Winner::White => ScorePair { white: 1000, black: 0 },
            Winner::Black => ScorePair { white: 0, black: 1000 },
            Winner::Draw => ScorePair { white: 500, black: 500 },
        };
        let winner_address = match winner {
            Winner::White => self.seat_by_color(Color::White).map(|s| s.wallet.to_checksum()),
            Winner::Black => self.seat_by_color(Color::Black).map(|s| s.wallet.to_checksum()),
            Winner::Draw => None,
        };
        self.verdict = Some(Verdict {
            winner,
            reason: reason.as_str().to_string(),
            scores,
            winner_address,
            pgn: self.board.pgn(),
            signature_white: None,
            signature_black: None,
        });
        if self.verified {
            self.sign_verdict();
        } else {
            info!(
                room_id = %self.room_id.0,
                game_id = self.onchain_game_id,
                "game ended before stake verification resolved, verdict held unsigned"
            );
        }
        if let Some(event) = self.game_ended_event() {
            self.broadcast(events, event);
        }
        self.retire_at = Some(now + Duration::seconds(self.settings.retire_after_seconds as i64));
        info!(
            room_id = %self.room_id.0,
            game_id = self.onchain_game_id,
            winner = ?winner,
            reason = reason.as_str(),
            "game ended"
        );
    }

    fn sign_verdict(&mut self) {
        let Some(signer) = self.signer.as_ref() else {
            error!(
                room_id = %self.room_id.0,
                game_id = self.onchain_game_id,
                "no signing key configured, verdict will not be claimable"
            );
            return;
        };
        let white = self.seat_by_color(Color::White).map(|s| s.wallet);
        let black = self.seat_by_color(Color::Black).map(|s| s.wallet);
        let Some(verdict) = self.verdict.as_mut() else {
            return;
        };
        let signed = match verdict.winner {
            Winner::White => white.map(|wallet| {
                signer
                    .sign_win(self.onchain_game_id, &wallet)
                    .map(|sig| verdict.signature_white = Some(sig.to_hex()))
            }),
            Winner::Black => black.map(|wallet| {
                signer
                    .sign_win(self.onchain_game_id, &wallet)
                    .map(|sig| verdict.signature_black = Some(sig.to_hex()))
            }),
            Winner::Draw => white.zip(black).map(|(white, black)| {
                signer
                    .sign_draw(self.onchain_game_id, &white, &black)
                    .map(|(white_sig, black_sig)| {
                        verdict.signature_white = Some(white_sig.to_hex());
                        verdict.signature_black = Some(black_sig.to_hex());
                    })
            }),
        };
        match signed {
            Some(Ok(())) => {}
            Some(Err(err)) => {
                error!(
                    room_id = %self.room_id.0,
                    game_id = self.onchain_game_id,
                    error = %err,
                    "verdict signing failed"
                );
            }
            None => {
                error!(
                    room_id = %self.room_id.0,
                    game_id = self.onchain_game_id,
                    "verdict signing skipped, seats incomplete"
                );
            }
        }
    }

    fn game_ended_event(&self) -> Option<ServerEvent> {
        let verdict = self.verdict.as_ref()?;
        Some(ServerEvent::GameEnded {
            winner: verdict.winner,
            reason: verdict.reason.clone(),
            pgn: verdict.pgn.clone(),
            game_id: self.onchain_game_id,
            winner_address: verdict.winner_address.clone(),
            scores: verdict.scores,
            signature_white: verdict.signature_white.clone(),
            signature_black: verdict.signature_black.clone(),
        })
    }

    #[must_use]
    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            room_id: self.room_id,
            onchain_game_id: self.onchain_game_id,
            stake: self.stake,
            time_budget_seconds: self.settings.time_budget_seconds,
            players: self
                .players
                .iter()
                .map(|seat| SeatInfo {
                    wallet: seat.wallet.to_checksum(),
                    color: seat.color,
                    connected: seat.connected,
                })
                .collect(),
            started: self.started,
            ended: self.ended,
            cancelled: self.cancelled,
            verified: self.verified,
        }
    }

    #[must_use]
    pub fn snapshot_for(&self, wallet: &WalletAddress) -> RoomSnapshot {
        let color = self
            .seat(wallet)
            .map_or(Color::White, |seat| seat.color);
        RoomSnapshot {
            room_id: self.room_id,
            game_id: self.onchain_game_id,
            color,
            fen: self.board.fen(),
            pgn: self.board.pgn(),
            timers: self.timers(),
            chat_history: self.chat.iter().cloned().collect(),
            started: self.started,
            ended: self.ended,
            verdict: self.verdict.clone(),
        }
    }
}

/// Strip HTML-significant characters and control codes, mask profanity,
/// and bound the length. `None` means the message is dropped entirely.
fn sanitize_chat(input: &str) -> Option<String> {
    let stripped: String = input
        .chars()
        .filter(|ch| !matches!(ch, '<' | '>' | '&' | '"' | '\'') && !ch.is_control())
        .collect();
    let trimmed = stripped.trim();
    let count = trimmed.chars().count();
    if count == 0 || count > MAX_CHAT_CHARS {
        return None;
    }
    Some(mask_profanity(trimmed))
}

fn mask_profanity(input: &str) -> String {
    let mut out: Vec<char> = input.chars().collect();
    let lower: Vec<char> = input
        .chars()
        .map(|ch| ch.to_ascii_lowercase())
        .collect();
    for word in PROFANITY {
        let needle: Vec<char> = word.chars().collect();
        if needle.len() > lower.len() {
            continue;
        }
        for start in 0..=(lower.len() - needle.len()) {
            if lower[start..start + needle.len()] == needle[..] {
                for slot in &mut out[start..start + needle.len()] {
                    *slot = '*';
                }
            }
        }
    }
    out.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chess_domain::ServerEvent;

    fn wallet(fill: u8) -> WalletAddress {
        WalletAddress::from_bytes([fill; 20])
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    fn after(seconds: i64) -> DateTime<Utc> {
        t0() + Duration::seconds(seconds)
    }

    fn test_signer() -> Arc<VerdictSigner> {
        Arc::new(
            VerdictSigner::from_hex_key(
                "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318",
                71,
                wallet(0xee),
            )
            .expect("signer"),
        )
    }

    struct Fixture {
        state: RoomState,
        white: WalletAddress,
        black: WalletAddress,
    }

    fn started_room(time_budget: u64) -> Fixture {
        let white = wallet(1);
        let black = wallet(2);
        let mut state = RoomState::new(
            RoomId::new(),
            1,
            1000,
            RoomSettings {
                time_budget_seconds: time_budget,
                ..RoomSettings::default()
            },
            white,
            SubscriberId::new(),
            Some(test_signer()),
        );
        let (result, _) = state.join(black, SubscriberId::new(), t0());
        result.expect("join");
        let _ = state.stake_verified(&white, t0());
        let _ = state.stake_verified(&black, t0());
        Fixture {
            state,
            white,
            black,
        }
    }

    fn events_of<'a>(events: &'a [Outbound]) -> Vec<&'a ServerEvent> {
        events.iter().map(|outbound| &outbound.event).collect()
    }

    fn find_game_ended(events: &[Outbound]) -> Option<&ServerEvent> {
        events
            .iter()
            .map(|outbound| &outbound.event)
            .find(|event| matches!(event, ServerEvent::GameEnded { .. }))
    }

    #[test]
    fn creator_is_white_and_join_emits_start_game_to_both() {
        let white = wallet(1);
        let mut state = RoomState::new(
            RoomId::new(),
            1,
            1000,
            RoomSettings::default(),
            white,
            SubscriberId::new(),
            None,
        );
        let (result, events) = state.join(wallet(2), SubscriberId::new(), t0());
        result.expect("join");
        let starts: Vec<_> = events_of(&events)
            .into_iter()
            .filter(|event| matches!(event, ServerEvent::StartGame { .. }))
            .collect();
        assert_eq!(starts.len(), 2);
        assert!(starts.iter().any(|event| matches!(
            event,
            ServerEvent::StartGame { player_number: 1, color: Color::White, .. }
        )));
        assert!(starts.iter().any(|event| matches!(
            event,
            ServerEvent::StartGame { player_number: 2, color: Color::Black, .. }
        )));
    }

    #[test]
    fn join_guards_self_play_and_room_full() {
        let white = wallet(1);
        let mut state = RoomState::new(
            RoomId::new(),
            1,
            1000,
            RoomSettings::default(),
            white,
            SubscriberId::new(),
            None,
        );
        assert_eq!(
            state.join(white, SubscriberId::new(), t0()).0,
            Err(RoomError::SelfPlay)
        );
        state.join(wallet(2), SubscriberId::new(), t0()).0.expect("join");
        assert_eq!(
            state.join(wallet(3), SubscriberId::new(), t0()).0,
            Err(RoomError::RoomFull)
        );
    }

    #[test]
    fn move_protocol_enforces_turn_and_membership() {
        let mut fixture = started_room(300);
        assert_eq!(
            fixture.state.apply_move(&wallet(9), "e4", t0()).0,
            Err(RoomError::NotParticipant)
        );
        assert_eq!(
            fixture.state.apply_move(&fixture.black, "e5", t0()).0,
            Err(RoomError::NotYourTurn)
        );
        assert_eq!(
            fixture.state.apply_move(&fixture.white, "e5", t0()).0,
            Err(RoomError::IllegalMove)
        );
        assert_eq!(
            fixture.state.apply_move(&fixture.white, "??", t0()).0,
            Err(RoomError::InvalidMoveFormat)
        );
        let (result, events) = fixture.state.apply_move(&fixture.white, "e4", t0());
        result.expect("move");
        assert!(events_of(&events)
            .iter()
            .any(|event| matches!(event, ServerEvent::MoveAccepted { turn: Color::Black, .. })));
    }

    #[test]
    fn clock_starts_on_first_move_only() {
        let mut fixture = started_room(300);
        // Joined but unmoved: ticks must not burn white's clock.
        let events = fixture.state.tick(after(1));
        assert!(events.is_empty());
        fixture.state.apply_move(&fixture.white, "e4", after(2)).0.expect("move");
        let events = fixture.state.tick(after(3));
        assert!(events_of(&events).iter().any(|event| matches!(
            event,
            ServerEvent::TimerUpdate { white: 300, black: 299 }
        )));
    }

    #[test]
    fn fools_mate_ends_with_signed_black_win() {
        let mut fixture = started_room(300);
        for (mover, mv) in [
            (fixture.white, "f3"),
            (fixture.black, "e5"),
            (fixture.white, "g4"),
        ] {
            fixture.state.apply_move(&mover, mv, t0()).0.expect("move");
        }
        let (result, events) = fixture.state.apply_move(&fixture.black, "Qh4#", after(5));
        result.expect("mate");
        let Some(ServerEvent::GameEnded {
            winner,
            reason,
            scores,
            winner_address,
            signature_black,
            signature_white,
            ..
        }) = find_game_ended(&events)
        else {
            panic!("expected gameEnded");
        };
        assert_eq!(*winner, Winner::Black);
        assert_eq!(reason, "checkmate");
        assert_eq!(*scores, ScorePair { white: 0, black: 1000 });
        assert_eq!(
            winner_address.as_deref(),
            Some(fixture.black.to_checksum().as_str())
        );
        assert!(signature_black.is_some());
        assert!(signature_white.is_none());

        // Terminal latch: nothing moves any more.
        assert_eq!(
            fixture.state.apply_move(&fixture.white, "a3", after(6)).0,
            Err(RoomError::GameOver)
        );
    }

    #[test]
    fn signatures_are_cached_bit_identical() {
        let mut fixture = started_room(300);
        for (mover, mv) in [
            (fixture.white, "f3"),
            (fixture.black, "e5"),
            (fixture.white, "g4"),
            (fixture.black, "Qh4#"),
        ] {
            fixture.state.apply_move(&mover, mv, t0()).0.expect("move");
        }
        let first = fixture
            .state
            .snapshot_for(&fixture.black)
            .verdict
            .expect("verdict")
            .signature_black
            .expect("signature");
        let second = fixture
            .state
            .snapshot_for(&fixture.white)
            .verdict
            .expect("verdict")
            .signature_black
            .expect("signature");
        assert_eq!(first, second);
    }

    #[test]
    fn timeout_flags_the_side_to_move() {
        let mut fixture = started_room(60);
        fixture.state.apply_move(&fixture.white, "e4", t0()).0.expect("move");
        // Black never answers; 59 ticks leave one second.
        for i in 1..=59 {
            let events = fixture.state.tick(after(i));
            assert!(find_game_ended(&events).is_none(), "ended early at {i}");
        }
        let events = fixture.state.tick(after(60));
        let Some(ServerEvent::GameEnded { winner, reason, .. }) = find_game_ended(&events) else {
            panic!("expected timeout end");
        };
        assert_eq!(*winner, Winner::White);
        assert_eq!(reason, "timeout");
        // The flagging tick must not decrement anything further.
        let snapshot = fixture.state.snapshot_for(&fixture.white);
        assert_eq!(snapshot.timers.black, 0);
        assert_eq!(snapshot.timers.white, 60);
        assert!(fixture.state.tick(after(61)).is_empty());
    }

    #[test]
    fn clock_at_one_second_survives_when_move_lands() {
        let mut fixture = started_room(60);
        fixture.state.apply_move(&fixture.white, "e4", t0()).0.expect("move");
        for i in 1..=59 {
            let _ = fixture.state.tick(after(i));
        }
        // Black is down to one second but answers in time.
        fixture.state.apply_move(&fixture.black, "e5", after(59)).0.expect("move");
        let events = fixture.state.tick(after(60));
        assert!(find_game_ended(&events).is_none());
        let snapshot = fixture.state.snapshot_for(&fixture.black);
        assert_eq!(snapshot.timers.black, 1);
        assert_eq!(snapshot.timers.white, 59);
    }

    #[test]
    fn draw_offer_accept_ends_with_two_signatures() {
        let mut fixture = started_room(300);
        fixture.state.apply_move(&fixture.white, "e4", t0()).0.expect("move");
        let (result, events) = fixture.state.offer_draw(&fixture.white, after(1));
        result.expect("offer");
        assert!(events_of(&events)
            .iter()
            .any(|event| matches!(event, ServerEvent::DrawOffered)));

        // Offerer cannot accept their own offer.
        let (result, events) = fixture.state.accept_draw(&fixture.white, after(2));
        result.expect("silent");
        assert!(events.is_empty());

        let (result, events) = fixture.state.accept_draw(&fixture.black, after(3));
        result.expect("accept");
        let Some(ServerEvent::GameEnded {
            winner,
            reason,
            scores,
            signature_white,
            signature_black,
            ..
        }) = find_game_ended(&events)
        else {
            panic!("expected draw end");
        };
        assert_eq!(*winner, Winner::Draw);
        assert_eq!(reason, "mutual agreement");
        assert_eq!(*scores, ScorePair { white: 500, black: 500 });
        assert!(signature_white.is_some());
        assert!(signature_black.is_some());
        assert_ne!(signature_white, signature_black);
    }

    #[test]
    fn draw_offer_expires_back_to_offerer() {
        let mut fixture = started_room(300);
        fixture.state.apply_move(&fixture.white, "e4", t0()).0.expect("move");
        fixture.state.offer_draw(&fixture.white, after(1)).0.expect("offer");

        let events = fixture.state.tick(after(20));
        assert!(!events_of(&events)
            .iter()
            .any(|event| matches!(event, ServerEvent::DrawDeclined)));

        let events = fixture.state.tick(after(31));
        assert!(events_of(&events)
            .iter()
            .any(|event| matches!(event, ServerEvent::DrawDeclined)));

        // Game continues: black can still move and accept nothing.
        let (result, events) = fixture.state.accept_draw(&fixture.black, after(32));
        result.expect("silent");
        assert!(events.is_empty());
        fixture.state.apply_move(&fixture.black, "e5", after(33)).0.expect("move");
    }

    #[test]
    fn decline_clears_offer_and_notifies_offerer() {
        let mut fixture = started_room(300);
        fixture.state.apply_move(&fixture.white, "e4", t0()).0.expect("move");
        fixture.state.offer_draw(&fixture.white, after(1)).0.expect("offer");
        let (result, events) = fixture.state.decline_draw(&fixture.black, after(2));
        result.expect("decline");
        assert!(events_of(&events)
            .iter()
            .any(|event| matches!(event, ServerEvent::DrawDeclined)));
        // Second decline is a silent no-op.
        let (result, events) = fixture.state.decline_draw(&fixture.black, after(3));
        result.expect("silent");
        assert!(events.is_empty());
    }

    #[test]
    fn resignation_awards_opponent() {
        let mut fixture = started_room(300);
        fixture.state.apply_move(&fixture.white, "e4", t0()).0.expect("move");
        let (result, events) = fixture.state.resign(&fixture.white, after(1));
        result.expect("resign");
        let Some(ServerEvent::GameEnded { winner, reason, .. }) = find_game_ended(&events) else {
            panic!("expected resignation end");
        };
        assert_eq!(*winner, Winner::Black);
        assert_eq!(reason, "resignation");
    }

    #[test]
    fn disconnect_forfeits_after_window_but_reconnect_saves() {
        let mut fixture = started_room(300);
        fixture.state.apply_move(&fixture.white, "e4", t0()).0.expect("move");

        let events = fixture.state.disconnect(&fixture.black, after(1));
        assert!(events_of(&events)
            .iter()
            .any(|event| matches!(event, ServerEvent::OpponentDisconnected { .. })));

        // Still inside the window at exactly the deadline.
        let events = fixture.state.tick(after(61));
        assert!(find_game_ended(&events).is_none());

        let (result, events) = fixture
            .state
            .reconnect(&fixture.black, SubscriberId::new(), after(61));
        let snapshot = result.expect("reconnect");
        assert!(!snapshot.ended);
        assert!(events_of(&events)
            .iter()
            .any(|event| matches!(event, ServerEvent::OpponentReconnected { .. })));

        // A second disconnect that nobody answers forfeits.
        let _ = fixture.state.disconnect(&fixture.black, after(62));
        let events = fixture.state.tick(after(123));
        let Some(ServerEvent::GameEnded { winner, reason, .. }) = find_game_ended(&events) else {
            panic!("expected disconnect forfeit");
        };
        assert_eq!(*winner, Winner::White);
        assert_eq!(reason, "disconnect");
    }

    #[test]
    fn end_before_verification_holds_signatures_until_resolution() {
        let white = wallet(1);
        let black = wallet(2);
        let mut state = RoomState::new(
            RoomId::new(),
            5,
            1000,
            RoomSettings::default(),
            white,
            SubscriberId::new(),
            Some(test_signer()),
        );
        state.join(black, SubscriberId::new(), t0()).0.expect("join");
        state.apply_move(&white, "e4", t0()).0.expect("move");
        let (result, events) = state.resign(&black, after(1));
        result.expect("resign");
        let Some(ServerEvent::GameEnded {
            signature_white, ..
        }) = find_game_ended(&events)
        else {
            panic!("expected end");
        };
        assert!(signature_white.is_none(), "unverified room must not sign");

        let _ = state.stake_verified(&white, after(2));
        let events = state.stake_verified(&black, after(3));
        let Some(ServerEvent::GameEnded {
            signature_white, ..
        }) = find_game_ended(&events)
        else {
            panic!("expected re-broadcast with signatures");
        };
        assert!(signature_white.is_some());
    }

    #[test]
    fn cancellation_tears_down_immediately_without_signatures() {
        let mut fixture = started_room(300);
        let mut events = Vec::new();
        fixture
            .state
            .cancel("stake verification failed: wallet not in game", t0(), &mut events);
        assert!(events
            .iter()
            .any(|outbound| matches!(outbound.event, ServerEvent::GameCancelled { .. })));
        assert!(fixture.state.is_retired());
        assert!(fixture.state.snapshot_for(&fixture.white).verdict.is_none());
    }

    #[test]
    fn chat_is_sanitized_masked_and_ring_bounded() {
        let mut fixture = started_room(300);
        let (result, events) = fixture
            .state
            .chat(&fixture.white, "  <b>good luck & have fun</b>  ", t0());
        result.expect("chat");
        let Some(ServerEvent::ChatMessage { message, sender_short, .. }) = events_of(&events)
            .into_iter()
            .find(|event| matches!(event, ServerEvent::ChatMessage { .. }))
        else {
            panic!("expected chat event");
        };
        assert_eq!(message, "bgood luck  have fun/b");
        assert_eq!(sender_short, &fixture.white.short());

        let (result, _) = fixture.state.chat(&fixture.black, "this is shit talk", t0());
        result.expect("chat");
        let snapshot = fixture.state.snapshot_for(&fixture.white);
        assert_eq!(
            snapshot.chat_history.last().expect("entry").message,
            "this is **** talk"
        );

        assert_eq!(
            fixture.state.chat(&fixture.white, "   ", t0()).0,
            Err(RoomError::InvalidChatMessage)
        );
        assert_eq!(
            fixture.state.chat(&fixture.white, &"x".repeat(201), t0()).0,
            Err(RoomError::InvalidChatMessage)
        );

        for i in 0..120 {
            fixture
                .state
                .chat(&fixture.white, &format!("message {i}"), t0())
                .0
                .expect("chat");
        }
        let snapshot = fixture.state.snapshot_for(&fixture.white);
        assert_eq!(snapshot.chat_history.len(), 100);
        assert_eq!(
            snapshot.chat_history.last().expect("entry").message,
            "message 119"
        );
    }

    #[test]
    fn retirement_happens_after_grace_window() {
        let mut fixture = started_room(300);
        fixture.state.apply_move(&fixture.white, "e4", t0()).0.expect("move");
        fixture.state.resign(&fixture.black, after(1)).0.expect("resign");
        assert!(!fixture.state.is_retired());
        let _ = fixture.state.tick(after(10));
        assert!(!fixture.state.is_retired());
        let _ = fixture.state.tick(after(31));
        assert!(fixture.state.is_retired());
    }

    #[test]
    fn moves_before_second_join_are_rejected() {
        let white = wallet(1);
        let mut state = RoomState::new(
            RoomId::new(),
            1,
            1000,
            RoomSettings::default(),
            white,
            SubscriberId::new(),
            None,
        );
        assert_eq!(
            state.apply_move(&white, "e4", t0()).0,
            Err(RoomError::NotStarted)
        );
    }
}
