//! Board wrapper around shakmaty: server-side legality checks, canonical
//! SAN/UCI forms, FEN/PGN serialization, and the terminal predicates the
//! room uses to decide verdicts. One board per room, no shared state.

use std::collections::HashMap;

use chess_domain::{Color, EndReason, Winner};
use shakmaty::fen::Fen;
use shakmaty::san::SanPlus;
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, EnPassantMode, Move, Position};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MoveRejection {
    #[error("move is not in a recognized coordinate or algebraic format")]
    InvalidFormat,
    #[error("move is not legal in the current position")]
    Illegal,
}

/// A move the engine accepted, canonicalized in both notations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedMove {
    pub san: String,
    pub uci: String,
}

pub struct BoardState {
    position: Chess,
    sans: Vec<String>,
    // Position occurrence counts for threefold detection, keyed by the
    // clock-free part of the FEN.
    repetitions: HashMap<String, u32>,
}

impl Default for BoardState {
    fn default() -> Self {
        Self::new()
    }
}

impl BoardState {
    #[must_use]
    pub fn new() -> Self {
        let position = Chess::default();
        let mut repetitions = HashMap::new();
        repetitions.insert(position_key(&position), 1);
        Self {
            position,
            sans: Vec::new(),
            repetitions,
        }
    }

    #[must_use]
    pub fn side_to_move(&self) -> Color {
        match self.position.turn() {
            shakmaty::Color::White => Color::White,
            shakmaty::Color::Black => Color::Black,
        }
    }

    #[must_use]
    pub fn move_count(&self) -> usize {
        self.sans.len()
    }

    /// Validate and apply a move given in coordinate (`e2e4`, `e7e8q`) or
    /// standard algebraic (`Nf3`, `Qh4#`) notation.
    pub fn try_apply(&mut self, input: &str) -> Result<AcceptedMove, MoveRejection> {
        let mv = self.parse_move(input)?;
        let uci = mv.to_uci(CastlingMode::Standard).to_string();
        let mut next = self.position.clone();
        let san = SanPlus::from_move_and_play_unchecked(&mut next, &mv).to_string();
        self.position = next;
        self.sans.push(san.clone());
        *self
            .repetitions
            .entry(position_key(&self.position))
            .or_insert(0) += 1;
        Ok(AcceptedMove { san, uci })
    }

    fn parse_move(&self, input: &str) -> Result<Move, MoveRejection> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed.len() > 10 {
            return Err(MoveRejection::InvalidFormat);
        }
        if let Ok(uci) = UciMove::from_ascii(trimmed.as_bytes()) {
            return uci
                .to_move(&self.position)
                .map_err(|_| MoveRejection::Illegal);
        }
        match SanPlus::from_ascii(trimmed.as_bytes()) {
            Ok(san_plus) => san_plus
                .san
                .to_move(&self.position)
                .map_err(|_| MoveRejection::Illegal),
            Err(_) => Err(MoveRejection::InvalidFormat),
        }
    }

    #[must_use]
    pub fn fen(&self) -> String {
        Fen::from_position(self.position.clone(), EnPassantMode::Legal).to_string()
    }

    /// Numbered movetext, with the result token appended once terminal.
    #[must_use]
    pub fn pgn(&self) -> String {
        let mut out = String::new();
        for (i, san) in self.sans.iter().enumerate() {
            if i % 2 == 0 {
                if i > 0 {
                    out.push(' ');
                }
                out.push_str(&format!("{}. ", i / 2 + 1));
            } else {
                out.push(' ');
            }
            out.push_str(san);
        }
        if let Some((winner, _)) = self.terminal_outcome() {
            let token = match winner {
                Winner::White => "1-0",
                Winner::Black => "0-1",
                Winner::Draw => "1/2-1/2",
            };
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(token);
        }
        out
    }

    #[must_use]
    pub fn in_checkmate(&self) -> bool {
        self.position.is_checkmate()
    }

    #[must_use]
    pub fn in_stalemate(&self) -> bool {
        self.position.is_stalemate()
    }

    #[must_use]
    pub fn insufficient_material(&self) -> bool {
        self.position.is_insufficient_material()
    }

    #[must_use]
    pub fn in_threefold_repetition(&self) -> bool {
        self.repetitions
            .get(&position_key(&self.position))
            .is_some_and(|count| *count >= 3)
    }

    #[must_use]
    pub fn fifty_move_rule(&self) -> bool {
        self.position.halfmoves() >= 100
    }

    #[must_use]
    pub fn in_draw(&self) -> bool {
        self.in_stalemate()
            || self.in_threefold_repetition()
            || self.insufficient_material()
            || self.fifty_move_rule()
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.in_checkmate() || self.in_draw()
    }

    /// Winner and reason when the position itself decides the game.
    /// Resignation, timeout and forfeit are the room's business.
    #[must_use]
    pub fn terminal_outcome(&self) -> Option<(Winner, EndReason)> {
        if self.in_checkmate() {
            return Some((
                Winner::from(self.side_to_move().opposite()),
                EndReason::Checkmate,
            ));
        }
        if self.in_stalemate() {
            return Some((Winner::Draw, EndReason::Stalemate));
        }
        if self.in_threefold_repetition() {
            return Some((Winner::Draw, EndReason::ThreefoldRepetition));
        }
        if self.insufficient_material() {
            return Some((Winner::Draw, EndReason::InsufficientMaterial));
        }
        if self.fifty_move_rule() {
            return Some((Winner::Draw, EndReason::FiftyMoveRule));
        }
        None
    }
}

fn position_key(position: &Chess) -> String {
    let fen = Fen::from_position(position.clone(), EnPassantMode::Legal).to_string();
    fen.split_whitespace().take(4).collect::<Vec<_>>().join(" ")
}
