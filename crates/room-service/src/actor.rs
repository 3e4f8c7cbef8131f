use std::sync::Arc;
use std::time::Duration as StdDuration;

use chess_domain::{EventSink, Outbound, RoomError, RoomId, SubscriberId, WalletAddress};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::state::{RoomInfo, RoomSnapshot, RoomState};

const MAILBOX_CAPACITY: usize = 64;

#[derive(Debug, Error)]
#[error("room task is gone")]
pub struct RoomClosed;

#[derive(Debug)]
pub enum RoomCommand {
    Join {
        wallet: WalletAddress,
        subscriber: SubscriberId,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    ApplyMove {
        wallet: WalletAddress,
        mv: String,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    OfferDraw {
        wallet: WalletAddress,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    AcceptDraw {
        wallet: WalletAddress,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    DeclineDraw {
        wallet: WalletAddress,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    Resign {
        wallet: WalletAddress,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    Chat {
        wallet: WalletAddress,
        text: String,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    Reconnect {
        wallet: WalletAddress,
        subscriber: SubscriberId,
        reply: oneshot::Sender<Result<RoomSnapshot, RoomError>>,
    },
    Disconnect {
        wallet: WalletAddress,
    },
    StakeVerified {
        wallet: WalletAddress,
    },
    Cancel {
        reason: String,
    },
    Info {
        reply: oneshot::Sender<RoomInfo>,
    },
    /// Injected heartbeat with an explicit timestamp; the actor's own
    /// interval drives this in production.
    Tick {
        now: DateTime<Utc>,
    },
}

/// Notice sent to the coordinator once a room has garbage-collected
/// itself, so the registries can drop the handle and session bindings.
#[derive(Debug, Clone)]
pub struct RoomRetired {
    pub room_id: RoomId,
    pub wallets: Vec<WalletAddress>,
}

#[derive(Debug, Clone)]
pub struct RoomHandle {
    sender: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> Result<T, RoomClosed> {
        let (tx, rx) = oneshot::channel();
        self.sender.send(build(tx)).await.map_err(|_| RoomClosed)?;
        rx.await.map_err(|_| RoomClosed)
    }

    pub async fn join(
        &self,
        wallet: WalletAddress,
        subscriber: SubscriberId,
    ) -> Result<Result<(), RoomError>, RoomClosed> {
        self.request(|reply| RoomCommand::Join {
            wallet,
            subscriber,
            reply,
        })
        .await
    }

    pub async fn apply_move(
        &self,
        wallet: WalletAddress,
        mv: String,
    ) -> Result<Result<(), RoomError>, RoomClosed> {
        self.request(|reply| RoomCommand::ApplyMove { wallet, mv, reply }).await
    }

    pub async fn offer_draw(
        &self,
        wallet: WalletAddress,
    ) -> Result<Result<(), RoomError>, RoomClosed> {
        self.request(|reply| RoomCommand::OfferDraw { wallet, reply }).await
    }

    pub async fn accept_draw(
        &self,
        wallet: WalletAddress,
    ) -> Result<Result<(), RoomError>, RoomClosed> {
        self.request(|reply| RoomCommand::AcceptDraw { wallet, reply }).await
    }

    pub async fn decline_draw(
        &self,
        wallet: WalletAddress,
    ) -> Result<Result<(), RoomError>, RoomClosed> {
        self.request(|reply| RoomCommand::DeclineDraw { wallet, reply }).await
    }

    pub async fn resign(
        &self,
        wallet: WalletAddress,
    ) -> Result<Result<(), RoomError>, RoomClosed> {
        self.request(|reply| RoomCommand::Resign { wallet, reply }).await
    }

    pub async fn chat(
        &self,
        wallet: WalletAddress,
        text: String,
    ) -> Result<Result<(), RoomError>, RoomClosed> {
        self.request(|reply| RoomCommand::Chat { wallet, text, reply }).await
    }

    pub async fn reconnect(
        &self,
        wallet: WalletAddress,
        subscriber: SubscriberId,
    ) -> Result<Result<RoomSnapshot, RoomError>, RoomClosed> {
        self.request(|reply| RoomCommand::Reconnect {
            wallet,
            subscriber,
            reply,
        })
        .await
    }

    pub async fn disconnect(&self, wallet: WalletAddress) -> Result<(), RoomClosed> {
        self.sender
            .send(RoomCommand::Disconnect { wallet })
            .await
            .map_err(|_| RoomClosed)
    }

    pub async fn stake_verified(&self, wallet: WalletAddress) -> Result<(), RoomClosed> {
        self.sender
            .send(RoomCommand::StakeVerified { wallet })
            .await
            .map_err(|_| RoomClosed)
    }

    pub async fn cancel(&self, reason: String) -> Result<(), RoomClosed> {
        self.sender
            .send(RoomCommand::Cancel { reason })
            .await
            .map_err(|_| RoomClosed)
    }

    pub async fn info(&self) -> Result<RoomInfo, RoomClosed> {
        self.request(|reply| RoomCommand::Info { reply }).await
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<(), RoomClosed> {
        self.sender
            .send(RoomCommand::Tick { now })
            .await
            .map_err(|_| RoomClosed)
    }
}

fn deliver(sink: &dyn EventSink, events: &[Outbound]) {
    for outbound in events {
        sink.deliver(&outbound.to, &outbound.event);
    }
}

fn handle_command(state: &mut RoomState, command: RoomCommand, sink: &dyn EventSink) {
    let now = Utc::now();
    match command {
        RoomCommand::Join {
            wallet,
            subscriber,
            reply,
        } => {
            let (result, events) = state.join(wallet, subscriber, now);
            deliver(sink, &events);
            let _ = reply.send(result);
        }
        RoomCommand::ApplyMove { wallet, mv, reply } => {
            let (result, events) = state.apply_move(&wallet, &mv, now);
            deliver(sink, &events);
            let _ = reply.send(result);
        }
        RoomCommand::OfferDraw { wallet, reply } => {
            let (result, events) = state.offer_draw(&wallet, now);
            deliver(sink, &events);
            let _ = reply.send(result);
        }
        RoomCommand::AcceptDraw { wallet, reply } => {
            let (result, events) = state.accept_draw(&wallet, now);
            deliver(sink, &events);
            let _ = reply.send(result);
        }
        RoomCommand::DeclineDraw { wallet, reply } => {
            let (result, events) = state.decline_draw(&wallet, now);
            deliver(sink, &events);
            let _ = reply.send(result);
        }
        RoomCommand::Resign { wallet, reply } => {
            let (result, events) = state.resign(&wallet, now);
            deliver(sink, &events);
            let _ = reply.send(result);
        }
        RoomCommand::Chat { wallet, text, reply } => {
            let (result, events) = state.chat(&wallet, &text, now);
            deliver(sink, &events);
            let _ = reply.send(result);
        }
        RoomCommand::Reconnect {
            wallet,
            subscriber,
            reply,
        } => {
            let (result, events) = state.reconnect(&wallet, subscriber, now);
            deliver(sink, &events);
            let _ = reply.send(result);
        }
        RoomCommand::Disconnect { wallet } => {
            let events = state.disconnect(&wallet, now);
            deliver(sink, &events);
        }
        RoomCommand::StakeVerified { wallet } => {
            let events = state.stake_verified(&wallet, now);
            deliver(sink, &events);
        }
        RoomCommand::Cancel { reason } => {
            let mut events = Vec::new();
            state.cancel(&reason, now, &mut events);
            deliver(sink, &events);
        }
        RoomCommand::Info { reply } => {
            let _ = reply.send(state.info());
        }
        RoomCommand::Tick { now } => {
            let events = state.tick(now);
            deliver(sink, &events);
        }
    }
}

/// Spawn the serial executor for one room: a mailbox consumer with a 1 Hz
/// tick. The task exits once the room has retired itself, after notifying
/// the coordinator.
pub fn spawn_room(
    mut state: RoomState,
    sink: Arc<dyn EventSink>,
    retired_tx: mpsc::Sender<RoomRetired>,
) -> RoomHandle {
    let (tx, mut rx) = mpsc::channel(MAILBOX_CAPACITY);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + StdDuration::from_secs(1),
            StdDuration::from_secs(1),
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(command) => handle_command(&mut state, command, sink.as_ref()),
                    None => break,
                },
                _ = ticker.tick() => {
                    let events = state.tick(Utc::now());
                    deliver(sink.as_ref(), &events);
                }
            }
            if state.is_retired() {
                let notice = RoomRetired {
                    room_id: state.room_id(),
                    wallets: state.wallets(),
                };
                debug!(room_id = %notice.room_id.0, "room retired");
                let _ = retired_tx.send(notice).await;
                break;
            }
        }
    });
    RoomHandle { sender: tx }
}
