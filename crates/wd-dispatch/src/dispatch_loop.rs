//! Per-instance dispatch loop.
//!
//! One loop runs per connected instance and handles one message at a time:
//! claim → (cycle pause) → typing → send → confirm → pacing pause. The life
//! flag is checked at the top of every iteration and interrupts every sleep;
//! a send already in progress is allowed to finish.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};
use wd_common::{
    ConfirmationCode, ConfirmationRequest, MessageId, QueuedMessage, SendOutcome, SenderInstance,
};

use crate::ledger::DispatchLedger;
use crate::lifecycle::{is_alive, sleep_while_alive};
use crate::pacing::{CyclePause, PacingPolicy};
use crate::provider::MessageSender;
use crate::state::{Claim, DispatchState};
use crate::upstream::Confirmer;

/// What a dispatch loop is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopPhase {
    Idle,
    Typing,
    Sending,
    Confirming,
    Pausing,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Total send attempts per message, first one included
    pub max_send_attempts: u32,
    /// Wait when the working queue is empty
    pub idle_poll_interval: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_send_attempts: 3,
            idle_poll_interval: Duration::from_secs(5),
        }
    }
}

/// Everything a dispatch loop shares with the rest of the worker
#[derive(Clone)]
pub struct DispatchContext {
    pub state: Arc<DispatchState>,
    pub ledger: Arc<DispatchLedger>,
    pub sender: Arc<dyn MessageSender>,
    pub confirmer: Arc<dyn Confirmer>,
    pub pacing: Arc<PacingPolicy>,
    pub settings: DispatchSettings,
}

/// How the dispatch of one claimed message ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    Delivered { attempts: u32 },
    Rejected { status_code: u16 },
    Exhausted { attempts: u32 },
    /// Stopped before any send attempt; the message goes back to the queue
    Interrupted,
    /// Stopped during retry backoff. Earlier attempts may have reached the
    /// recipient, so the message is abandoned rather than requeued.
    StoppedAfterAttempts { attempts: u32 },
}

pub struct DispatchLoop {
    instance: SenderInstance,
    ctx: DispatchContext,
    life: watch::Receiver<bool>,
    phase: watch::Sender<LoopPhase>,
    rng: StdRng,
}

impl DispatchLoop {
    pub fn new(
        instance: SenderInstance,
        ctx: DispatchContext,
        life: watch::Receiver<bool>,
        phase: watch::Sender<LoopPhase>,
    ) -> Self {
        Self {
            instance,
            ctx,
            life,
            phase,
            rng: StdRng::from_entropy(),
        }
    }

    /// Use a fixed RNG seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn instance(&self) -> &SenderInstance {
        &self.instance
    }

    /// Run until the life flag turns false
    pub async fn run(mut self) {
        let span = info_span!("dispatch_loop", instance = %self.instance.name);
        async move {
            info!("Dispatch loop started");
            self.run_inner().await;
            self.set_phase(LoopPhase::Stopped);
            info!("Dispatch loop stopped");
        }
        .instrument(span)
        .await
    }

    async fn run_inner(&mut self) {
        while is_alive(&self.life) {
            self.set_phase(LoopPhase::Idle);

            let (guard, message) = match self.ctx.state.claim_next() {
                Claim::Claimed(guard, message) => (guard, message),
                Claim::Skipped { id, reason } => {
                    debug!(message_id = id, ?reason, "Skipping dequeued message");
                    continue;
                }
                Claim::Empty => {
                    let idle = self.ctx.settings.idle_poll_interval;
                    if !sleep_while_alive(&mut self.life, idle).await {
                        break;
                    }
                    continue;
                }
            };

            let result = self.dispatch(&message).await;
            drop(guard);

            match result {
                DispatchResult::Interrupted => {
                    if self.ctx.state.requeue_front(message) {
                        debug!("Returned unsent message to the queue");
                    }
                    break;
                }
                DispatchResult::StoppedAfterAttempts { .. } => break,
                _ => {}
            }
            self.instance.messages_sent_in_cycle += 1;

            self.set_phase(LoopPhase::Pausing);
            let wait = self.ctx.pacing.inter_message_delay(&mut self.rng);
            debug!(wait_ms = wait.as_millis() as u64, "Waiting before next message");
            if !sleep_while_alive(&mut self.life, wait).await {
                break;
            }
        }
    }

    /// Dispatch one claimed message. The caller holds its in-flight guard.
    pub async fn dispatch(&mut self, message: &QueuedMessage) -> DispatchResult {
        let pacing = Arc::clone(&self.ctx.pacing);

        if pacing.cycle_limit_reached(self.instance.messages_sent_in_cycle) {
            self.set_phase(LoopPhase::Pausing);
            let pause = pacing.cycle_pause(&mut self.rng);
            match pause {
                CyclePause::Break(d) => {
                    info!(pause_secs = d.as_secs_f64(), "Send limit reached, taking a long break")
                }
                CyclePause::Pause(d) => {
                    info!(pause_secs = d.as_secs_f64(), "Send limit reached, pausing")
                }
            }
            self.instance.messages_sent_in_cycle = 0;
            if !sleep_while_alive(&mut self.life, pause.duration()).await {
                return DispatchResult::Interrupted;
            }
        }

        self.set_phase(LoopPhase::Typing);
        let typing = pacing.typing_delay(&message.body, &mut self.rng);
        debug!(
            message_id = message.id,
            typing_ms = typing.as_millis() as u64,
            "Simulating typing"
        );
        if !sleep_while_alive(&mut self.life, typing).await {
            return DispatchResult::Interrupted;
        }

        let max_attempts = self.ctx.settings.max_send_attempts.max(1);
        let mut attempt = 1;
        loop {
            self.set_phase(LoopPhase::Sending);
            info!(
                message_id = message.id,
                destination = %message.destination,
                attempt = attempt,
                "Sending message"
            );

            match self.ctx.sender.send(&self.instance, message).await {
                SendOutcome::Delivered { status_code } => {
                    info!(message_id = message.id, status_code = status_code, "Message delivered");
                    self.record_sent(message.id).await;
                    self.confirm(message.id, ConfirmationCode::Success).await;
                    return DispatchResult::Delivered { attempts: attempt };
                }
                SendOutcome::Rejected { status_code, error } => {
                    warn!(
                        message_id = message.id,
                        status_code = status_code,
                        error = %error,
                        "Message rejected by provider, not retrying"
                    );
                    self.ctx.state.mark_abandoned(message.id);
                    self.confirm(message.id, ConfirmationCode::Failure).await;
                    return DispatchResult::Rejected { status_code };
                }
                SendOutcome::Transient { error, .. } if attempt >= max_attempts => {
                    error!(
                        message_id = message.id,
                        attempts = attempt,
                        error = %error,
                        "Send failed after all attempts, abandoning message"
                    );
                    self.ctx.state.mark_abandoned(message.id);
                    return DispatchResult::Exhausted { attempts: attempt };
                }
                SendOutcome::Transient { error, .. } => {
                    self.set_phase(LoopPhase::Pausing);
                    let backoff = pacing.retry_backoff(&mut self.rng);
                    warn!(
                        message_id = message.id,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "Send failed, retrying"
                    );
                    if !sleep_while_alive(&mut self.life, backoff).await {
                        warn!(
                            message_id = message.id,
                            attempts = attempt,
                            "Stopped while waiting to retry, abandoning message"
                        );
                        self.ctx.state.mark_abandoned(message.id);
                        return DispatchResult::StoppedAfterAttempts { attempts: attempt };
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn record_sent(&self, id: MessageId) {
        self.ctx.state.mark_sent(id);
        if let Err(e) = self.ctx.ledger.persist(&self.ctx.state).await {
            error!(message_id = id, error = %e, "Failed to persist ledger");
        }
    }

    async fn confirm(&self, id: MessageId, code: ConfirmationCode) {
        self.set_phase(LoopPhase::Confirming);
        let request = ConfirmationRequest {
            message_id: id,
            instance_name: self.instance.name.clone(),
            code,
        };
        match self.ctx.confirmer.confirm(&request).await {
            Ok(()) => debug!(message_id = id, cenvio = code.as_u8(), "Send confirmed upstream"),
            Err(e) => error!(message_id = id, error = %e, "Failed to confirm send"),
        }
    }

    fn set_phase(&self, phase: LoopPhase) {
        self.phase.send_replace(phase);
    }
}
