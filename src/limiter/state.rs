//! Data Limiter State Machine
//!
//! The [`DataLimiter`] decides, message by message, whether telemetry may be
//! sent over a metered connection now or has to wait in the durable queue
//! until the next billing period.
//!
//! It is driven by four independent inputs: inbound messages, the rollover
//! timer, configuration updates, and closure of the inbound stream. Each
//! state is a method that returns the next state, so every transition can be
//! exercised on its own by building a limiter in the desired shape.
//!
//! ```text
//!            ┌────────────── rollover / config ─────────────┐
//!            v                                              │
//!       ┌─────────┐   room left   ┌─────────────┐           │
//!  ───> │ initial │ ────────────> │ underBudget │ ──────────┤
//!       └─────────┘               └─────────────┘           │
//!            │ exhausted            │ message goes over      │
//!            v                      v                       │
//!       ┌────────────┐ <────────────┘                        │
//!       │ overBudget │ ──────────────────────────────────────┘
//!       └────────────┘
//!   inbound closed (either budget state) -> cleanup -> terminal
//! ```

use chrono::{DateTime, Utc};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, info, warn};

use super::budget::{next_rollover, BudgetWindow};
use super::data_limit::CellularConfig;
use super::store::{BudgetStore, SavedWindow};
use crate::message::Message;
use crate::queue::MessageStore;

/// Limiter states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Entry state; picks a budget state without blocking
    Initial,
    /// Messages are forwarded
    UnderBudget,
    /// Messages are queued until the window resets
    OverBudget,
    /// Inbound stream closed; outbound stream is being closed
    Cleanup,
    /// Processing has ended
    Terminal,
}

/// Something the limiter woke up for
#[derive(Debug)]
enum Input {
    Rollover,
    Closed,
    Message(Message),
    Config(CellularConfig),
    ConfigClosed,
}

/// Metered-data admission control
pub struct DataLimiter {
    window: BudgetWindow,
    plan_date: u32,
    rollover: DateTime<Utc>,
    timer: Pin<Box<Sleep>>,
    inbound: mpsc::Receiver<Message>,
    config: Option<mpsc::Receiver<CellularConfig>>,
    outbound: Option<mpsc::Sender<Message>>,
    overflow: Arc<dyn MessageStore>,
    store: Option<Arc<dyn BudgetStore>>,
}

impl DataLimiter {
    /// Create a limiter and its outbound stream
    ///
    /// `initial` sets the starting budget and billing-cycle day; later
    /// updates arrive on `config`. Messages that cannot be sent in the
    /// current window are handed to `overflow`.
    ///
    /// Arms the rollover timer, so it must be called from within a tokio
    /// runtime.
    pub fn new(
        inbound: mpsc::Receiver<Message>,
        config: mpsc::Receiver<CellularConfig>,
        overflow: Arc<dyn MessageStore>,
        initial: CellularConfig,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (outbound, output) = mpsc::channel(1);
        let mut window = BudgetWindow::default();
        window.set_budget(initial.limit.unwrap_or(0), initial.limit.is_some());
        let rollover = next_rollover(initial.date, Utc::now());

        let limiter = Self {
            window,
            plan_date: initial.date,
            rollover,
            timer: Box::pin(tokio::time::sleep_until(deadline(rollover))),
            inbound,
            config: Some(config),
            outbound: Some(outbound),
            overflow,
            store: None,
        };
        (limiter, output)
    }

    /// Persist the budget window in `store`
    ///
    /// Bytes counted in a window saved before a restart are restored when
    /// that window has not rolled over yet.
    pub async fn with_store(mut self, store: Arc<dyn BudgetStore>) -> Self {
        match store.load().await {
            Ok(Some(saved)) if saved.is_current(Utc::now()) => {
                info!("Restored {} bytes consumed this period", saved.window.count);
                self.window.count = saved.window.count;
            }
            Ok(Some(_)) => debug!("Saved budget window has rolled over, starting fresh"),
            Ok(None) => {}
            Err(e) => warn!("Failed to load budget window: {}", e),
        }
        self.store = Some(store);
        self
    }

    /// Current budget window
    pub fn window(&self) -> BudgetWindow {
        self.window
    }

    /// Instant the current window ends
    pub fn rollover(&self) -> DateTime<Utc> {
        self.rollover
    }

    /// Run until the inbound stream closes
    ///
    /// The outbound stream is closed exactly once on the way out.
    pub async fn run(mut self) {
        let mut state = State::Initial;
        while state != State::Terminal {
            let next = self.lookup(state).await;
            if next != state {
                debug!("Data limiter: {:?} -> {:?}", state, next);
            }
            state = next;
        }
        info!("Data limiter stopped");
    }

    /// Execute one state and return the next
    async fn lookup(&mut self, state: State) -> State {
        match state {
            State::Initial => self.initial(),
            State::UnderBudget => self.under_budget().await,
            State::OverBudget => self.over_budget().await,
            State::Cleanup => self.cleanup(),
            State::Terminal => State::Terminal,
        }
    }

    fn initial(&self) -> State {
        if self.window.is_exhausted() {
            State::OverBudget
        } else {
            State::UnderBudget
        }
    }

    async fn under_budget(&mut self) -> State {
        match self.next_input().await {
            Input::Rollover => self.roll_over().await,
            Input::Closed => State::Cleanup,
            Input::Message(m) => self.handle_message(m).await,
            Input::Config(c) => self.apply_config(c).await,
            Input::ConfigClosed => State::UnderBudget,
        }
    }

    async fn over_budget(&mut self) -> State {
        match self.next_input().await {
            Input::Rollover => self.roll_over().await,
            Input::Closed => State::Cleanup,
            Input::Message(m) => {
                self.defer(m).await;
                State::OverBudget
            }
            Input::Config(c) => self.apply_config(c).await,
            Input::ConfigClosed => State::OverBudget,
        }
    }

    fn cleanup(&mut self) -> State {
        // Dropping the only sender closes the stream for the consumer.
        self.outbound.take();
        State::Terminal
    }

    /// Wait for whichever input is ready first
    async fn next_input(&mut self) -> Input {
        tokio::select! {
            () = &mut self.timer => Input::Rollover,
            m = self.inbound.recv() => match m {
                Some(m) => Input::Message(m),
                None => Input::Closed,
            },
            c = next_config(&mut self.config) => match c {
                Some(c) => Input::Config(c),
                None => {
                    debug!("Configuration stream closed");
                    self.config = None;
                    Input::ConfigClosed
                }
            },
        }
    }

    /// Charge `m` against the window, then forward or defer it
    async fn handle_message(&mut self, m: Message) -> State {
        self.window.count = self.window.count.saturating_add(m.bytes.len() as u64);
        self.save().await;

        if self.window.is_exceeded() {
            info!(
                "Data budget exhausted ({} of {} bytes), queueing until {}",
                self.window.count, self.window.budget, self.rollover
            );
            self.defer(m).await;
            return State::OverBudget;
        }

        self.forward(m).await;
        State::UnderBudget
    }

    /// Blocking send downstream
    async fn forward(&self, m: Message) {
        let Some(outbound) = &self.outbound else {
            self.defer(m).await;
            return;
        };
        if let Err(mpsc::error::SendError(m)) = outbound.send(m).await {
            warn!("Downstream consumer is gone, queueing {} message", m.topic);
            self.defer(m).await;
        }
    }

    /// Leave `m` in the durable queue for a later period
    async fn defer(&self, m: Message) {
        if m.is_persisted() {
            debug!("Holding queued {} message {:?}", m.topic, m.path());
            return;
        }
        let topic = m.topic;
        match self.overflow.store(m).await {
            Ok(stored) if stored.is_persisted() => {
                debug!("Queued over-budget {} message {:?}", topic, stored.path())
            }
            Ok(_) => warn!("Over-budget {} message could not be persisted", topic),
            Err(e) if e.is_storage_full() => {
                warn!("Queue is full, dropping over-budget {} message: {}", topic, e)
            }
            Err(e) => error!("Dropping over-budget {} message: {}", topic, e),
        }
    }

    async fn roll_over(&mut self) -> State {
        self.window.reset();
        // The monotonic timer may fire before the wall clock reaches the
        // deadline; the next window must still start after this one.
        let after = std::cmp::max(Utc::now(), self.rollover + chrono::Duration::nanoseconds(1));
        self.schedule(after);
        info!("Data budget period rolled over, next rollover at {}", self.rollover);
        self.save().await;
        State::Initial
    }

    async fn apply_config(&mut self, c: CellularConfig) -> State {
        self.window.set_budget(c.limit.unwrap_or(0), c.limit.is_some());
        self.plan_date = c.date;
        self.schedule(Utc::now());
        info!(
            "Data budget configured: limit={:?}MB plan_date={} used={} bytes",
            c.limit, c.date, self.window.count
        );
        self.save().await;
        State::Initial
    }

    /// Arm the timer for the rollover following `now`
    fn schedule(&mut self, now: DateTime<Utc>) {
        self.rollover = next_rollover(self.plan_date, now);
        self.timer.as_mut().reset(deadline(self.rollover));
    }

    async fn save(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let saved = SavedWindow {
            window: self.window,
            rollover: self.rollover,
        };
        if let Err(e) = store.save(&saved).await {
            warn!("Failed to save budget window: {}", e);
        }
    }
}

/// Next configuration update; never resolves once the stream is gone
async fn next_config(config: &mut Option<mpsc::Receiver<CellularConfig>>) -> Option<CellularConfig> {
    match config {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Monotonic instant matching a wall-clock time, clamped to now
fn deadline(at: DateTime<Utc>) -> Instant {
    let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Instant::now() + wait
}
