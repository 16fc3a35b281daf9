//! Lock-step session runtime.
//!
//! A [`Session`] owns one [`SimulationContext`] and the channels to every
//! peer. Its task is the only one that touches the context: it waits on the
//! boundary timer, on control requests from [`SessionHandle`]s and on
//! inbound messages from the per-peer receive loops, and handles them one
//! at a time.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use lockstep_core::command::{Command, PlayerId, Tick};
use lockstep_core::context::{BoundaryReport, SimulationContext};
use lockstep_core::dispatcher::DispatchStats;
use lockstep_core::math::Fixed;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::async_channel::{AsyncChannel, PacketReceiver};
use crate::error::{NetError, Result};
use crate::packet::{Disconnect, Hello, Message, Packet, SpeedChange, PROTOCOL_VERSION};

/// Shortest interval the driver will wait between boundaries.
const MIN_INTERVAL: Duration = Duration::from_micros(100);

/// Every this many ticks the world hash is kept for the summary.
pub const CHECKPOINT_INTERVAL: Tick = 10;

/// Wall-clock pacing for boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockDriver {
    deadline: Instant,
}

impl ClockDriver {
    /// First boundary one interval after `now`.
    #[must_use]
    pub fn new(now: Instant, interval: Duration) -> Self {
        Self {
            deadline: now + interval.max(MIN_INTERVAL),
        }
    }

    /// When the next boundary is due.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Schedule the next boundary after one fired at `now`.
    ///
    /// Returns how many whole intervals were overslept.
    pub fn fire(&mut self, now: Instant, interval: Duration) -> u64 {
        let interval = interval.max(MIN_INTERVAL);
        let late = now.saturating_duration_since(self.deadline);
        let missed = (late.as_nanos() / interval.as_nanos()) as u64;
        self.deadline = if missed == 0 {
            self.deadline + interval
        } else {
            now + interval
        };
        missed
    }

    /// Restart pacing from `now`, e.g. after a speed change.
    pub fn reset(&mut self, now: Instant, interval: Duration) {
        self.deadline = now + interval.max(MIN_INTERVAL);
    }
}

/// Requests a [`SessionHandle`] can make.
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    /// Queue a local command.
    Submit(Command),
    /// Change clock speed and tell the peers.
    SetSpeed(Fixed),
    /// Pause the local clock.
    Pause,
    /// Resume the local clock.
    Resume,
    /// Run missed boundaries now.
    FastForward,
    /// End the session.
    Shutdown,
}

/// Cloneable handle to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Control>,
}

impl SessionHandle {
    fn send(&self, control: Control) -> Result<()> {
        self.tx.send(control).map_err(|_| NetError::Closed)
    }

    /// Queue a local command for the next flush.
    pub fn submit(&self, command: Command) -> Result<()> {
        self.send(Control::Submit(command))
    }

    /// Change the clock speed.
    pub fn set_speed(&self, speed: Fixed) -> Result<()> {
        self.send(Control::SetSpeed(speed))
    }

    /// Pause the clock.
    pub fn pause(&self) -> Result<()> {
        self.send(Control::Pause)
    }

    /// Resume the clock.
    pub fn resume(&self) -> Result<()> {
        self.send(Control::Resume)
    }

    /// Work off missed boundaries.
    pub fn fast_forward(&self) -> Result<()> {
        self.send(Control::FastForward)
    }

    /// Stop the session.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Control::Shutdown)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// A handle asked for it.
    Shutdown,
    /// The configured stop tick was reached.
    StopTick,
    /// A peer left and nothing more could be simulated without it.
    PeerLeft {
        /// Who left.
        player: PlayerId,
        /// Their stated reason, or a note that the stream closed.
        reason: String,
    },
}

/// Final state of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Last executed tick.
    pub final_tick: Tick,
    /// World hash at that tick.
    pub state_hash: u64,
    /// Dispatcher counters.
    pub stats: DispatchStats,
    /// World hash at every tick divisible by [`CHECKPOINT_INTERVAL`].
    pub checkpoints: BTreeMap<Tick, u64>,
    /// Why it ended.
    pub reason: EndReason,
}

#[derive(Debug)]
enum InboundEvent {
    Message(Message),
    Closed,
    Failed(NetError),
}

#[derive(Debug)]
struct Inbound {
    from: PlayerId,
    event: InboundEvent,
}

struct Peer {
    channel: AsyncChannel,
    receive_task: JoinHandle<()>,
}

enum Wake {
    Control(Option<Control>),
    Inbound(Inbound),
    Boundary,
}

/// One peer's lock-step session.
pub struct Session {
    context: SimulationContext,
    local_player: PlayerId,
    seed: u64,
    peers: BTreeMap<PlayerId, Peer>,
    greeted: BTreeSet<PlayerId>,
    departed: Option<EndReason>,
    checkpoints: BTreeMap<Tick, u64>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    controls_open: bool,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    stop_at: Option<Tick>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("local_player", &self.local_player)
            .field("tick", &self.context.tick())
            .field("peers", &self.peers.keys().collect::<Vec<_>>())
            .field("stop_at", &self.stop_at)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session around `context`.
    ///
    /// `seed` is compared with every peer's handshake.
    pub fn new(
        context: SimulationContext,
        local_player: PlayerId,
        seed: u64,
    ) -> (Self, SessionHandle) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let session = Self {
            context,
            local_player,
            seed,
            peers: BTreeMap::new(),
            greeted: BTreeSet::new(),
            departed: None,
            checkpoints: BTreeMap::new(),
            control_rx,
            controls_open: true,
            inbound_tx,
            inbound_rx,
            stop_at: None,
        };
        (session, SessionHandle { tx: control_tx })
    }

    /// End the session once this tick has executed.
    #[must_use]
    pub fn stop_at(mut self, tick: Tick) -> Self {
        self.stop_at = Some(tick);
        self
    }

    /// The simulation.
    #[must_use]
    pub const fn context(&self) -> &SimulationContext {
        &self.context
    }

    /// Attach a peer: start its channel, spawn its receive loop and send
    /// the handshake.
    pub fn add_peer(&mut self, player: PlayerId, channel: AsyncChannel) -> Result<()> {
        if player == self.local_player || self.peers.contains_key(&player) {
            return Err(NetError::Protocol(format!("player {player} already attached")));
        }
        let receiver = channel.start()?;
        let receive_task =
            tokio::spawn(run_receive_loop(player, receiver, self.inbound_tx.clone()));
        channel.send_async(
            Message::Hello(Hello {
                version: PROTOCOL_VERSION,
                player: self.local_player,
                seed: self.seed,
            })
            .to_packet()?,
        );
        self.peers.insert(
            player,
            Peer {
                channel,
                receive_task,
            },
        );
        debug!(player, "Peer attached");
        Ok(())
    }

    /// Drive the simulation until shutdown, the stop tick or a fatal error.
    pub async fn run(mut self) -> Result<SessionSummary> {
        info!(
            player = self.local_player,
            peers = self.peers.len(),
            "Session started"
        );
        let outcome = self.drive().await;
        let reason = match &outcome {
            Ok(EndReason::Shutdown) => "shutdown".to_string(),
            Ok(EndReason::StopTick) => "finished".to_string(),
            Ok(EndReason::PeerLeft { .. }) => "peer left".to_string(),
            Err(err) => err.to_string(),
        };
        self.disconnect(reason).await;

        let reason = outcome?;
        let summary = SessionSummary {
            final_tick: self.context.tick(),
            state_hash: self.context.state_hash(),
            stats: self.context.stats(),
            checkpoints: std::mem::take(&mut self.checkpoints),
            reason,
        };
        info!(
            tick = summary.final_tick,
            hash = summary.state_hash,
            reason = ?summary.reason,
            "Session ended"
        );
        Ok(summary)
    }

    async fn drive(&mut self) -> Result<EndReason> {
        let mut driver = ClockDriver::new(Instant::now(), self.context.clock().boundary_interval());
        loop {
            let wake = tokio::select! {
                biased;
                control = self.control_rx.recv(), if self.controls_open => Wake::Control(control),
                Some(inbound) = self.inbound_rx.recv() => Wake::Inbound(inbound),
                () = tokio::time::sleep_until(driver.deadline()) => Wake::Boundary,
            };

            match wake {
                Wake::Control(None) => self.controls_open = false,
                Wake::Control(Some(Control::Shutdown)) => return Ok(EndReason::Shutdown),
                Wake::Control(Some(control)) => {
                    let interval_changed = matches!(control, Control::SetSpeed(_));
                    self.handle_control(control)?;
                    if interval_changed {
                        driver.reset(Instant::now(), self.context.clock().boundary_interval());
                    }
                }
                Wake::Inbound(inbound) => {
                    let speed_changed =
                        matches!(inbound.event, InboundEvent::Message(Message::SpeedChange(_)));
                    self.handle_inbound(inbound)?;
                    if speed_changed {
                        driver.reset(Instant::now(), self.context.clock().boundary_interval());
                    }
                }
                Wake::Boundary => {
                    let interval = self.context.clock().boundary_interval();
                    let missed = driver.fire(Instant::now(), interval);
                    for _ in 0..missed {
                        self.context.clock_mut().record_missed();
                    }
                    let report = self.context.on_boundary()?;
                    let stalled = report.stalled;
                    self.publish(report)?;
                    if stalled {
                        if let Some(reason) = self.departed.take() {
                            return Ok(reason);
                        }
                    }
                }
            }

            if self.stop_at.is_some_and(|stop| self.context.tick() >= stop) {
                return Ok(EndReason::StopTick);
            }
        }
    }

    fn handle_control(&mut self, control: Control) -> Result<()> {
        match control {
            Control::Submit(command) => self.context.submit(command),
            Control::SetSpeed(speed) => {
                if let Err(err) = self.context.clock_mut().set_speed(speed) {
                    warn!(error = %err, "Speed change rejected");
                    return Ok(());
                }
                let packet = Message::SpeedChange(SpeedChange {
                    tick: self.context.tick(),
                    speed,
                })
                .to_packet()?;
                self.broadcast(&packet);
            }
            Control::Pause => self.context.clock_mut().pause(),
            Control::Resume => self.context.clock_mut().resume(),
            Control::FastForward => {
                let report = self.context.fast_forward()?;
                self.publish(report)?;
            }
            Control::Shutdown => {}
        }
        Ok(())
    }

    fn handle_inbound(&mut self, inbound: Inbound) -> Result<()> {
        let from = inbound.from;
        match inbound.event {
            InboundEvent::Message(Message::Hello(hello)) => {
                if hello.version != PROTOCOL_VERSION {
                    return Err(NetError::Protocol(format!(
                        "peer {from} speaks protocol {}, expected {PROTOCOL_VERSION}",
                        hello.version
                    )));
                }
                if hello.player != from {
                    return Err(NetError::Protocol(format!(
                        "peer attached as {from} introduced itself as {}",
                        hello.player
                    )));
                }
                if hello.seed != self.seed {
                    return Err(NetError::Protocol(format!(
                        "peer {from} runs seed {}, local seed is {}",
                        hello.seed, self.seed
                    )));
                }
                info!(player = from, "Peer handshake complete");
                self.greeted.insert(from);
            }
            InboundEvent::Message(message) if !self.greeted.contains(&from) => {
                return Err(NetError::Protocol(format!(
                    "peer {from} sent {:?} before its handshake",
                    message.key()
                )));
            }
            InboundEvent::Message(Message::Commands(batch)) => {
                if batch.player != from {
                    return Err(NetError::Protocol(format!(
                        "peer {from} sent a batch for player {}",
                        batch.player
                    )));
                }
                self.context.accept_remote(batch)?;
                if self.context.clock().backlog() > 0 {
                    let report = self.context.fast_forward()?;
                    self.publish(report)?;
                }
            }
            InboundEvent::Message(Message::SpeedChange(change)) => {
                debug!(player = from, tick = change.tick, "Peer changed speed");
                self.context.clock_mut().set_speed(change.speed)?;
            }
            InboundEvent::Message(Message::Disconnect(disconnect)) => {
                info!(player = from, reason = %disconnect.reason, "Peer disconnected");
                self.departed = Some(EndReason::PeerLeft {
                    player: from,
                    reason: disconnect.reason,
                });
            }
            InboundEvent::Closed => {
                if self.departed.is_none() {
                    warn!(player = from, "Peer closed its stream");
                    self.departed = Some(EndReason::PeerLeft {
                        player: from,
                        reason: "stream closed".to_string(),
                    });
                }
            }
            InboundEvent::Failed(err) => return Err(err),
        }
        Ok(())
    }

    fn publish(&mut self, report: BoundaryReport) -> Result<()> {
        if report.stalled {
            debug!(tick = self.context.tick(), "Waiting for peers");
        }
        for step in &report.steps {
            let tick = step.boundary.tick;
            if tick % CHECKPOINT_INTERVAL == 0 {
                debug!(tick, hash = step.state_hash, "Checkpoint");
                self.checkpoints.insert(tick, step.state_hash);
            }
        }
        for batch in report.outbound {
            let packet = Message::Commands(batch).to_packet()?;
            self.broadcast(&packet);
        }
        Ok(())
    }

    fn broadcast(&self, packet: &Packet) {
        for peer in self.peers.values() {
            peer.channel.send_async(packet.clone());
        }
    }

    async fn disconnect(&mut self, reason: String) {
        for (player, peer) in std::mem::take(&mut self.peers) {
            match Message::Disconnect(Disconnect {
                reason: reason.clone(),
            })
            .to_packet()
            {
                Ok(packet) => peer.channel.send_async(packet),
                Err(err) => warn!(player, error = %err, "Could not encode disconnect"),
            }
            if let Err(err) = peer.channel.finish().await {
                debug!(player, error = %err, "Channel ended with error");
            }
            peer.receive_task.abort();
        }
    }
}

/// Forward every packet from one peer to the session, in arrival order,
/// until the stream ends or fails.
async fn run_receive_loop(
    player: PlayerId,
    mut receiver: PacketReceiver,
    inbound: mpsc::UnboundedSender<Inbound>,
) {
    loop {
        let event = match receiver.recv().await {
            Ok(Some(packet)) => match Message::from_packet(&packet) {
                Ok(message) => InboundEvent::Message(message),
                Err(err) => InboundEvent::Failed(err),
            },
            Ok(None) => InboundEvent::Closed,
            Err(err) => InboundEvent::Failed(err),
        };
        let last = !matches!(event, InboundEvent::Message(_));
        if inbound.send(Inbound { from: player, event }).is_err() || last {
            break;
        }
    }
}
