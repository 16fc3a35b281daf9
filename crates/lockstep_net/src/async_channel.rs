//! Channel with a background sender.
//!
//! `send_async` appends to an unbounded FIFO and returns immediately. One
//! sender task, spawned by [`AsyncChannel::start`], is the only writer on
//! the stream and drains the FIFO in order. Closing drops whatever is
//! still queued.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::channel::{Channel, PacketReader, PacketWriter};
use crate::error::{NetError, Result};
use crate::packet::Packet;

struct Unstarted {
    reader: PacketReader,
    writer: PacketWriter,
    queue: mpsc::UnboundedReceiver<Packet>,
}

/// Packet channel whose sends never block the caller.
pub struct AsyncChannel {
    queue: mpsc::UnboundedSender<Packet>,
    queued: Arc<AtomicUsize>,
    closed: Arc<watch::Sender<bool>>,
    unstarted: Mutex<Option<Unstarted>>,
    sender: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl std::fmt::Debug for AsyncChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncChannel")
            .field("queued", &self.queued())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl AsyncChannel {
    /// Wrap a channel. Nothing is written until [`start`](Self::start).
    pub fn new(channel: Channel) -> Self {
        let (reader, writer) = channel.split();
        let (queue, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        Self {
            queue,
            queued: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(closed),
            unstarted: Mutex::new(Some(Unstarted {
                reader,
                writer,
                queue: rx,
            })),
            sender: Mutex::new(None),
        }
    }

    /// Spawn the sender task and hand out the receive side.
    ///
    /// Must be called from within a tokio runtime. A second call fails
    /// with [`NetError::AlreadyStarted`].
    pub fn start(&self) -> Result<PacketReceiver> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        let unstarted = self
            .unstarted
            .lock()
            .map_err(|_| NetError::Closed)?
            .take()
            .ok_or(NetError::AlreadyStarted)?;

        let task = tokio::spawn(run_sender(
            unstarted.writer,
            unstarted.queue,
            Arc::clone(&self.closed),
            Arc::clone(&self.queued),
        ));
        if let Ok(mut sender) = self.sender.lock() {
            *sender = Some(task);
        }
        debug!("Async channel started");
        Ok(PacketReceiver {
            reader: unstarted.reader,
            closed: self.closed.subscribe(),
        })
    }

    /// Queue a packet and return immediately.
    ///
    /// Packets from one caller go out in call order. After close the packet
    /// is dropped.
    pub fn send_async(&self, packet: Packet) {
        if self.is_closed() {
            debug!(key = ?packet.key(), "Dropping packet on closed channel");
            return;
        }
        self.queued.fetch_add(1, Ordering::SeqCst);
        if self.queue.send(packet).is_err() {
            release_one(&self.queued);
        }
    }

    /// Number of packets waiting for the sender task.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Whether the channel has been closed, locally or by a send failure.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Stop the sender, drop queued packets and shut the stream down.
    ///
    /// Safe to call more than once. A frame already being written is
    /// finished first.
    pub fn close(&self) {
        self.closed.send_replace(true);
        if let Ok(mut unstarted) = self.unstarted.lock() {
            if unstarted.take().is_some() {
                self.queued.store(0, Ordering::SeqCst);
            }
        }
    }

    /// Wait for the sender task to finish. Returns its error, if any.
    pub async fn join(&self) -> Result<()> {
        let task = self.sender.lock().map_err(|_| NetError::Closed)?.take();
        join_sender(task).await
    }

    /// Let the sender drain everything already queued, then shut the
    /// stream down and wait for it.
    ///
    /// Unlike [`close`](Self::close) nothing queued is dropped.
    pub async fn finish(self) -> Result<()> {
        let Self { queue, sender, .. } = self;
        drop(queue);
        let task = sender.into_inner().map_err(|_| NetError::Closed)?;
        join_sender(task).await
    }
}

async fn join_sender(task: Option<JoinHandle<Result<()>>>) -> Result<()> {
    match task {
        Some(task) => task
            .await
            .map_err(|err| NetError::Transport(std::io::Error::other(err)))?,
        None => Ok(()),
    }
}

/// Decrement the queue depth without going below zero.
///
/// The sender task resets the depth when it stops, so a send that fails
/// afterwards may find nothing left to take back.
fn release_one(queued: &AtomicUsize) {
    let _ = queued.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

async fn run_sender(
    mut writer: PacketWriter,
    mut queue: mpsc::UnboundedReceiver<Packet>,
    close_flag: Arc<watch::Sender<bool>>,
    queued: Arc<AtomicUsize>,
) -> Result<()> {
    let mut closed = close_flag.subscribe();
    let result = loop {
        let packet = tokio::select! {
            biased;
            () = wait_closed(&mut closed) => break Ok(()),
            packet = queue.recv() => match packet {
                Some(packet) => packet,
                None => break Ok(()),
            },
        };
        release_one(&queued);
        if let Err(err) = writer.send(&packet).await {
            error!(error = %err, "Send failed, closing channel");
            close_flag.send_replace(true);
            break Err(err);
        }
    };

    queue.close();
    let dropped = queued.swap(0, Ordering::SeqCst);
    if dropped > 0 {
        debug!(dropped, "Queued packets dropped on close");
    }
    if let Err(err) = writer.shutdown().await {
        warn!(error = %err, "Stream shutdown failed");
    }
    result
}

/// Receive side of a started [`AsyncChannel`].
#[derive(Debug)]
pub struct PacketReceiver {
    reader: PacketReader,
    closed: watch::Receiver<bool>,
}

impl PacketReceiver {
    /// Next packet. `None` once the peer closed cleanly or the channel was
    /// closed locally.
    ///
    /// Frames the peer already delivered are still returned after a local
    /// send failure.
    pub async fn recv(&mut self) -> Result<Option<Packet>> {
        tokio::select! {
            biased;
            packet = self.reader.recv() => packet,
            () = wait_closed(&mut self.closed) => Ok(None),
        }
    }
}
