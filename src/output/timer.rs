//! Timer thread driving heartbeats, node ticks and ack sweeps.

use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, select, tick};
use log::{debug, warn};

use crate::{ack::AckTable, heartbeat::HeartbeatStrategy, node::Node};

/// Commands processed by the timer thread.
#[derive(Debug)]
pub enum TimerCommand {
    /// Stop the thread and acknowledge once heartbeat resources are released.
    Shutdown(Sender<()>),
}

/// One round of periodic work.
pub(crate) fn run_tick(nodes: &[Arc<Node>], acks: Option<&AckTable>, now: Instant) {
    for node in nodes {
        node.tick(now);
    }
    if let Some(acks) = acks {
        let expired = acks.sweep(now);
        if expired > 0 {
            debug!("ack sweep rolled back {expired} chunks");
        }
    }
}

/// Handle to the running timer thread.
pub struct Timer {
    tx: Option<Sender<TimerCommand>>,
    handle: Option<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl Timer {
    pub fn spawn(
        interval: Duration,
        nodes: Vec<Arc<Node>>,
        strategy: HeartbeatStrategy,
        acks: Option<Arc<AckTable>>,
    ) -> io::Result<Self> {
        let (tx, rx) = bounded(1);
        let handle = thread::Builder::new()
            .name("forward-timer".into())
            .spawn(move || timer_loop(rx, interval, nodes, strategy, acks))?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
            // A probe round may be mid-flight; give it a few intervals.
            shutdown_timeout: interval.saturating_mul(4).max(Duration::from_secs(1)),
        })
    }

    /// Stop the thread and wait for it to exit.
    ///
    /// A thread that does not acknowledge within the shutdown timeout is
    /// left running detached.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let ack_rx = self.tx.take().and_then(|tx| {
            let (ack_tx, ack_rx) = bounded(1);
            tx.send(TimerCommand::Shutdown(ack_tx)).ok().map(|()| ack_rx)
        });
        match ack_rx {
            Some(ack_rx) => {
                join_after_ack(&ack_rx, handle, self.shutdown_timeout);
            }
            None => {
                join(handle);
            }
        }
    }
}

/// Join `handle` once `ack_rx` confirms shutdown. Returns false when the ack
/// did not arrive in time and the thread was detached.
fn join_after_ack(ack_rx: &Receiver<()>, handle: JoinHandle<()>, timeout: Duration) -> bool {
    match ack_rx.recv_timeout(timeout) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => join(handle),
        Err(RecvTimeoutError::Timeout) => {
            warn!("forward timer did not acknowledge shutdown within {timeout:?}; detaching it");
            false
        }
    }
}

fn join(handle: JoinHandle<()>) -> bool {
    if handle.join().is_err() {
        warn!("forward timer thread panicked");
    }
    true
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn timer_loop(
    rx: Receiver<TimerCommand>,
    interval: Duration,
    nodes: Vec<Arc<Node>>,
    mut strategy: HeartbeatStrategy,
    acks: Option<Arc<AckTable>>,
) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(rx) -> command => {
                strategy.stop();
                if let Ok(TimerCommand::Shutdown(ack)) = command {
                    let _ = ack.send(());
                }
                break;
            }
            recv(ticker) -> _ => {
                strategy.probe(&nodes);
                run_tick(&nodes, acks.as_deref(), Instant::now());
            }
        }
    }
}
