//! UDP Media Transport
//!
//! One socket shared by an ingress task, N worker tasks and the feedback
//! ticker. Ingress hashes `(room, sender)` onto a worker so each stream is
//! processed in arrival order by a single task, while different streams and
//! rooms spread across workers. Queues are bounded and ingress never waits on
//! a worker: a full queue drops the datagram.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use vc_common::protocol::MediaHeader;

use crate::metrics::DropReason;
use crate::relay::{Egress, SfuServer};

/// Largest datagram read from the socket.
const MAX_DATAGRAM: usize = 65_535;

type Inbound = (Bytes, SocketAddr);

/// Worker index for a raw datagram.
///
/// Datagrams too short to carry a header all go to worker 0, which rejects
/// them.
#[must_use]
pub fn worker_for(datagram: &[u8], workers: usize) -> usize {
    let Some(route) = MediaHeader::peek_route(datagram) else {
        return 0;
    };
    let mut hasher = DefaultHasher::new();
    route.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

/// Spawn ingress, workers and ticker on `socket`.
///
/// All tasks stop when `cancel` fires.
pub fn spawn(
    socket: Arc<UdpSocket>,
    sfu: Arc<SfuServer>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let config = sfu.config();
    let workers = config.worker_count.max(1);
    let depth = config.worker_queue_depth.max(1);
    let interval = config.feedback_interval;

    let mut handles = Vec::with_capacity(workers + 2);
    let mut queues = Vec::with_capacity(workers);
    for index in 0..workers {
        let (tx, rx) = mpsc::channel(depth);
        queues.push(tx);
        handles.push(tokio::spawn(run_worker(
            index,
            rx,
            Arc::clone(&socket),
            Arc::clone(&sfu),
            cancel.clone(),
        )));
    }

    handles.push(tokio::spawn(run_ingress(
        queues,
        Arc::clone(&socket),
        Arc::clone(&sfu),
        cancel.clone(),
    )));
    handles.push(tokio::spawn(run_ticker(interval, socket, sfu, cancel)));

    info!(workers, queue_depth = depth, "Media transport started");
    handles
}

async fn run_ingress(
    queues: Vec<mpsc::Sender<Inbound>>,
    socket: Arc<UdpSocket>,
    sfu: Arc<SfuServer>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => {
                    let datagram = Bytes::copy_from_slice(&buf[..len]);
                    let worker = worker_for(&datagram, queues.len());
                    if queues[worker].try_send((datagram, from)).is_err() {
                        trace!(%from, worker, "Worker queue full");
                        sfu.metrics().record_drop(DropReason::QueueFull);
                    }
                }
                Err(e) => {
                    // ICMP errors from earlier sends surface here on some platforms.
                    debug!(error = %e, "UDP receive failed");
                }
            },
        }
    }
    debug!("Media ingress stopped");
}

async fn run_worker(
    index: usize,
    mut queue: mpsc::Receiver<Inbound>,
    socket: Arc<UdpSocket>,
    sfu: Arc<SfuServer>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            inbound = queue.recv() => {
                let Some((datagram, from)) = inbound else {
                    break;
                };
                let egress = sfu.handle_datagram(datagram, from, Instant::now());
                send_all(&socket, &sfu, egress).await;
            }
        }
    }
    debug!(worker = index, "Media worker stopped");
}

async fn run_ticker(
    period: std::time::Duration,
    socket: Arc<UdpSocket>,
    sfu: Arc<SfuServer>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let egress = sfu.on_tick(Instant::now());
                send_all(&socket, &sfu, egress).await;
            }
        }
    }
    debug!("Feedback ticker stopped");
}

async fn send_all(socket: &UdpSocket, sfu: &SfuServer, egress: Vec<Egress>) {
    for datagram in egress {
        let Some(addr) = sfu.resolve(datagram.room, datagram.to) else {
            trace!(
                room_id = %datagram.room,
                participant_id = %datagram.to,
                "No address latched, dropping egress"
            );
            continue;
        };
        if let Err(e) = socket.send_to(&datagram.payload, addr).await {
            warn!(%addr, error = %e, "UDP send failed");
        }
    }
}
