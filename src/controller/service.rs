//! Controller service: UDP endpoint plus one worker.
//!
//! The network loop never waits on the controller. Incoming samples go into a
//! single-slot work mailbox; if the worker has not picked up the previous
//! sample yet, that sample is overwritten and never answered. Finished
//! replies come back over a channel and are sent from the network loop,
//! optionally after a fixed artificial delay.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::unbounded_channel;
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval};

use crate::config::ControllerServiceConfig;
use crate::controller::logic::Controller;
use crate::controller::worker::{Reply, WorkItem, WorkerOptions, spawn_worker};
use crate::error::{EmulationError, Result};
use crate::protocol::{ControlMessage, MAX_DATAGRAM, MessageKind, ParseError};
use crate::utils::clock::SimClock;
use crate::utils::diagnostics::{DiagnosticEvent, Diagnostics, DiagnosticsSnapshot};
use crate::utils::mailbox::Mailbox;
use crate::utils::recorder::{NullRecorder, Record, SharedRecorder};

#[derive(Debug, Clone, Serialize)]
pub struct ServiceReport {
    pub samples_received: u64,
    pub replies_sent: u64,
    pub unanswered: u64,
    pub diagnostics: DiagnosticsSnapshot,
}

/// Shared between the network loop and delayed reply tasks.
struct ReplySink {
    socket: Arc<UdpSocket>,
    clock: SimClock,
    recorder: SharedRecorder,
    diagnostics: Diagnostics,
    sent: AtomicU64,
}

impl ReplySink {
    fn send(&self, reply: Reply) {
        let seq = reply.message.seq();
        let bytes = match reply.message.serialize() {
            Ok(b) => b,
            Err(e) => {
                error!("Could not encode reply seq={seq}: {e}");
                return;
            }
        };
        match self.socket.try_send_to(&bytes, reply.to) {
            Ok(_) => {}
            Err(e) => {
                if e.kind() == ErrorKind::WouldBlock {
                    warn!("Send buffer full, dropping reply seq={seq}");
                } else {
                    warn!("Failed to send reply seq={seq} to {}: {e}", reply.to);
                }
                self.diagnostics.record(DiagnosticEvent::DroppedSend);
                return;
            }
        }
        self.sent.fetch_add(1, Ordering::Relaxed);
        debug!("Sent command to {} ({} bytes)", reply.to, bytes.len());

        self.recorder.push_record(
            Record::with_capacity(6)
                .field("seq", seq as f64)
                .field("recv_timestamp", reply.recv_timestamp)
                .field("recv_size", reply.recv_size as f64)
                .field("process_time", reply.process_time.as_secs_f64())
                .field("send_timestamp", self.clock.now())
                .field("send_size", bytes.len() as f64),
        );
    }
}

/// Replies waiting out the artificial delay, keyed by dispatch order. A
/// reply leaves the table exactly once: sent by its timer or abandoned at
/// shutdown.
#[derive(Default)]
struct DelayedReplies {
    pending: Arc<Mutex<HashMap<u64, Reply>>>,
    timers: JoinSet<()>,
    next_id: u64,
}

impl DelayedReplies {
    fn schedule(&mut self, sink: &Arc<ReplySink>, reply: Reply, delay: Duration) {
        while self.timers.try_join_next().is_some() {}

        let id = self.next_id;
        self.next_id += 1;
        self.pending.lock().insert(id, reply);

        let pending = self.pending.clone();
        let sink = sink.clone();
        self.timers.spawn(async move {
            tokio::time::sleep(delay).await;
            let due = pending.lock().remove(&id);
            if let Some(reply) = due {
                sink.send(reply);
            }
        });
    }

    fn waiting(&self) -> usize {
        self.pending.lock().len()
    }

    /// Cancels every timer and returns the replies that never went out,
    /// oldest first.
    fn abandon(mut self) -> Vec<Reply> {
        self.timers.abort_all();
        let mut left: Vec<(u64, Reply)> = self.pending.lock().drain().collect();
        left.sort_by_key(|(id, _)| *id);
        left.into_iter().map(|(_, reply)| reply).collect()
    }
}

pub struct ControllerService {
    socket: Arc<UdpSocket>,
    config: ControllerServiceConfig,
    recorder: SharedRecorder,
    diagnostics: Diagnostics,
    running: Arc<AtomicBool>,
}

impl ControllerService {
    /// Binds the service socket. Must be called inside a tokio runtime.
    pub async fn bind(
        config: ControllerServiceConfig,
        recorder: SharedRecorder,
        diagnostics: Diagnostics,
    ) -> Result<Self> {
        config.validate()?;
        let socket = UdpSocket::bind(config.bind_addr).await?;
        info!("Controller service listening on {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
            config,
            recorder,
            diagnostics,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub async fn bind_default(config: ControllerServiceConfig) -> Result<Self> {
        Self::bind(config, Arc::new(NullRecorder), Diagnostics::new()).await
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Clearing this flag stops the service within one poll timeout.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Serves samples with `controller` until stopped.
    pub async fn serve(self, controller: Box<dyn Controller>) -> Result<ServiceReport> {
        let ControllerService {
            socket,
            config,
            recorder,
            diagnostics,
            running,
        } = self;

        let inbox: Arc<Mailbox<WorkItem>> = Arc::new(Mailbox::new());
        let (reply_tx, mut reply_rx) = unbounded_channel::<Reply>();
        let worker = spawn_worker(
            controller,
            inbox.clone(),
            reply_tx,
            running.clone(),
            diagnostics.clone(),
            WorkerOptions {
                poll_timeout: config.poll_timeout(),
                realtime_priority: config.realtime_priority,
                pin_core: config.pin_core,
            },
        )?;

        let clock = SimClock::new();
        let sink = Arc::new(ReplySink {
            socket: socket.clone(),
            clock,
            recorder: recorder.clone(),
            diagnostics: diagnostics.clone(),
            sent: AtomicU64::new(0),
        });
        let delay = config.reply_delay();
        if let Some(d) = delay {
            info!("Delaying every reply by {} ms", d.as_millis());
        }

        let mut stop_check = interval(config.poll_timeout());
        stop_check.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut delayed = DelayedReplies::default();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut received = 0u64;
        info!("Started controller service");

        loop {
            tokio::select! {
                r = socket.recv_from(&mut buf) => {
                    match r {
                        Ok((len, from)) => {
                            if on_datagram(&buf[..len], from, &inbox, &clock, &diagnostics) {
                                received += 1;
                            }
                        }
                        Err(e) => debug!("recv_from failed: {e}"),
                    }
                }
                reply = reply_rx.recv() => {
                    match reply {
                        Some(reply) => match delay {
                            None => sink.send(reply),
                            Some(d) => delayed.schedule(&sink, reply, d),
                        },
                        None => {
                            error!("Controller worker exited unexpectedly");
                            break;
                        }
                    }
                }
                _ = stop_check.tick() => {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                }
            }
        }

        warn!("Shutting down controller service");
        running.store(false, Ordering::SeqCst);
        let held_back = delayed.abandon();
        if !held_back.is_empty() {
            debug!("{} delayed replies cancelled", held_back.len());
        }
        let joined = tokio::task::spawn_blocking(move || worker.join()).await;
        if !matches!(joined, Ok(Ok(()))) {
            error!("Controller worker panicked");
        }

        // in-flight work is abandoned
        let mut unanswered = 0u64;
        if let Some(item) = inbox.pop_nowait() {
            recorder.push_record(abandoned_record(&item));
            unanswered += 1;
        }
        let computed = std::iter::from_fn(|| reply_rx.try_recv().ok());
        for reply in held_back.into_iter().chain(computed) {
            debug!("Abandoning computed reply seq={}", reply.message.seq());
            recorder.push_record(unsent_record(&reply));
            unanswered += 1;
        }
        diagnostics.add(DiagnosticEvent::Unanswered, unanswered);
        recorder.shutdown();

        let report = ServiceReport {
            samples_received: received,
            replies_sent: sink.sent.load(Ordering::Relaxed),
            unanswered,
            diagnostics: diagnostics.snapshot(),
        };
        info!(
            "Controller service done: {} samples, {} replies, {} overwritten, {} unanswered",
            report.samples_received,
            report.replies_sent,
            report.diagnostics.overwritten_samples,
            report.unanswered
        );
        Ok(report)
    }
}

/// Parses one datagram and queues it for the worker. Returns whether it was
/// a sample.
fn on_datagram(
    bytes: &[u8],
    from: SocketAddr,
    inbox: &Mailbox<WorkItem>,
    clock: &SimClock,
    diagnostics: &Diagnostics,
) -> bool {
    let recv_timestamp = clock.now();
    let sample = match ControlMessage::parse(bytes) {
        Ok(m) => m,
        Err(ParseError::NoMessage) => return false,
        Err(ParseError::Malformed(e)) => {
            warn!("Could not unpack data from {from}: {e}");
            diagnostics.record(DiagnosticEvent::Malformed);
            return false;
        }
    };
    if sample.kind() != MessageKind::Sample {
        warn!("Ignoring message of unrecognized type {:?} from {from}", sample.kind());
        diagnostics.record(DiagnosticEvent::IgnoredKind);
        return false;
    }

    debug!("Got control request seq={} from {from}", sample.seq());
    let item = WorkItem {
        sample,
        from,
        recv_timestamp,
        recv_size: bytes.len(),
    };
    if let Some(stale) = inbox.put(item) {
        debug!("Controller is busy, discarding samples seq={}", stale.sample.seq());
        diagnostics.record(DiagnosticEvent::OverwrittenSample);
    }
    true
}

fn abandoned_record(item: &WorkItem) -> Record {
    Record::with_capacity(6)
        .field("seq", item.sample.seq() as f64)
        .field("recv_timestamp", item.recv_timestamp)
        .field("recv_size", item.recv_size as f64)
        .field("process_time", f64::NAN)
        .field("send_timestamp", f64::NAN)
        .field("send_size", f64::NAN)
}

/// A reply that was computed but never sent.
fn unsent_record(reply: &Reply) -> Record {
    Record::with_capacity(6)
        .field("seq", reply.message.seq() as f64)
        .field("recv_timestamp", reply.recv_timestamp)
        .field("recv_size", reply.recv_size as f64)
        .field("process_time", reply.process_time.as_secs_f64())
        .field("send_timestamp", f64::NAN)
        .field("send_size", f64::NAN)
}

/// Binds and serves on a fresh current-thread runtime, blocking the caller.
/// `on_bound` receives the listening address once the socket is open.
pub fn run_service_blocking<F>(
    config: ControllerServiceConfig,
    controller: Box<dyn Controller>,
    recorder: SharedRecorder,
    diagnostics: Diagnostics,
    running: Option<Arc<AtomicBool>>,
    on_bound: F,
) -> Result<ServiceReport>
where
    F: FnOnce(Result<SocketAddr>),
{
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async move {
        let mut service = match ControllerService::bind(config, recorder, diagnostics).await {
            Ok(s) => s,
            Err(e) => {
                on_bound(Err(EmulationError::Worker(format!("bind failed: {e}"))));
                return Err(e);
            }
        };
        if let Some(flag) = running {
            service.running = flag;
        }
        on_bound(service.local_addr());
        service.serve(controller).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageFactory, PropValue, PropertyMap};
    use crate::utils::recorder::MemoryRecorder;

    fn reply(seq_skip: usize, to: SocketAddr) -> Reply {
        let mut f = MessageFactory::new();
        for _ in 0..seq_skip {
            f.create_sample(PropertyMap::new());
        }
        let sample = f.create_sample(PropertyMap::new());
        Reply {
            to,
            message: sample.reply_to(PropertyMap::new()),
            recv_timestamp: 2.5,
            recv_size: 17,
            process_time: Duration::from_millis(3),
        }
    }

    async fn sink(recorder: SharedRecorder) -> Arc<ReplySink> {
        Arc::new(ReplySink {
            socket: Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap()),
            clock: SimClock::new(),
            recorder,
            diagnostics: Diagnostics::new(),
            sent: AtomicU64::new(0),
        })
    }

    #[test]
    fn overwritten_sample_is_counted() {
        let inbox = Mailbox::new();
        let clock = SimClock::new();
        let diag = Diagnostics::new();
        let mut f = MessageFactory::new();
        let from: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        for _ in 0..3 {
            let bytes = f.create_sample(PropertyMap::new()).serialize().unwrap();
            assert!(on_datagram(&bytes, from, &inbox, &clock, &diag));
        }
        assert_eq!(diag.snapshot().overwritten_samples, 2);
        assert_eq!(inbox.pop_nowait().unwrap().sample.seq(), 2);
    }

    #[test]
    fn garbage_and_wrong_kinds_are_ignored() {
        let inbox = Mailbox::new();
        let clock = SimClock::new();
        let diag = Diagnostics::new();
        let from: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        assert!(!on_datagram(&[0xc1, 0x00, 0x13], from, &inbox, &clock, &diag));
        assert!(!on_datagram(&[], from, &inbox, &clock, &diag));

        let sample = MessageFactory::new().create_sample(PropertyMap::new());
        let mut cmd = PropertyMap::new();
        cmd.insert("u".into(), PropValue::Float(1.0));
        let actuation = sample.reply_to(cmd).serialize().unwrap();
        assert!(!on_datagram(&actuation, from, &inbox, &clock, &diag));

        let s = diag.snapshot();
        assert_eq!(s.malformed, 1);
        assert_eq!(s.ignored_kinds, 1);
        assert!(inbox.is_empty());
    }

    #[test]
    fn abandoned_sample_keeps_its_receive_side() {
        let mut f = MessageFactory::new();
        f.create_sample(PropertyMap::new());
        let item = WorkItem {
            sample: f.create_sample(PropertyMap::new()),
            from: "127.0.0.1:5000".parse().unwrap(),
            recv_timestamp: 1.25,
            recv_size: 40,
        };
        let row = abandoned_record(&item);
        assert_eq!(row.get("seq"), Some(1.0));
        assert_eq!(row.get("recv_timestamp"), Some(1.25));
        assert_eq!(row.get("recv_size"), Some(40.0));
        assert!(row.get("process_time").unwrap().is_nan());
        assert!(row.get("send_timestamp").unwrap().is_nan());
        assert!(row.get("send_size").unwrap().is_nan());
    }

    #[test]
    fn unsent_reply_keeps_its_process_time() {
        let row = unsent_record(&reply(4, "127.0.0.1:5000".parse().unwrap()));
        assert_eq!(row.get("seq"), Some(4.0));
        assert_eq!(row.get("recv_size"), Some(17.0));
        assert!((row.get("process_time").unwrap() - 0.003).abs() < 1e-12);
        assert!(row.get("send_timestamp").unwrap().is_nan());
        assert!(row.get("send_size").unwrap().is_nan());
    }

    #[tokio::test]
    async fn delayed_replies_are_returned_when_abandoned() {
        let rec = Arc::new(MemoryRecorder::new());
        let sink = sink(rec.clone()).await;
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let to = peer.local_addr().unwrap();

        let mut delayed = DelayedReplies::default();
        delayed.schedule(&sink, reply(0, to), Duration::from_secs(30));
        delayed.schedule(&sink, reply(1, to), Duration::from_secs(30));
        assert_eq!(delayed.waiting(), 2);

        let left = delayed.abandon();
        let seqs: Vec<u64> = left.iter().map(|r| r.message.seq()).collect();
        assert_eq!(seqs, vec![0, 1]);
        assert_eq!(sink.sent.load(Ordering::Relaxed), 0);
        assert!(rec.is_empty());
    }

    #[tokio::test]
    async fn due_reply_leaves_the_table() {
        let rec = Arc::new(MemoryRecorder::new());
        let sink = sink(rec.clone()).await;
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();

        let mut delayed = DelayedReplies::default();
        delayed.schedule(&sink, reply(0, peer.local_addr().unwrap()), Duration::from_millis(5));
        for _ in 0..200 {
            if delayed.waiting() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(delayed.waiting(), 0);
        assert!(delayed.abandon().is_empty());
        assert_eq!(sink.sent.load(Ordering::Relaxed), 1);
        assert_eq!(rec.column("seq"), vec![0.0]);
    }
}
