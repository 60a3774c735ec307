//! Plant side of the control channel.
//!
//! Samples go out over UDP tagged with a sequence number; the pending-reply
//! table remembers when each one left so that a matching actuation yields a
//! round-trip time. The newest actuation waits in a [`Mailbox`] until the next
//! tick picks it up.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::error::{EmulationError, Result};
use crate::protocol::{ControlMessage, MAX_DATAGRAM, MessageFactory, MessageKind, ParseError, PropertyMap};
use crate::utils::clock::SimClock;
use crate::utils::diagnostics::{DiagnosticEvent, Diagnostics};
use crate::utils::mailbox::Mailbox;
use crate::utils::metrics::{RttWindow, Stats};
use crate::utils::recorder::{NullRecorder, Record, SharedRecorder};

/// How the plant talks to its controller.
pub trait ControllerInterface: Send {
    /// Sends one set of samples. Fails with `NotReady` before the transport
    /// is bound.
    fn put_sensor_values(&mut self, values: PropertyMap) -> Result<()>;

    /// Newest actuation received since the last call, or an empty map.
    fn get_actuator_values(&mut self) -> PropertyMap;

    /// Samples handed to `put_sensor_values` so far.
    fn samples_sent(&self) -> u64;

    /// Replies matched to a pending sample so far.
    fn replies(&self) -> u64 {
        0
    }

    fn rtt_stats(&self) -> Option<Stats> {
        None
    }

    /// Stops receiving and flushes samples that never got a reply.
    fn shutdown(&mut self) {}
}

#[derive(Debug, Clone, Copy)]
struct PendingReply {
    sent_timestamp: f64,
    sent_size: usize,
    sent_at: Instant,
}

#[derive(Debug, Default)]
struct TrackerInner {
    pending: HashMap<u64, PendingReply>,
    rtts: RttWindow,
}

/// Pending-reply table plus RTT bookkeeping.
pub struct ReplyTracker {
    inner: Mutex<TrackerInner>,
    clock: SimClock,
    recorder: SharedRecorder,
    diagnostics: Diagnostics,
}

impl ReplyTracker {
    pub fn new(clock: SimClock, recorder: SharedRecorder, diagnostics: Diagnostics) -> Self {
        Self {
            inner: Mutex::new(TrackerInner::default()),
            clock,
            recorder,
            diagnostics,
        }
    }

    pub fn register(&self, seq: u64, sent_timestamp: f64, sent_size: usize, sent_at: Instant) {
        self.inner.lock().pending.insert(
            seq,
            PendingReply {
                sent_timestamp,
                sent_size,
                sent_at,
            },
        );
    }

    /// Matches a reply against the table and returns its RTT in seconds.
    /// Replies for unknown (or already answered) sequence numbers return
    /// `None`.
    pub fn resolve(&self, seq: u64, recv_size: usize, recv_at: Instant) -> Option<f64> {
        let (entry, rtt) = {
            let mut inner = self.inner.lock();
            let entry = inner.pending.remove(&seq)?;
            let rtt = recv_at.saturating_duration_since(entry.sent_at).as_secs_f64();
            inner.rtts.push(rtt);
            (entry, rtt)
        };
        self.recorder.push_record(client_record(
            seq,
            &entry,
            self.clock.at(recv_at),
            recv_size as f64,
            rtt,
        ));
        Some(rtt)
    }

    /// Records every still-pending entry as unanswered and empties the table.
    pub fn flush(&self) -> usize {
        let mut drained: Vec<(u64, PendingReply)> = self.inner.lock().pending.drain().collect();
        drained.sort_by_key(|(seq, _)| *seq);
        for (seq, entry) in &drained {
            self.recorder
                .push_record(client_record(*seq, entry, f64::NAN, f64::NAN, f64::INFINITY));
        }
        self.diagnostics
            .add(DiagnosticEvent::Unanswered, drained.len() as u64);
        drained.len()
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn stats(&self) -> Option<Stats> {
        self.inner.lock().rtts.stats()
    }

    pub fn replies(&self) -> u64 {
        self.inner.lock().rtts.total()
    }
}

fn client_record(seq: u64, entry: &PendingReply, recv_ts: f64, recv_size: f64, rtt: f64) -> Record {
    Record::with_capacity(6)
        .field("seq", seq as f64)
        .field("send_timestamp", entry.sent_timestamp)
        .field("send_size", entry.sent_size as f64)
        .field("recv_timestamp", recv_ts)
        .field("recv_size", recv_size)
        .field("rtt", rtt)
}

/// UDP client for a remote controller service.
///
/// Starts `NotReady`; [`bind`](Self::bind) opens the socket and starts the
/// receive task on the current tokio runtime.
pub struct UdpControllerInterface {
    controller: SocketAddr,
    factory: MessageFactory,
    socket: Option<Arc<UdpSocket>>,
    tracker: Arc<ReplyTracker>,
    mailbox: Arc<Mailbox<PropertyMap>>,
    diagnostics: Diagnostics,
    recv_task: Option<JoinHandle<()>>,
}

impl UdpControllerInterface {
    pub fn new(controller: SocketAddr, recorder: SharedRecorder, diagnostics: Diagnostics) -> Self {
        let clock = SimClock::new();
        Self {
            controller,
            factory: MessageFactory::with_clock(clock),
            socket: None,
            tracker: Arc::new(ReplyTracker::new(clock, recorder, diagnostics.clone())),
            mailbox: Arc::new(Mailbox::new()),
            diagnostics,
            recv_task: None,
        }
    }

    pub fn without_recording(controller: SocketAddr) -> Self {
        Self::new(controller, Arc::new(NullRecorder), Diagnostics::new())
    }

    pub fn is_ready(&self) -> bool {
        self.socket.is_some()
    }

    pub fn controller_addr(&self) -> SocketAddr {
        self.controller
    }

    pub fn tracker(&self) -> &ReplyTracker {
        &self.tracker
    }

    /// Binds the local socket and spawns the receive task. Must be called
    /// from inside a tokio runtime.
    pub async fn bind(&mut self, local: SocketAddr) -> Result<SocketAddr> {
        let socket = Arc::new(UdpSocket::bind(local).await?);
        // try_send_to reports WouldBlock until the reactor has seen the socket writable
        socket.writable().await?;
        let bound = socket.local_addr()?;
        info!("Plant endpoint bound to {bound}, controller at {}", self.controller);

        self.recv_task = Some(tokio::spawn(receive_loop(
            socket.clone(),
            self.tracker.clone(),
            self.mailbox.clone(),
            self.diagnostics.clone(),
        )));
        self.socket = Some(socket);
        Ok(bound)
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    tracker: Arc<ReplyTracker>,
    mailbox: Arc<Mailbox<PropertyMap>>,
    diagnostics: Diagnostics,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                // ICMP port-unreachable surfaces here on some platforms
                debug!("recv_from failed: {e}");
                continue;
            }
        };
        let recv_at = Instant::now();

        let msg = match ControlMessage::parse(&buf[..len]) {
            Ok(m) => m,
            Err(ParseError::NoMessage) => continue,
            Err(ParseError::Malformed(e)) => {
                warn!("Dropping malformed datagram from {from}: {e}");
                diagnostics.record(DiagnosticEvent::Malformed);
                continue;
            }
        };

        if msg.kind() != MessageKind::Actuation {
            warn!("Ignoring {:?} message from {from}", msg.kind());
            diagnostics.record(DiagnosticEvent::IgnoredKind);
            continue;
        }

        let seq = msg.seq();
        match tracker.resolve(seq, len, recv_at) {
            Some(rtt) => {
                debug!("Reply seq={seq} rtt={:.3} ms", rtt * 1e3);
                mailbox.put(msg.into_payload());
            }
            None => {
                warn!("Unprompted reply seq={seq} from {from}, discarding");
                diagnostics.record(DiagnosticEvent::UnpromptedReply);
            }
        }
    }
}

impl ControllerInterface for UdpControllerInterface {
    fn put_sensor_values(&mut self, values: PropertyMap) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(EmulationError::NotReady)?;
        let msg = self.factory.create_sample(values);
        let bytes = msg.serialize()?;

        // registered before sending so a fast reply always finds its entry
        self.tracker
            .register(msg.seq(), msg.timestamp(), bytes.len(), Instant::now());

        match socket.try_send_to(&bytes, self.controller) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                warn!("Send buffer full, dropping sample seq={}", msg.seq());
                self.diagnostics.record(DiagnosticEvent::DroppedSend);
            }
            Err(e) => {
                warn!("Failed to send sample seq={}: {e}", msg.seq());
                self.diagnostics.record(DiagnosticEvent::DroppedSend);
            }
        }
        Ok(())
    }

    fn get_actuator_values(&mut self) -> PropertyMap {
        self.mailbox.pop_nowait().unwrap_or_default()
    }

    fn samples_sent(&self) -> u64 {
        self.factory.message_count()
    }

    fn replies(&self) -> u64 {
        self.tracker.replies()
    }

    fn rtt_stats(&self) -> Option<Stats> {
        self.tracker.stats()
    }

    fn shutdown(&mut self) {
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
        let unanswered = self.tracker.flush();
        if unanswered > 0 {
            info!("{unanswered} samples never received a reply");
        }
    }
}

impl Drop for UdpControllerInterface {
    fn drop(&mut self) {
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
    }
}

/// Open-loop stand-in: swallows samples and never actuates.
#[derive(Debug, Default)]
pub struct DummyControllerInterface {
    sent: u64,
}

impl DummyControllerInterface {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ControllerInterface for DummyControllerInterface {
    fn put_sensor_values(&mut self, _values: PropertyMap) -> Result<()> {
        self.sent += 1;
        Ok(())
    }

    fn get_actuator_values(&mut self) -> PropertyMap {
        PropertyMap::new()
    }

    fn samples_sent(&self) -> u64 {
        self.sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PropValue;
    use crate::utils::recorder::MemoryRecorder;
    use std::time::Duration;

    fn tracker() -> (ReplyTracker, Arc<MemoryRecorder>, Diagnostics) {
        let rec = Arc::new(MemoryRecorder::new());
        let diag = Diagnostics::new();
        (
            ReplyTracker::new(SimClock::new(), rec.clone(), diag.clone()),
            rec,
            diag,
        )
    }

    #[test]
    fn reply_resolves_once() {
        let (t, rec, _) = tracker();
        let sent = Instant::now();
        t.register(3, 100.0, 40, sent);
        let rtt = t.resolve(3, 20, sent + Duration::from_millis(4)).unwrap();
        assert!((rtt - 0.004).abs() < 1e-9);
        assert!(t.resolve(3, 20, Instant::now()).is_none());
        assert_eq!(rec.column("seq"), vec![3.0]);
        assert_eq!(rec.column("recv_size"), vec![20.0]);
        assert_eq!(t.replies(), 1);
    }

    #[test]
    fn flush_marks_pending_as_unanswered() {
        let (t, rec, diag) = tracker();
        let now = Instant::now();
        t.register(1, 1.0, 10, now);
        t.register(0, 0.5, 10, now);
        assert_eq!(t.flush(), 2);
        assert_eq!(t.pending(), 0);
        assert_eq!(rec.column("seq"), vec![0.0, 1.0]);
        assert!(rec.column("rtt").iter().all(|r| r.is_infinite()));
        assert_eq!(diag.snapshot().unanswered, 2);
    }

    #[test]
    fn put_before_bind_is_not_ready() {
        let mut iface = UdpControllerInterface::without_recording("127.0.0.1:9".parse().unwrap());
        assert!(!iface.is_ready());
        assert!(matches!(
            iface.put_sensor_values(PropertyMap::new()),
            Err(EmulationError::NotReady)
        ));
        assert!(iface.get_actuator_values().is_empty());
    }

    #[tokio::test]
    async fn first_send_after_bind_goes_out() {
        let controller = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        controller
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let diag = Diagnostics::new();
        let mut iface = UdpControllerInterface::new(
            controller.local_addr().unwrap(),
            Arc::new(NullRecorder),
            diag.clone(),
        );
        iface.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(iface.is_ready());

        iface.put_sensor_values(PropertyMap::new()).unwrap();
        assert_eq!(diag.snapshot().dropped_sends, 0);
        assert_eq!(iface.tracker().pending(), 1);

        let mut buf = [0u8; 2048];
        let (len, _) = controller.recv_from(&mut buf).unwrap();
        assert_eq!(ControlMessage::parse(&buf[..len]).unwrap().seq(), 0);
        iface.shutdown();
    }

    fn echo_once(socket: &std::net::UdpSocket, times: usize) {
        let mut buf = [0u8; 2048];
        let (len, from) = socket.recv_from(&mut buf).unwrap();
        let sample = ControlMessage::parse(&buf[..len]).unwrap();
        let mut cmd = PropertyMap::new();
        cmd.insert("force".into(), PropValue::Float(1.0));
        let reply = sample.reply_to(cmd).serialize().unwrap();
        for _ in 0..times {
            socket.send_to(&reply, from).unwrap();
        }
    }

    #[tokio::test]
    async fn round_trip_fills_the_mailbox() {
        let controller = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        controller
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let diag = Diagnostics::new();
        let mut iface = UdpControllerInterface::new(
            controller.local_addr().unwrap(),
            Arc::new(NullRecorder),
            diag.clone(),
        );
        iface.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let mut values = PropertyMap::new();
        values.insert("position".into(), PropValue::Float(0.1));
        iface.put_sensor_values(values).unwrap();
        // duplicate reply: the second copy must be discarded
        echo_once(&controller, 2);

        let mut cmd = PropertyMap::new();
        for _ in 0..200 {
            cmd = iface.get_actuator_values();
            if !cmd.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cmd["force"], PropValue::Float(1.0));

        for _ in 0..200 {
            if diag.snapshot().unprompted_replies == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(diag.snapshot().unprompted_replies, 1);
        assert!(iface.rtt_stats().is_some());

        iface.shutdown();
        assert_eq!(diag.snapshot().unanswered, 0);
    }
}
