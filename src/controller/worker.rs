//! The single controller worker thread.
//!
//! It takes the newest sample from the work slot, runs the controller and
//! hands the finished reply back to the network loop. It never touches the
//! socket itself.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use thread_priority::{ThreadBuilderExt, ThreadPriority};
use tokio::sync::mpsc::UnboundedSender;

use crate::controller::logic::Controller;
use crate::error::Result;
use crate::protocol::ControlMessage;
use crate::utils::diagnostics::{DiagnosticEvent, Diagnostics};
use crate::utils::mailbox::Mailbox;

/// A sample waiting for the worker, with what the reply needs to know.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub sample: ControlMessage,
    pub from: SocketAddr,
    pub recv_timestamp: f64,
    pub recv_size: usize,
}

/// A computed actuation ready to be sent.
#[derive(Debug, Clone)]
pub struct Reply {
    pub to: SocketAddr,
    pub message: ControlMessage,
    pub recv_timestamp: f64,
    pub recv_size: usize,
    pub process_time: Duration,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerOptions {
    pub poll_timeout: Duration,
    pub realtime_priority: bool,
    pub pin_core: Option<usize>,
}

/// Starts the worker. It exits once `running` is cleared (checked at least
/// every `poll_timeout`) or the reply channel closes.
pub fn spawn_worker(
    mut controller: Box<dyn Controller>,
    inbox: Arc<Mailbox<WorkItem>>,
    replies: UnboundedSender<Reply>,
    running: Arc<AtomicBool>,
    diagnostics: Diagnostics,
    options: WorkerOptions,
) -> Result<JoinHandle<()>> {
    let mut body = move || {
        if let Some(core) = options.pin_core {
            pin_to_core(core);
        }
        debug!("[worker] started");

        while running.load(Ordering::SeqCst) {
            let Some(item) = inbox.pop(options.poll_timeout) else {
                continue;
            };
            let seq = item.sample.seq();
            let start = Instant::now();
            let commands = match controller.process(item.sample.payload()) {
                Ok(c) => c,
                Err(e) => {
                    error!("Error encountered while processing samples seq={seq}: {e}");
                    diagnostics.record(DiagnosticEvent::ControllerFailure);
                    continue;
                }
            };
            let reply = Reply {
                to: item.from,
                message: item.sample.reply_to(commands),
                recv_timestamp: item.recv_timestamp,
                recv_size: item.recv_size,
                process_time: start.elapsed(),
            };
            if replies.send(reply).is_err() {
                debug!("[worker] reply channel closed");
                break;
            }
        }
        debug!("[worker] exiting");
    };

    let builder = thread::Builder::new().name("controller-worker".into());
    let handle = if options.realtime_priority {
        builder.spawn_with_priority(ThreadPriority::Max, move |prio| {
            if let Err(e) = prio {
                warn!("Could not raise controller worker priority: {e:?}");
            }
            body()
        })?
    } else {
        builder.spawn(body)?
    };
    Ok(handle)
}

fn pin_to_core(core: usize) {
    let core_ids = core_affinity::get_core_ids().unwrap_or_default();
    match core_ids.get(core) {
        Some(id) if core_affinity::set_for_current(*id) => {
            info!("Controller worker pinned to core {core}");
        }
        Some(_) => error!("Failed to pin controller worker to core {core}"),
        None => error!("Core {core} not found among available system cores"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EmulationError;
    use crate::protocol::{MessageFactory, MessageKind, PropValue, PropertyMap};
    use tokio::sync::mpsc::unbounded_channel;

    fn item(factory: &mut MessageFactory, x: f64) -> WorkItem {
        let mut p = PropertyMap::new();
        p.insert("x".into(), PropValue::Float(x));
        WorkItem {
            sample: factory.create_sample(p),
            from: "127.0.0.1:4000".parse().unwrap(),
            recv_timestamp: 0.0,
            recv_size: 10,
        }
    }

    fn options() -> WorkerOptions {
        WorkerOptions {
            poll_timeout: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[test]
    fn worker_replies_with_matching_seq() {
        let inbox = Arc::new(Mailbox::new());
        let running = Arc::new(AtomicBool::new(true));
        let (tx, mut rx) = unbounded_channel();
        let negate = |s: &PropertyMap| -> Result<PropertyMap> {
            let mut out = PropertyMap::new();
            out.insert("u".into(), PropValue::Float(-s["x"].as_f64()));
            Ok(out)
        };
        let handle = spawn_worker(
            Box::new(negate),
            inbox.clone(),
            tx,
            running.clone(),
            Diagnostics::new(),
            options(),
        )
        .unwrap();

        let mut f = MessageFactory::new();
        f.create_sample(PropertyMap::new());
        inbox.put(item(&mut f, 2.0));

        let reply = rx.blocking_recv().unwrap();
        assert_eq!(reply.message.kind(), MessageKind::Actuation);
        assert_eq!(reply.message.seq(), 1);
        assert_eq!(reply.message.payload()["u"], PropValue::Float(-2.0));

        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn failures_are_counted_without_reply() {
        let inbox = Arc::new(Mailbox::new());
        let running = Arc::new(AtomicBool::new(true));
        let diag = Diagnostics::new();
        let (tx, mut rx) = unbounded_channel();
        let broken = |_: &PropertyMap| -> Result<PropertyMap> {
            Err(EmulationError::Controller("diverged".into()))
        };
        let handle = spawn_worker(Box::new(broken), inbox.clone(), tx, running.clone(), diag.clone(), options())
            .unwrap();

        inbox.put(item(&mut MessageFactory::new(), 1.0));
        let deadline = Instant::now() + Duration::from_secs(5);
        while diag.snapshot().controller_failures == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();
        assert_eq!(diag.snapshot().controller_failures, 1);
        assert!(rx.try_recv().is_err());
    }
}
