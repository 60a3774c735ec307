//! Starting controller services and learning where they listen.
//!
//! The plant only needs an address to talk to. [`RemoteController`] wraps a
//! service someone else already started; [`LocalDispatcher`] starts one on a
//! dedicated thread from a registry of controller classes.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::bounded;
use log::{error, info, warn};

use crate::config::ControllerServiceConfig;
use crate::controller::logic::{Controller, ControllerFactory};
use crate::controller::service::{ServiceReport, run_service_blocking};
use crate::error::{EmulationError, Result};
use crate::protocol::PropertyMap;
use crate::utils::diagnostics::Diagnostics;
use crate::utils::recorder::{CsvRecorder, NullRecorder, SharedRecorder};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

pub trait Dispatcher {
    /// Starts (or locates) a controller of `class`, configured from the
    /// plant's `params`, and returns where it listens.
    fn spawn_controller(&self, class: &str, params: &PropertyMap) -> Result<ControllerHandle>;

    fn controller_classes(&self) -> Vec<String>;
}

struct LocalService {
    running: Arc<AtomicBool>,
    thread: JoinHandle<Result<ServiceReport>>,
    diagnostics: Diagnostics,
}

/// A running controller service.
pub struct ControllerHandle {
    class: String,
    addr: SocketAddr,
    local: Option<LocalService>,
}

impl ControllerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn is_local(&self) -> bool {
        self.local.is_some()
    }

    /// Service-side counters, for services this process started.
    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        self.local.as_ref().map(|l| &l.diagnostics)
    }

    /// Stops an in-process service and waits for it. Remote services are
    /// left running and yield `None`.
    pub fn shutdown(mut self) -> Result<Option<ServiceReport>> {
        let Some(local) = self.local.take() else {
            return Ok(None);
        };
        local.running.store(false, Ordering::SeqCst);
        match local.thread.join() {
            Ok(report) => report.map(Some),
            Err(_) => Err(EmulationError::Worker("controller service thread panicked".into())),
        }
    }
}

impl Drop for ControllerHandle {
    fn drop(&mut self) {
        if let Some(local) = &self.local {
            local.running.store(false, Ordering::SeqCst);
        }
    }
}

/// A service at a known address.
#[derive(Debug, Clone, Copy)]
pub struct RemoteController {
    addr: SocketAddr,
}

impl RemoteController {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl Dispatcher for RemoteController {
    fn spawn_controller(&self, class: &str, _params: &PropertyMap) -> Result<ControllerHandle> {
        info!("Using remote controller `{class}` at {}", self.addr);
        Ok(ControllerHandle {
            class: class.to_owned(),
            addr: self.addr,
            local: None,
        })
    }

    fn controller_classes(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Starts controller services in this process.
pub struct LocalDispatcher {
    factories: BTreeMap<String, ControllerFactory>,
    config: ControllerServiceConfig,
}

impl LocalDispatcher {
    pub fn new(config: ControllerServiceConfig) -> Self {
        Self {
            factories: BTreeMap::new(),
            config,
        }
    }

    pub fn register(&mut self, class: impl Into<String>, factory: ControllerFactory) {
        let class = class.into();
        if self.factories.insert(class.clone(), factory).is_some() {
            warn!("Replacing already registered controller class `{class}`");
        }
    }

    /// Instantiates a registered controller without starting a service.
    pub fn build_controller(&self, class: &str, params: &PropertyMap) -> Result<Box<dyn Controller>> {
        let factory = self
            .factories
            .get(class)
            .ok_or_else(|| EmulationError::UnknownController(class.to_owned()))?;
        factory(params)
    }

    fn service_recorder(&self) -> Result<SharedRecorder> {
        match &self.config.output_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Ok(Arc::new(CsvRecorder::create(dir.join("service.csv"))?))
            }
            None => Ok(Arc::new(NullRecorder)),
        }
    }
}

impl Dispatcher for LocalDispatcher {
    fn spawn_controller(&self, class: &str, params: &PropertyMap) -> Result<ControllerHandle> {
        let controller = self.build_controller(class, params)?;

        let config = self.config.clone();
        let recorder = self.service_recorder()?;
        let diagnostics = Diagnostics::new();
        let running = Arc::new(AtomicBool::new(true));
        let (addr_tx, addr_rx) = bounded::<Result<SocketAddr>>(1);

        let thread = {
            let diagnostics = diagnostics.clone();
            let running = running.clone();
            thread::Builder::new()
                .name(format!("controller-{class}"))
                .spawn(move || {
                    let result = run_service_blocking(
                        config,
                        controller,
                        recorder,
                        diagnostics,
                        Some(running),
                        |bound| {
                            let _ = addr_tx.send(bound);
                        },
                    );
                    if let Err(e) = &result {
                        error!("Controller service ended with error: {e}");
                    }
                    result
                })?
        };

        let addr = match addr_rx.recv_timeout(STARTUP_TIMEOUT) {
            Ok(Ok(addr)) => addr,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                running.store(false, Ordering::SeqCst);
                return Err(EmulationError::Worker(format!(
                    "controller `{class}` did not report its address"
                )));
            }
        };
        info!("Spawned controller `{class}` at {addr}");

        Ok(ControllerHandle {
            class: class.to_owned(),
            addr,
            local: Some(LocalService {
                running,
                thread,
                diagnostics,
            }),
        })
    }

    fn controller_classes(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}
