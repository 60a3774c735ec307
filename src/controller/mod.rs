//! Controller side: user logic, the single-worker UDP service and the
//! dispatcher that starts services.

pub mod dispatcher;
pub mod logic;
pub mod service;
pub mod worker;

pub use dispatcher::{ControllerHandle, Dispatcher, LocalDispatcher, RemoteController};
pub use logic::{Controller, ControllerFactory};
pub use service::{ControllerService, ServiceReport, run_service_blocking};
pub use worker::{Reply, WorkItem, WorkerOptions};
