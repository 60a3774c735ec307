pub mod clock;
pub mod diagnostics;
pub mod logging;
pub mod mailbox;
pub mod metrics;
pub mod recorder;

pub use clock::{SimClock, epoch_seconds};
pub use diagnostics::{DiagnosticEvent, Diagnostics, DiagnosticsSnapshot};
pub use logging::init_logging;
pub use mailbox::Mailbox;
pub use metrics::{RttWindow, Stats};
pub use recorder::{CsvRecorder, MemoryRecorder, NullRecorder, Record, Recorder, SharedRecorder};
