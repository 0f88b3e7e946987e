// Module naming follows project convention (Core = primitives, Ring = event ring and its handles)
#[allow(non_snake_case)]
pub mod Core;
#[allow(non_snake_case)]
pub mod Ring;
#[allow(non_snake_case)]
pub mod Debug {
    pub mod StructDebug;
}

pub mod config;
pub mod error;
pub mod metrics;
pub mod sink;

pub use config::EmitterConfig;
pub use error::{ConfigError, EmitError, SinkError};
pub use metrics::{EmitterCollector, MetricsSnapshot};
pub use sink::{MemorySink, Sink, WriterSink};
pub use Ring::Structs::{Event, EventKind, Field, FieldValue};
pub use Ring::{EmitOutcome, EmitterBuilder, EventEmitter, FlushReport, FlusherHandle};
