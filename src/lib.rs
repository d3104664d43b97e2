#![doc = include_str!("../README.md")]

pub mod processor;
pub mod record;
pub mod registry;
pub mod runner;
pub mod sink;
pub mod store;

#[doc(inline)]
pub use record::{OutboxRecord, OutboxUpdate};

#[doc(inline)]
pub use registry::{StaticCatalog, TypeRegistry, UnknownTypeError};

#[doc(inline)]
pub use store::OutboxStore;

#[doc(inline)]
pub use sink::{MessageSink, SinkError, SinkErrorKind};

#[doc(inline)]
pub use processor::{CycleError, Processor};

#[doc(inline)]
pub use runner::{DefaultRunnerHook, RunOutcome, RunReport, Runner, RunnerHook};
