pub mod backend;
pub mod call;
pub mod error;
pub mod local;
pub mod upstream;

pub mod mock;

pub use backend::{Backend, BackendConnection, Dispatcher};
pub use call::{call_channel, BackendEvent, CallContext, CallControl, CallEvents, CallHandle, EventSink, SinkClosed};
pub use error::BackendError;
pub use local::{EchoHandler, Handler, LocalBackend};
pub use mock::{MockBackend, MockStep, RecordedInput};
pub use upstream::{UpstreamBackend, UpstreamConfig};
