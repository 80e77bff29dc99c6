// Modbus 总线访问层
//
// Every wire operation goes through queue -> dispatcher -> transport. Nothing
// else in the crate is allowed to call the transport for reads or writes.

pub mod dispatcher;
pub mod polling;
pub mod queue;
pub mod verify;

pub use dispatcher::Dispatcher;
pub use polling::PollingScheduler;
pub use queue::RequestQueue;
pub use verify::{VerificationRecord, WriteVerifier};
