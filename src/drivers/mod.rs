// Communication drivers module
//
// The console talks to exactly one PLC over one Modbus/TCP connection. The
// transport trait is the only seam through which bytes reach the wire.

/// Modbus TCP communication driver
/// Async client over tokio-modbus plus the transport trait used by the bus
pub mod modbus;

/// Simulated PLC
/// Register memory with fault injection for tests and offline runs
pub mod mock;

pub use mock::{ConnectBehavior, MockTransport, WireOp};
pub use modbus::{ModbusError, ModbusTransport, TcpTransport};
