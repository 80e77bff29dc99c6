// 试验台控制台核心
// Modbus/TCP operator console core for a turbostarter test bench

pub mod bus;
pub mod config;
pub mod console;
pub mod control;
pub mod devices;
pub mod drivers;
pub mod error;
pub mod events;
pub mod monitoring;
pub mod storage;
pub mod supervisor;
pub mod types;

pub use config::ConsoleConfig;
pub use console::{Console, OperatorCommand};
pub use control::TestMode;
pub use events::EventBus;
