// 设备模块 - 被控对象的地址表
// The bench PLC is the only device the console talks to

pub mod plc;

// 重新导出主要类型，方便外部使用
pub use plc::{AddressMap, Channel};
