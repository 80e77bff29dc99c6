// 数据持久化
//
// The store itself is opaque to the core: sessions and data points go through
// a worker thread and come back as StoreEvents.

pub mod recorder;
pub mod store;
pub mod worker;

pub use recorder::SessionRecorder;
pub use store::{MemoryStore, SessionStore};
pub use worker::PersistenceWorker;
