// Modbus TCP 客户端实现
// 提供与 PLC 的通信接口，支持读取和写入线圈、离散输入及保持寄存器

use crate::types::RegisterKind;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;

/// Modbus 通信错误类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusError {
    ConnectionFailed(String),
    NotConnected,
    Timeout,
    /// Socket level failure while a request was on the wire
    Transport(String),
    /// The PLC answered with a Modbus exception
    Exception(String),
    ProtocolError(String),
    InvalidData(String),
}

impl ModbusError {
    /// 是否意味着链路已断开
    pub fn is_link_error(&self) -> bool {
        matches!(
            self,
            ModbusError::NotConnected | ModbusError::Timeout | ModbusError::Transport(_)
        )
    }
}

impl std::fmt::Display for ModbusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModbusError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            ModbusError::NotConnected => write!(f, "Not connected"),
            ModbusError::Timeout => write!(f, "Operation timed out"),
            ModbusError::Transport(msg) => write!(f, "Transport error: {}", msg),
            ModbusError::Exception(msg) => write!(f, "Modbus exception: {}", msg),
            ModbusError::ProtocolError(msg) => write!(f, "Protocol error: {}", msg),
            ModbusError::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
        }
    }
}

impl std::error::Error for ModbusError {}

impl From<tokio_modbus::Error> for ModbusError {
    fn from(err: tokio_modbus::Error) -> Self {
        match err {
            tokio_modbus::Error::Transport(io) => ModbusError::Transport(io.to_string()),
            other => ModbusError::ProtocolError(other.to_string()),
        }
    }
}

/// 单连接 Modbus 传输层抽象
///
/// 所有总线访问都经过调度器，调度器保证同一时刻只有一个请求在途。
#[async_trait]
pub trait ModbusTransport: Send + Sync {
    /// 建立连接
    async fn connect(&self, addr: SocketAddr) -> Result<(), ModbusError>;

    /// 断开连接 (无连接时为空操作)
    async fn disconnect(&self);

    /// 检查连接是否已建立
    fn is_connected(&self) -> bool;

    /// 读取 `count` 个寄存器，位寄存器返回 0/1
    async fn read(&self, kind: RegisterKind, address: u16, count: u16) -> Result<Vec<u16>, ModbusError>;

    /// 写入单个寄存器，位寄存器按非零为真处理
    async fn write(&self, kind: RegisterKind, address: u16, value: u16) -> Result<(), ModbusError>;
}

/// Modbus TCP 客户端结构体
/// 基于 tokio-modbus 的异步客户端，带单请求超时与重试
pub struct TcpTransport {
    /// Modbus 单元标识符 (通常为 1)
    unit_id: u8,
    /// 单次请求超时时间
    timeout: Duration,
    /// 超时后的重试次数
    retries: u32,
    /// TCP 客户端连接，可选以支持延迟连接
    context: Mutex<Option<Context>>,
    connected: AtomicBool,
}

impl TcpTransport {
    /// 使用自定义配置创建客户端
    ///
    /// # 参数
    /// * `unit_id` - Modbus 单元标识符
    /// * `timeout` - 单次请求超时时间
    /// * `retries` - 超时后的重试次数
    pub fn new(unit_id: u8, timeout: Duration, retries: u32) -> Self {
        Self {
            unit_id,
            timeout,
            retries,
            context: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    fn flatten<T, E: std::fmt::Display>(
        result: Result<Result<T, E>, tokio_modbus::Error>,
    ) -> Result<T, ModbusError> {
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(exception)) => Err(ModbusError::Exception(exception.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    fn bits(values: Vec<bool>) -> Vec<u16> {
        values.into_iter().map(u16::from).collect()
    }

    async fn read_once(
        ctx: &mut Context,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        match kind {
            RegisterKind::Coil => Self::flatten(ctx.read_coils(address, count).await).map(Self::bits),
            RegisterKind::DiscreteInput => {
                Self::flatten(ctx.read_discrete_inputs(address, count).await).map(Self::bits)
            }
            RegisterKind::HoldingRegister => Self::flatten(ctx.read_holding_registers(address, count).await),
        }
    }

    async fn write_once(
        ctx: &mut Context,
        kind: RegisterKind,
        address: u16,
        value: u16,
    ) -> Result<(), ModbusError> {
        match kind {
            RegisterKind::Coil => Self::flatten(ctx.write_single_coil(address, value != 0).await),
            RegisterKind::HoldingRegister => Self::flatten(ctx.write_single_register(address, value).await),
            RegisterKind::DiscreteInput => Err(ModbusError::InvalidData(format!(
                "discrete input 0x{:04X} is read-only",
                address
            ))),
        }
    }

    fn note_failure(&self, err: &ModbusError) {
        if matches!(err, ModbusError::Transport(_)) {
            self.connected.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    async fn connect(&self, addr: SocketAddr) -> Result<(), ModbusError> {
        let ctx = tcp::connect_slave(addr, Slave(self.unit_id))
            .await
            .map_err(|e| ModbusError::ConnectionFailed(e.to_string()))?;
        *self.context.lock().await = Some(ctx);
        self.connected.store(true, Ordering::SeqCst);
        log::info!("Modbus TCP link to {} established (unit {})", addr, self.unit_id);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        // 丢弃 Context 即关闭套接字
        self.context.lock().await.take();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn read(&self, kind: RegisterKind, address: u16, count: u16) -> Result<Vec<u16>, ModbusError> {
        let mut guard = self.context.lock().await;
        let ctx = guard.as_mut().ok_or(ModbusError::NotConnected)?;

        for attempt in 0..=self.retries {
            match tokio::time::timeout(self.timeout, Self::read_once(ctx, kind, address, count)).await {
                Ok(result) => {
                    if let Err(err) = &result {
                        self.note_failure(err);
                    }
                    return result;
                }
                Err(_) => log::debug!("Read {} 0x{:04X} timed out (attempt {})", kind, address, attempt + 1),
            }
        }
        Err(ModbusError::Timeout)
    }

    async fn write(&self, kind: RegisterKind, address: u16, value: u16) -> Result<(), ModbusError> {
        let mut guard = self.context.lock().await;
        let ctx = guard.as_mut().ok_or(ModbusError::NotConnected)?;

        for attempt in 0..=self.retries {
            match tokio::time::timeout(self.timeout, Self::write_once(ctx, kind, address, value)).await {
                Ok(result) => {
                    if let Err(err) = &result {
                        self.note_failure(err);
                    }
                    return result;
                }
                Err(_) => log::debug!("Write {} 0x{:04X} timed out (attempt {})", kind, address, attempt + 1),
            }
        }
        Err(ModbusError::Timeout)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
