use async_trait::async_trait;

use crate::readings::RawReadings;

pub mod connection;
pub mod register;
pub mod sunspec;

pub use connection::ModbusReader;

pub type UnitId = tokio_modbus::prelude::SlaveId;
pub type Unit = tokio_modbus::prelude::Slave;

/// A source of raw SunSpec readings.
///
/// Implementations never retry; the poll loop decides what happens after a failure.
#[async_trait]
pub trait Reader: Send {
    /// Open the session. Does nothing when already connected.
    async fn connect(&mut self) -> crate::Result<()>;

    /// Read and decode every known SunSpec model.
    async fn read_all(&mut self) -> crate::Result<RawReadings>;

    /// Drop the session, if any.
    async fn close(&mut self);
}
