pub mod config;
pub mod controller;
pub mod dump;
pub mod mapper;
pub mod modbus;
pub mod mqtt;
pub mod readings;
pub mod shutdown;

mod error;
pub use controller::Controller;
pub use error::Error;
pub use modbus::ModbusReader;
pub use mqtt::MqttPublisher;

pub type Result<T> = std::result::Result<T, Error>;
