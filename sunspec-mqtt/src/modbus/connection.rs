use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::{net::lookup_host, time::timeout};
use tokio_modbus::client::{tcp, Context as ModbusClient, Reader as _};
use tokio_modbus::prelude::Slave;
use tracing::{debug, info};

use super::sunspec::{self, RegisterSource};
use super::{Reader, Unit};
use crate::config::Config;
use crate::readings::RawReadings;
use crate::Error;

/// Modbus TCP session to a single SunSpec device.
pub struct ModbusReader {
    host: String,
    port: u16,
    unit: Unit,
    timeout: Duration,
    connection: Option<Connection>,
}

struct Connection {
    client: ModbusClient,
    timeout: Duration,
}

fn timed_out(what: &str) -> Error {
    Error::DeviceUnreachable(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{} timed out", what),
    ))
}

impl ModbusReader {
    pub fn new(config: &Config) -> Self {
        ModbusReader {
            host: config.ip_addr.clone(),
            port: config.ip_port,
            unit: Slave(config.unit_id),
            timeout: config.timeout,
            connection: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}

async fn open(host: String, port: u16, unit: Unit) -> io::Result<ModbusClient> {
    let address = lookup_host((host.as_str(), port))
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} did not resolve to an address", host),
            )
        })?;
    debug!(%address, "Connecting to SunSpec device");
    tcp::connect_slave(address, unit).await
}

#[async_trait]
impl Reader for ModbusReader {
    #[tracing::instrument(level = "debug", skip(self), fields(host = %self.host, port = self.port))]
    async fn connect(&mut self) -> crate::Result<()> {
        if self.connection.is_some() {
            return Ok(());
        }

        let client = timeout(self.timeout, open(self.host.clone(), self.port, self.unit))
            .await
            .map_err(|_| timed_out("connect"))?
            .map_err(Error::DeviceUnreachable)?;

        info!(host = %self.host, port = self.port, "Connected to SunSpec device");
        self.connection = Some(Connection {
            client,
            timeout: self.timeout,
        });
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self), fields(host = %self.host))]
    async fn read_all(&mut self) -> crate::Result<RawReadings> {
        let connection = self.connection.as_mut().ok_or_else(|| {
            Error::DeviceUnreachable(io::Error::new(
                io::ErrorKind::NotConnected,
                "not connected to the SunSpec device",
            ))
        })?;
        let readings = sunspec::scan(connection).await?;
        debug!(count = readings.len(), "Read SunSpec registers");
        Ok(readings)
    }

    async fn close(&mut self) {
        if self.connection.take().is_some() {
            debug!(host = %self.host, "Closed SunSpec device connection");
        }
    }
}

#[async_trait]
impl RegisterSource for Connection {
    async fn read_holding(&mut self, address: u16, count: u16) -> io::Result<Vec<u16>> {
        match timeout(
            self.timeout,
            self.client.read_holding_registers(address, count),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("reading {} registers at {} timed out", count, address),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::sunspec::tests::{ac_body, Registers};
    use crate::readings::Readings;
    use pretty_assertions::assert_eq;
    use rust_decimal::Decimal;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A Modbus TCP server for `registers`. Reads touching an unset register get exception 0x02 (illegal data
    /// address).
    async fn serve(registers: Registers) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut header = [0u8; 7];
            while socket.read_exact(&mut header).await.is_ok() {
                let len = usize::from(u16::from_be_bytes([header[4], header[5]])) - 1;
                let mut request = vec![0; len];
                socket.read_exact(&mut request).await.unwrap();

                let address = u16::from_be_bytes([request[1], request[2]]);
                let count = u16::from_be_bytes([request[3], request[4]]);
                let words: Option<Vec<u16>> = (address..address + count)
                    .map(|a| registers.words.get(&a).copied())
                    .collect();
                let response = match words {
                    Some(words) => {
                        let mut response = vec![0x03, (words.len() * 2) as u8];
                        for word in words {
                            response.extend(word.to_be_bytes());
                        }
                        response
                    }
                    None => vec![0x83, 0x02],
                };

                let mut frame = header[..4].to_vec();
                frame.extend((response.len() as u16 + 1).to_be_bytes());
                frame.push(header[6]);
                frame.extend(response);
                socket.write_all(&frame).await.unwrap();
            }
        });

        port
    }

    fn config(port: u16) -> Config {
        let mut config = crate::config::tests::minimal();
        config.ip_addr = "127.0.0.1".to_owned();
        config.ip_port = port;
        config.timeout = Duration::from_millis(200);
        config
    }

    #[tokio::test]
    async fn read_all_requires_a_connection() {
        let mut reader = ModbusReader::new(&config(1));
        assert!(matches!(
            reader.read_all().await,
            Err(Error::DeviceUnreachable(_))
        ));
    }

    #[tokio::test]
    async fn connect_is_idempotent_and_close_releases() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            // A second connect would block here forever.
            let second = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
            (socket, second.is_err())
        });

        let mut reader = ModbusReader::new(&config(port));
        reader.connect().await.unwrap();
        reader.connect().await.unwrap();
        assert!(reader.is_connected());

        let (_socket, single_connection) = accept.await.unwrap();
        assert!(single_connection);

        reader.close().await;
        assert!(!reader.is_connected());
    }

    #[tokio::test]
    async fn unresponsive_device_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept the connection but never answer.
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let mut reader = ModbusReader::new(&config(port));
        reader.connect().await.unwrap();
        assert!(matches!(
            reader.read_all().await,
            Err(Error::DeviceUnreachable(ref e)) if e.kind() == io::ErrorKind::TimedOut
        ));
    }

    #[tokio::test]
    async fn refused_connection_is_device_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut reader = ModbusReader::new(&config(port));
        assert!(matches!(
            reader.connect().await,
            Err(Error::DeviceUnreachable(_))
        ));
        assert!(!reader.is_connected());
    }

    #[tokio::test]
    async fn reads_models_over_modbus_tcp() {
        // Nothing at 40000 or 0, so the first two marker reads get exceptions.
        let port = serve(Registers::device(50000, &[(701, ac_body())])).await;

        let mut reader = ModbusReader::new(&config(port));
        reader.connect().await.unwrap();
        let raw = reader.read_all().await.unwrap();
        assert_eq!(raw["701/W"].value, Decimal::from(1500));
        assert_eq!(raw["701/Hz_SF"].value, Decimal::from(-2));

        let expected: Readings = [
            ("DERMeasureAC/Hz".to_owned(), Decimal::new(5002, 2)),
            ("DERMeasureAC/St".to_owned(), Decimal::from(1)),
            ("DERMeasureAC/W".to_owned(), Decimal::from(1500)),
        ]
        .into_iter()
        .collect();
        assert_eq!(crate::mapper::map(&raw).unwrap(), expected);

        // The session stays usable for the next cycle.
        assert_eq!(reader.read_all().await.unwrap(), raw);
    }
}
