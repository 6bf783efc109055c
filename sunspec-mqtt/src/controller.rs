use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::Config;
use crate::modbus::Reader;
use crate::mqtt::Publisher;
use crate::readings::RawReadings;
use crate::{dump, mapper, Error};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Nothing attempted yet
    Idle,
    /// The last cycle succeeded
    Polling,
    /// The last cycle failed; the next one waits `error_sleep` first
    ErrorBackoff,
}

/// The part of a cycle that failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    ConnectReader,
    ConnectPublisher,
    Read,
    Map,
    Publish,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::ConnectReader => "connect to device",
            Step::ConnectPublisher => "connect to broker",
            Step::Read => "read",
            Step::Map => "map",
            Step::Publish => "publish",
        })
    }
}

/// Drives read → map → publish cycles, one at a time, with a fixed pause after each.
pub struct Controller<R, P> {
    config: Config,
    reader: R,
    publisher: P,
    state: State,
}

impl<R: Reader, P: Publisher> Controller<R, P> {
    pub fn new(config: Config, reader: R, publisher: P) -> Self {
        Controller {
            config,
            reader,
            publisher,
            state: State::Idle,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    async fn cycle(&mut self) -> Result<usize, (Step, Error)> {
        self.reader
            .connect()
            .await
            .map_err(|e| (Step::ConnectReader, e))?;
        self.publisher
            .connect()
            .await
            .map_err(|e| (Step::ConnectPublisher, e))?;

        let raw = self.reader.read_all().await.map_err(|e| (Step::Read, e))?;
        let readings = mapper::map(&raw).map_err(|e| (Step::Map, e))?;
        self.publisher
            .publish(&readings)
            .await
            .map_err(|e| (Step::Publish, e))?;

        Ok(readings.len())
    }

    /// Run a single cycle and return how long to pause before the next one.
    ///
    /// A failure closes the session of the component that failed, so the next cycle reconnects it.
    pub async fn tick(&mut self) -> Duration {
        match self.cycle().await {
            Ok(published) => {
                debug!(published, "Cycle complete");
                self.state = State::Polling;
                self.config.sleep
            }
            Err((step, err)) => {
                error!(%step, cause = %err, "Cycle failed");
                match step {
                    Step::ConnectReader | Step::Read | Step::Map => self.reader.close().await,
                    Step::ConnectPublisher | Step::Publish => self.publisher.close().await,
                }
                self.state = State::ErrorBackoff;
                self.config.error_sleep
            }
        }
    }

    async fn poll_forever(&mut self) {
        loop {
            let pause = self.tick().await;
            debug!(?pause, state = ?self.state, "Sleeping");
            tokio::time::sleep(pause).await;
        }
    }

    /// Poll until `shutdown` completes, then release both sessions.
    pub async fn run(mut self, shutdown: impl Future) -> crate::Result<()> {
        info!(
            device = %self.config.ip_addr,
            device_port = self.config.ip_port,
            broker = %self.config.mqtt_host,
            broker_port = self.config.mqtt_port,
            "Starting up"
        );

        tokio::select! {
            _ = self.poll_forever() => {}
            _ = shutdown => {
                info!("shutting down");
            }
        }

        self.reader.close().await;
        self.publisher.close().await;
        info!("Stopped");
        Ok(())
    }

    async fn read_once(&mut self) -> crate::Result<RawReadings> {
        self.reader.connect().await?;
        self.reader.read_all().await
    }

    /// Read the device once and write the raw readings to the dump path.
    ///
    /// The publisher is never used.
    pub async fn dump(mut self) -> crate::Result<PathBuf> {
        let result = self.read_once().await;
        self.reader.close().await;

        dump::write_json(&self.config.dump_path, &result?).await?;
        Ok(self.config.dump_path)
    }
}
