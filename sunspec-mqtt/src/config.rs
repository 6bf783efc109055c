use std::{path::Path, path::PathBuf, str::FromStr, time::Duration};

use clap::Args;
use humantime_serde::re::humantime;
use serde::Deserialize;

use crate::modbus::UnitId;
use crate::Error;

pub const DEFAULT_IP_PORT: u16 = 502;
pub const DEFAULT_UNIT_ID: UnitId = 1;
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_CLIENT_ID: &str = "FranklinWH";
pub const DEFAULT_TOPIC_PREFIX: &str = "FranklinWH/AGate";
pub const DEFAULT_SLEEP: Duration = Duration::from_secs(30);
pub const DEFAULT_ERROR_SLEEP: Duration = Duration::from_secs(60);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DUMP_PATH: &str = "./data/agate_dump.json";

/// Everything the agent needs, fixed for the lifetime of the process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub ip_addr: String,
    pub ip_port: u16,
    pub unit_id: UnitId,

    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: Option<String>,
    pub mqtt_pass: Option<String>,
    pub client_id: String,
    pub topic_prefix: String,

    /// Pause after a successful cycle
    pub sleep: Duration,
    /// Pause after a failed cycle
    pub error_sleep: Duration,
    /// Upper bound for any single network exchange
    pub timeout: Duration,

    pub dump_json: bool,
    pub dump_path: PathBuf,
}

impl Config {
    /// MQTT keep-alive long enough that the broker keeps the session across the longest pause between two cycles.
    pub fn keep_alive(&self) -> Duration {
        let longest = self.sleep.max(self.error_sleep).as_secs();
        let secs = longest
            .saturating_mul(2)
            .saturating_add(self.timeout.as_secs())
            .clamp(5, u64::from(u16::MAX));
        Duration::from_secs(secs)
    }
}

/// A duration given either as whole seconds (`30`) or in humantime notation (`"30s"`, `"1m 30s"`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(from = "IntervalRepr")]
pub struct Interval(pub Duration);

#[derive(Deserialize)]
#[serde(untagged)]
enum IntervalRepr {
    Seconds(u64),
    Human(#[serde(with = "humantime_serde")] Duration),
}

impl From<IntervalRepr> for Interval {
    fn from(repr: IntervalRepr) -> Self {
        match repr {
            IntervalRepr::Seconds(secs) => Interval(Duration::from_secs(secs)),
            IntervalRepr::Human(duration) => Interval(duration),
        }
    }
}

impl FromStr for Interval {
    type Err = humantime::DurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<u64>() {
            Ok(secs) => Ok(Interval(Duration::from_secs(secs))),
            Err(_) => humantime::parse_duration(s).map(Interval),
        }
    }
}

/// Settings as given on the command line or in a configuration file. Every field is optional here; defaults and
/// required fields are resolved by [`Settings::into_config`].
#[derive(Args, Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// IP address (or host name) of the SunSpec device
    #[arg(long)]
    pub ip_addr: Option<String>,

    /// TCP port of the SunSpec device [default: 502]
    #[arg(long)]
    pub ip_port: Option<u16>,

    /// Modbus unit id of the SunSpec device [default: 1]
    #[arg(long)]
    pub unit_id: Option<UnitId>,

    /// Hostname / IP of the MQTT broker
    #[arg(long)]
    pub mqtt_host: Option<String>,

    /// Port of the MQTT broker [default: 1883]
    #[arg(long)]
    pub mqtt_port: Option<u16>,

    /// MQTT username
    #[arg(long, env = "MQTT_USER")]
    pub mqtt_user: Option<String>,

    /// MQTT password
    #[arg(long, env = "MQTT_PASS", hide_env_values = true)]
    pub mqtt_pass: Option<String>,

    /// Client ID used when connecting to MQTT [default: FranklinWH]
    #[arg(long)]
    pub client_id: Option<String>,

    /// Topic under which every metric is published [default: FranklinWH/AGate]
    #[arg(long)]
    pub topic_prefix: Option<String>,

    /// Polling interval, in seconds or e.g. "2m" [default: 30]
    #[arg(long)]
    pub sleep: Option<Interval>,

    /// Pause after an error before retrying, in seconds or e.g. "2m" [default: 60]
    #[arg(long)]
    pub error_sleep: Option<Interval>,

    /// Timeout for connecting to, reading from and publishing to either service [default: 10]
    #[arg(long)]
    pub timeout: Option<Interval>,

    /// Write a one-off JSON dump of the raw SunSpec data and exit without publishing
    #[arg(long)]
    pub dump_json: bool,

    /// Where --dump-json writes to [default: ./data/agate_dump.json]
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    pub dump_path: Option<PathBuf>,
}

impl Settings {
    /// Read settings from a JSON file using the same field names as the command line (`ip_addr`, `error_sleep`, ...).
    pub fn load(path: &Path) -> crate::Result<Settings> {
        let bytes = std::fs::read(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::config(format!("cannot parse {}: {}", path.display(), e)))
    }

    /// Fill every field missing from `self` with the one from `fallback`.
    pub fn or(self, fallback: Settings) -> Settings {
        Settings {
            ip_addr: self.ip_addr.or(fallback.ip_addr),
            ip_port: self.ip_port.or(fallback.ip_port),
            unit_id: self.unit_id.or(fallback.unit_id),
            mqtt_host: self.mqtt_host.or(fallback.mqtt_host),
            mqtt_port: self.mqtt_port.or(fallback.mqtt_port),
            mqtt_user: self.mqtt_user.or(fallback.mqtt_user),
            mqtt_pass: self.mqtt_pass.or(fallback.mqtt_pass),
            client_id: self.client_id.or(fallback.client_id),
            topic_prefix: self.topic_prefix.or(fallback.topic_prefix),
            sleep: self.sleep.or(fallback.sleep),
            error_sleep: self.error_sleep.or(fallback.error_sleep),
            timeout: self.timeout.or(fallback.timeout),
            dump_json: self.dump_json || fallback.dump_json,
            dump_path: self.dump_path.or(fallback.dump_path),
        }
    }

    pub fn into_config(self) -> crate::Result<Config> {
        let ip_addr = required(self.ip_addr, "ip_addr")?;
        let mqtt_host = required(self.mqtt_host, "mqtt_host")?;

        if self.mqtt_pass.is_some() && self.mqtt_user.is_none() {
            return Err(Error::config("mqtt_pass is set but mqtt_user is not"));
        }

        let topic_prefix = self
            .topic_prefix
            .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_owned());
        if topic_prefix.is_empty() || !rumqttc::mqttbytes::valid_topic(&topic_prefix) {
            return Err(Error::config(format!(
                "topic_prefix {:?} is not a valid MQTT topic",
                topic_prefix
            )));
        }

        let timeout = self.timeout.map_or(DEFAULT_TIMEOUT, |i| i.0);
        if timeout.is_zero() {
            return Err(Error::config("timeout must be greater than zero"));
        }

        Ok(Config {
            ip_addr,
            ip_port: self.ip_port.unwrap_or(DEFAULT_IP_PORT),
            unit_id: self.unit_id.unwrap_or(DEFAULT_UNIT_ID),
            mqtt_host,
            mqtt_port: self.mqtt_port.unwrap_or(DEFAULT_MQTT_PORT),
            mqtt_user: self.mqtt_user,
            mqtt_pass: self.mqtt_pass,
            client_id: self
                .client_id
                .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_owned()),
            topic_prefix,
            sleep: self.sleep.map_or(DEFAULT_SLEEP, |i| i.0),
            error_sleep: self.error_sleep.map_or(DEFAULT_ERROR_SLEEP, |i| i.0),
            timeout,
            dump_json: self.dump_json,
            dump_path: self
                .dump_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DUMP_PATH)),
        })
    }
}

fn required(value: Option<String>, name: &'static str) -> crate::Result<String> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(Error::config(format!(
            "missing required setting `{}` (--{})",
            name,
            name.replace('_', "-")
        ))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    pub(crate) fn minimal() -> Config {
        Settings {
            ip_addr: Some("10.0.0.5".to_owned()),
            mqtt_host: Some("broker".to_owned()),
            ..Default::default()
        }
        .into_config()
        .unwrap()
    }

    #[test]
    fn defaults() {
        let config = minimal();
        assert_eq!(
            config,
            Config {
                ip_addr: "10.0.0.5".to_owned(),
                ip_port: 502,
                unit_id: 1,
                mqtt_host: "broker".to_owned(),
                mqtt_port: 1883,
                mqtt_user: None,
                mqtt_pass: None,
                client_id: "FranklinWH".to_owned(),
                topic_prefix: "FranklinWH/AGate".to_owned(),
                sleep: Duration::from_secs(30),
                error_sleep: Duration::from_secs(60),
                timeout: Duration::from_secs(10),
                dump_json: false,
                dump_path: PathBuf::from("./data/agate_dump.json"),
            }
        );
    }

    #[test]
    fn missing_required_fields() {
        let err = Settings {
            mqtt_host: Some("broker".to_owned()),
            ..Default::default()
        }
        .into_config()
        .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("--ip-addr"));

        let err = Settings {
            ip_addr: Some("10.0.0.5".to_owned()),
            mqtt_host: Some("  ".to_owned()),
            ..Default::default()
        }
        .into_config()
        .unwrap_err();
        assert!(err.to_string().contains("--mqtt-host"));
    }

    #[test]
    fn password_without_user_is_rejected() {
        let settings = Settings {
            ip_addr: Some("10.0.0.5".to_owned()),
            mqtt_host: Some("broker".to_owned()),
            mqtt_pass: Some("secret".to_owned()),
            ..Default::default()
        };
        assert!(matches!(settings.into_config(), Err(Error::Config(_))));
    }

    #[test]
    fn wildcard_topic_prefix_is_rejected() {
        let settings = Settings {
            ip_addr: Some("10.0.0.5".to_owned()),
            mqtt_host: Some("broker".to_owned()),
            topic_prefix: Some("agate/#".to_owned()),
            ..Default::default()
        };
        assert!(matches!(settings.into_config(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let settings = Settings {
            ip_addr: Some("10.0.0.5".to_owned()),
            mqtt_host: Some("broker".to_owned()),
            timeout: Some(Interval(Duration::ZERO)),
            ..Default::default()
        };
        assert!(matches!(settings.into_config(), Err(Error::Config(_))));
    }

    #[test]
    fn parse_file_settings() {
        let settings = serde_json::from_value::<Settings>(json!({
            "ip_addr": "192.168.1.40",
            "mqtt_host": "mqtt.local",
            "mqtt_user": "agate",
            "mqtt_pass": "hunter2",
            "sleep": 15,
            "error_sleep": "2m",
            "dump_json": true
        }))
        .unwrap();

        let config = settings.into_config().unwrap();
        assert_eq!(config.ip_addr, "192.168.1.40");
        assert_eq!(config.mqtt_user.as_deref(), Some("agate"));
        assert_eq!(config.sleep, Duration::from_secs(15));
        assert_eq!(config.error_sleep, Duration::from_secs(120));
        assert!(config.dump_json);
    }

    #[test]
    fn unknown_file_fields_are_rejected() {
        let result = serde_json::from_value::<Settings>(json!({ "ip_address": "192.168.1.40" }));
        assert!(result.is_err());
    }

    #[test]
    fn load_reports_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");

        assert!(matches!(Settings::load(&path), Err(Error::Config(_))));

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Settings::load(&path), Err(Error::Config(_))));

        std::fs::write(&path, r#"{ "ip_addr": "10.1.1.1", "ip_port": 1502 }"#).unwrap();
        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.ip_port, Some(1502));
    }

    #[test]
    fn command_line_overrides_file() {
        let file = Settings {
            ip_addr: Some("10.0.0.5".to_owned()),
            mqtt_host: Some("from-file".to_owned()),
            sleep: Some(Interval(Duration::from_secs(5))),
            dump_json: true,
            ..Default::default()
        };
        let cli = Settings {
            mqtt_host: Some("from-cli".to_owned()),
            ..Default::default()
        };

        let config = cli.or(file).into_config().unwrap();
        assert_eq!(config.mqtt_host, "from-cli");
        assert_eq!(config.ip_addr, "10.0.0.5");
        assert_eq!(config.sleep, Duration::from_secs(5));
        assert!(config.dump_json);
    }

    #[test]
    fn parse_intervals() {
        assert_eq!("45".parse::<Interval>().unwrap(), Interval(Duration::from_secs(45)));
        assert_eq!("1m 30s".parse::<Interval>().unwrap(), Interval(Duration::from_secs(90)));
        assert!("soon".parse::<Interval>().is_err());
    }

    #[test]
    fn keep_alive_outlasts_the_longest_pause() {
        let mut config = minimal();
        assert_eq!(config.keep_alive(), Duration::from_secs(130));

        config.sleep = Duration::ZERO;
        config.error_sleep = Duration::ZERO;
        config.timeout = Duration::from_secs(1);
        assert_eq!(config.keep_alive(), Duration::from_secs(5));

        config.error_sleep = Duration::from_secs(100_000);
        assert_eq!(config.keep_alive(), Duration::from_secs(65535));
    }
}
