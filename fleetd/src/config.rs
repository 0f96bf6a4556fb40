use anyhow::{Context, Result};
use dotenv::dotenv;
use std::{
    fmt::{self, Display, Formatter},
    net::SocketAddr,
    str::FromStr,
    time::Duration,
};
use url::Url;

#[derive(Clone, Debug, PartialEq)]
pub enum BusKind {
    InMem,
    Mqtt,
}

impl FromStr for BusKind {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inmem" => Ok(BusKind::InMem),
            "mqtt" => Ok(BusKind::Mqtt),
            _ => Err(()),
        }
    }
}

impl Display for BusKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BusKind::InMem => "inmem",
            BusKind::Mqtt => "mqtt",
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum StorageKind {
    InMem,
    Postgres,
}

impl FromStr for StorageKind {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inmem" => Ok(StorageKind::InMem),
            "postgres" => Ok(StorageKind::Postgres),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".into(), port: 1883, client_id: "fleetd".into() }
    }
}

/// Static operator tokens accepted as admin credentials alongside normal
/// user sessions. Compared in constant time.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    pub admin_tokens: Vec<String>,
}

impl AuthConfig {
    pub fn matches(&self, candidate: &str) -> bool {
        self.admin_tokens
            .iter()
            .any(|t| constant_time_eq::constant_time_eq(t.as_bytes(), candidate.as_bytes()))
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind: SocketAddr,
    pub bus: BusKind,
    pub storage: StorageKind,
    pub database_url: Option<String>,
    pub mqtt: MqttConfig,
    pub auth: AuthConfig,
    pub command_timeout: Duration,
    pub device_offline_after: Duration,
    pub hub_offline_after: Duration,
    pub pairing_window: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".parse().unwrap(),
            bus: BusKind::InMem,
            storage: StorageKind::InMem,
            database_url: None,
            mqtt: MqttConfig::default(),
            auth: AuthConfig::default(),
            command_timeout: Duration::from_secs(8),
            device_offline_after: Duration::from_secs(90),
            hub_offline_after: Duration::from_secs(120),
            pairing_window: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let mut c = Self::default();
        if let Ok(s) = std::env::var("FLEETD_BIND") {
            c.bind = s.parse().context("FLEETD_BIND must be host:port")?;
        }
        if let Ok(s) = std::env::var("FLEETD_BUS") {
            c.bus = BusKind::from_str(&s)
                .map_err(|_| anyhow::anyhow!("FLEETD_BUS must be inmem or mqtt"))?;
        }
        if let Ok(s) = std::env::var("FLEETD_STORAGE") {
            c.storage = StorageKind::from_str(&s)
                .map_err(|_| anyhow::anyhow!("FLEETD_STORAGE must be inmem or postgres"))?;
        }
        if let Ok(s) = std::env::var("FLEETD_DATABASE_URL") {
            c.database_url = Some(s);
        }
        if let Ok(s) = std::env::var("FLEETD_MQTT_URL") {
            let url = Url::parse(&s).context("FLEETD_MQTT_URL must be a url")?;
            c.mqtt.host = url.host_str().unwrap_or("127.0.0.1").to_string();
            c.mqtt.port = url.port().unwrap_or(1883);
        }
        if let Ok(s) = std::env::var("FLEETD_MQTT_CLIENT_ID") {
            c.mqtt.client_id = s;
        }
        if let Ok(s) = std::env::var("FLEETD_ADMIN_TOKENS") {
            c.auth.admin_tokens =
                s.split(',').map(str::trim).filter(|t| !t.is_empty()).map(String::from).collect();
        }
        if let Ok(s) = std::env::var("FLEETD_COMMAND_TIMEOUT_SECS") {
            c.command_timeout = Duration::from_secs(s.parse().context("timeout must be seconds")?);
        }
        Ok(c)
    }
}
