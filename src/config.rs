use anyhow::Error;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;

const USER_AGENT: &str = "rustphone";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PhoneConfig {
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub useragent: Option<String>,
    /// Bound on waiting for a terminal registration transition.
    #[serde(rename = "register_timeout_ms", with = "millis")]
    pub register_timeout: Duration,
    /// How long a call may run without a peer transport before it is ended.
    #[serde(rename = "transport_recovery_timeout_ms", with = "millis")]
    pub transport_recovery_timeout: Duration,
    /// How long an established call may stay without an audio sender.
    #[serde(rename = "media_recovery_timeout_ms", with = "millis")]
    pub media_recovery_timeout: Duration,
    /// Period of the drift check while a call is established, `None` disables it.
    #[serde(rename = "reconcile_interval_ms", with = "optional_millis")]
    pub reconcile_interval: Option<Duration>,
    pub max_track_reattach: u32,
    #[serde(rename = "dtmf_duration_ms", with = "millis")]
    pub dtmf_duration: Duration,
    pub ice_servers: Vec<IceServerItem>,
    pub account: Option<AccountConfig>,
}

/// Saved credentials used for auto-connect.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AccountConfig {
    pub identity: String,
    pub endpoint: String,
    pub password: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default, Serialize, PartialEq)]
pub struct IceServerItem {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl From<&IceServerItem> for RTCIceServer {
    fn from(item: &IceServerItem) -> Self {
        RTCIceServer {
            urls: item.urls.clone(),
            username: item.username.clone().unwrap_or_default(),
            credential: item.password.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

impl Default for PhoneConfig {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            log_file: None,
            useragent: Some(USER_AGENT.to_string()),
            register_timeout: Duration::from_secs(10),
            transport_recovery_timeout: Duration::from_secs(30),
            media_recovery_timeout: Duration::from_secs(30),
            reconcile_interval: Some(Duration::from_secs(2)),
            max_track_reattach: 1,
            dtmf_duration: Duration::from_millis(100),
            ice_servers: vec![],
            account: None,
        }
    }
}

impl PhoneConfig {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers.iter().map(RTCIceServer::from).collect()
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        // toml has no null, 0 reads back as disabled
        serializer.serialize_u64(value.map(|d| d.as_millis() as u64).unwrap_or(0))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let value = Option::<u64>::deserialize(deserializer)?;
        Ok(value.filter(|ms| *ms > 0).map(Duration::from_millis))
    }
}
