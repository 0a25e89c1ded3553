use std::path::Path;
use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::error::ConfigError;
use crate::profiles::Profile;

serde_with::serde_conv!(
    pub(crate) HumanDuration,
    Duration,
    |duration: &Duration| humantime::format_duration(*duration).to_string(),
    |value: String| humantime::parse_duration(&value)
);

const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SDP_SEARCH_ATTEMPTS: u8 = 3;
const DEFAULT_L2CAP_MTU: u16 = 672;
const DEFAULT_MIN_REMOTE_MTU: u16 = 48;
const DEFAULT_KICK_LATER_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_HANDSET_POOL_SIZE: usize = 4;
const DEFAULT_A2DP_OUT_OF_EAR_PAUSE: Duration = Duration::from_secs(3);
const DEFAULT_A2DP_RESTART_WINDOW: Duration = Duration::from_secs(10);
const DEFAULT_SCO_TRANSFER: Duration = Duration::from_secs(3);
const DEFAULT_DFU_TIMEOUT_IN_CASE: Duration = Duration::from_secs(60);
const DEFAULT_DISCONNECT_WATCHDOG: Duration = Duration::from_secs(5);
const DEFAULT_SLEEP_AFTER_IDLE: Duration = Duration::from_secs(600);

/// Peer signalling channel settings.
#[serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerSignallingConfig {
    /// Idle time after which the channel is torn down.
    #[builder(default = DEFAULT_INACTIVITY_TIMEOUT)]
    #[serde_as(as = "HumanDuration")]
    pub inactivity_timeout: Duration,
    #[builder(default = DEFAULT_SDP_SEARCH_ATTEMPTS)]
    pub sdp_search_attempts: u8,
    #[builder(default = DEFAULT_L2CAP_MTU)]
    pub l2cap_mtu: u16,
    /// Smallest MTU accepted from the remote side.
    #[builder(default = DEFAULT_MIN_REMOTE_MTU)]
    pub min_remote_mtu: u16,
}

impl Default for PeerSignallingConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    #[builder(default = true)]
    pub enabled: bool,
    /// Delay applied to the next kick after a failed shadow link create.
    #[builder(default = DEFAULT_KICK_LATER_DELAY)]
    #[serde_as(as = "HumanDuration")]
    pub kick_later_delay: Duration,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct HandsetServiceConfig {
    /// Number of handset state machines that may exist at once.
    #[builder(default = DEFAULT_HANDSET_POOL_SIZE)]
    pub pool_size: usize,
    /// Order in which handset profiles are connected; disconnects use the reverse.
    #[builder(default = vec![Profile::Hfp, Profile::A2dp, Profile::Avrcp])]
    pub profile_order: Vec<Profile>,
}

impl Default for HandsetServiceConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Decides which earbud yields when both hold the same handset with equal scores.
    #[builder(default)]
    pub is_left: bool,
    #[builder(default = DEFAULT_A2DP_OUT_OF_EAR_PAUSE)]
    #[serde_as(as = "HumanDuration")]
    pub a2dp_out_of_ear_pause: Duration,
    #[builder(default = DEFAULT_A2DP_RESTART_WINDOW)]
    #[serde_as(as = "HumanDuration")]
    pub a2dp_in_ear_restart_window: Duration,
    #[builder(default = DEFAULT_SCO_TRANSFER)]
    #[serde_as(as = "HumanDuration")]
    pub sco_out_of_ear_transfer: Duration,
    #[builder(default = DEFAULT_DFU_TIMEOUT_IN_CASE)]
    #[serde_as(as = "HumanDuration")]
    pub dfu_timeout_in_case: Duration,
    #[builder(default = DEFAULT_DISCONNECT_WATCHDOG)]
    #[serde_as(as = "HumanDuration")]
    pub disconnect_watchdog: Duration,
    #[builder(default = DEFAULT_SLEEP_AFTER_IDLE)]
    #[serde_as(as = "HumanDuration")]
    pub sleep_after_idle: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Optional product features.
#[derive(Debug, Clone, Eq, PartialEq, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    #[builder(default = true)]
    pub dfu: bool,
    #[builder(default)]
    pub dfu_only_from_ui_in_case: bool,
    #[builder(default)]
    pub dfu_allow_ble_upgrade_out_of_case: bool,
    #[builder(default)]
    pub dfu_allow_bredr_upgrade_out_of_case: bool,
    #[builder(default)]
    pub sco_forwarding: bool,
    #[builder(default = true)]
    pub in_ear_leds: bool,
    #[builder(default)]
    pub anc_tuning: bool,
    #[builder(default = true)]
    pub ble_allowed_out_of_case: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Everything resolved at startup that the core needs to know.
///
/// ```
/// use std::time::Duration;
///
/// use earbud_core::{EarbudConfig, PeerSignallingConfig};
///
/// let config = EarbudConfig::builder()
///     .peer_signalling(
///         PeerSignallingConfig::builder()
///             .inactivity_timeout(Duration::from_secs(5))
///             .build(),
///     )
///     .build();
/// assert_eq!(4, config.handset_service.pool_size);
/// ```
#[derive(Debug, Clone, Default, Eq, PartialEq, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct EarbudConfig {
    #[builder(default)]
    pub peer_signalling: PeerSignallingConfig,
    #[builder(default)]
    pub shadow: ShadowConfig,
    #[builder(default)]
    pub handset_service: HandsetServiceConfig,
    #[builder(default)]
    pub app: AppConfig,
    #[builder(default)]
    pub features: FeatureConfig,
}

impl EarbudConfig {
    /// Loads and validates a JSON config file. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read, is not valid
    /// JSON, or holds a value that fails [`EarbudConfig::validate`].
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that timeouts are non-zero and limits are usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            (
                "peer_signalling.inactivity_timeout",
                self.peer_signalling.inactivity_timeout,
            ),
            ("shadow.kick_later_delay", self.shadow.kick_later_delay),
            ("app.a2dp_out_of_ear_pause", self.app.a2dp_out_of_ear_pause),
            (
                "app.a2dp_in_ear_restart_window",
                self.app.a2dp_in_ear_restart_window,
            ),
            ("app.sco_out_of_ear_transfer", self.app.sco_out_of_ear_transfer),
            ("app.dfu_timeout_in_case", self.app.dfu_timeout_in_case),
            ("app.disconnect_watchdog", self.app.disconnect_watchdog),
            ("app.sleep_after_idle", self.app.sleep_after_idle),
        ];
        if let Some(&(field, _)) = timeouts.iter().find(|(_, value)| value.is_zero()) {
            return Err(ConfigError::Invalid {
                field,
                reason: "timeout must be non-zero",
            });
        }

        if self.peer_signalling.sdp_search_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "peer_signalling.sdp_search_attempts",
                reason: "at least one attempt is required",
            });
        }
        if self.peer_signalling.min_remote_mtu > self.peer_signalling.l2cap_mtu {
            return Err(ConfigError::Invalid {
                field: "peer_signalling.min_remote_mtu",
                reason: "must not exceed l2cap_mtu",
            });
        }
        if self.handset_service.pool_size == 0 {
            return Err(ConfigError::Invalid {
                field: "handset_service.pool_size",
                reason: "pool must hold at least one handset",
            });
        }
        if self.handset_service.profile_order.is_empty() {
            return Err(ConfigError::Invalid {
                field: "handset_service.profile_order",
                reason: "at least one profile is required",
            });
        }
        Ok(())
    }
}
