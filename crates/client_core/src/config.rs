use std::{collections::HashMap, fs, path::Path, time::Duration};

use serde::Deserialize;

const SETTINGS_FILE: &str = "activity_client.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    pub activity_service_url: String,
    pub kms_service_url: String,
    pub flag_service_url: String,
    /// Identifies this device to the KMS (`clientId` of every KMS request).
    pub device_url: String,
    pub ephemeral_key_timeout_seconds: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            activity_service_url: "https://conv-a.wbx2.com/conversation/api/v1".into(),
            kms_service_url: "https://encryption-a.wbx2.com/encryption/api/v1".into(),
            flag_service_url: "https://raindrop-a.wbx2.com/raindrop/api/v1".into(),
            device_url: "https://wdm-a.wbx2.com/wdm/api/v1/devices/local".into(),
            ephemeral_key_timeout_seconds: 20,
        }
    }
}

impl ClientSettings {
    pub fn ephemeral_key_timeout(&self) -> Duration {
        Duration::from_secs(self.ephemeral_key_timeout_seconds)
    }

    /// Endpoint accepting `{kmsMessages, destination}` batches.
    pub fn kms_messages_url(&self) -> String {
        format!("{}/kms/messages", self.kms_service_url.trim_end_matches('/'))
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            apply_file_overrides(&mut settings, &file_cfg);
        }
    }

    if let Some(v) = env_override("ACTIVITY_SERVICE_URL") {
        settings.activity_service_url = v;
    }
    if let Some(v) = env_override("KMS_SERVICE_URL") {
        settings.kms_service_url = v;
    }
    if let Some(v) = env_override("FLAG_SERVICE_URL") {
        settings.flag_service_url = v;
    }
    if let Some(v) = env_override("DEVICE_URL") {
        settings.device_url = v;
    }
    if let Ok(v) = std::env::var("APP__EPHEMERAL_KEY_TIMEOUT_SECONDS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.ephemeral_key_timeout_seconds = parsed;
        }
    }

    settings
}

fn apply_file_overrides(settings: &mut ClientSettings, file_cfg: &HashMap<String, String>) {
    if let Some(v) = file_cfg.get("activity_service_url") {
        settings.activity_service_url = v.clone();
    }
    if let Some(v) = file_cfg.get("kms_service_url") {
        settings.kms_service_url = v.clone();
    }
    if let Some(v) = file_cfg.get("flag_service_url") {
        settings.flag_service_url = v.clone();
    }
    if let Some(v) = file_cfg.get("device_url") {
        settings.device_url = v.clone();
    }
    if let Some(v) = file_cfg.get("ephemeral_key_timeout_seconds") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.ephemeral_key_timeout_seconds = parsed;
        }
    }
}

/// `APP__<NAME>` wins over the bare `<NAME>`.
fn env_override(name: &str) -> Option<String> {
    std::env::var(format!("APP__{name}"))
        .ok()
        .or_else(|| std::env::var(name).ok())
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    #[test]
    fn defaults_use_twenty_second_handshake_deadline() {
        let settings = ClientSettings::default();
        assert_eq!(settings.ephemeral_key_timeout(), Duration::from_secs(20));
        assert!(settings.kms_messages_url().ends_with("/kms/messages"));
    }

    #[test]
    fn file_values_override_defaults() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("activity_client_test_{suffix}.toml"));
        fs::write(
            &path,
            "kms_service_url = \"http://127.0.0.1:9000/\"\nephemeral_key_timeout_seconds = \"5\"\n",
        )
        .expect("write settings");

        let settings = load_settings_from(&path);
        assert_eq!(settings.kms_messages_url(), "http://127.0.0.1:9000/kms/messages");
        assert_eq!(settings.ephemeral_key_timeout_seconds, 5);

        fs::remove_file(path).expect("cleanup");
    }

    #[test]
    fn unparsable_file_is_ignored() {
        let mut settings = ClientSettings::default();
        let cfg: HashMap<String, String> =
            [("ephemeral_key_timeout_seconds".to_string(), "soon".to_string())].into();
        apply_file_overrides(&mut settings, &cfg);
        assert_eq!(settings.ephemeral_key_timeout_seconds, 20);
    }
}
