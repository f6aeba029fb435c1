//! `warren.conf` configuration file parser.
//!
//! Line-oriented INI format: `[daemon]` for process-wide settings and one
//! `[tracker.<name>]` block per configured tracker, carrying that tracker's
//! token and connection details.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Process-wide daemon settings.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the Ed25519 identity private key file.
    pub identity_key: PathBuf,
    /// Path to the CA bundle used to verify tracker TLS certificates.
    pub ca_bundle: PathBuf,
    /// Runtime directory for the pid file and control socket.
    pub runtime_dir: PathBuf,
    /// UDP port the reliable-transport endpoint binds for peer sessions.
    pub udp_port: u16,
}

/// Default UDP port when `udp_port` is not set in `[daemon]`.
pub const DEFAULT_UDP_PORT: u16 = 51820;

/// Per-tracker configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub name: String,
    pub endpoint: String,
    pub token: Option<String>,
    pub master_token: Option<String>,
}

/// Complete `warren.conf` configuration.
#[derive(Debug, Clone)]
pub struct WarrenConfig {
    pub daemon: DaemonConfig,
    pub trackers: Vec<TrackerConfig>,
}

impl WarrenConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut daemon_fields: HashMap<String, String> = HashMap::new();
        let mut trackers: Vec<TrackerConfig> = Vec::new();
        let mut current: Section = Section::None;
        let mut current_tracker_fields: HashMap<String, String> = HashMap::new();
        let mut current_tracker_name = String::new();

        let flush_tracker =
            |trackers: &mut Vec<TrackerConfig>, name: &str, fields: &HashMap<String, String>| {
                if name.is_empty() {
                    return;
                }
                trackers.push(TrackerConfig {
                    name: name.to_string(),
                    endpoint: fields.get("endpoint").cloned().unwrap_or_default(),
                    token: fields.get("token").cloned(),
                    master_token: fields.get("master_token").cloned(),
                });
            };

        for (line_num, raw_line) in content.lines().enumerate() {
            let line_num = line_num + 1;
            let line = raw_line.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(header) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                if let Section::Tracker = current {
                    flush_tracker(&mut trackers, &current_tracker_name, &current_tracker_fields);
                }
                current_tracker_fields.clear();
                current_tracker_name.clear();

                if header.eq_ignore_ascii_case("daemon") {
                    current = Section::Daemon;
                } else if let Some(name) = header.strip_prefix("tracker.") {
                    if name.is_empty() {
                        return Err(ConfigError::ParseError {
                            line: line_num,
                            message: "tracker section missing a name: [tracker.<name>]".into(),
                        });
                    }
                    current = Section::Tracker;
                    current_tracker_name = name.to_string();
                } else {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: format!("unknown section [{header}]"),
                    });
                }
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("expected 'key = value', got: {line}"),
                });
            };
            let key = key.trim().to_lowercase();
            let value = value.trim().to_string();

            match current {
                Section::Daemon => {
                    daemon_fields.insert(key, value);
                }
                Section::Tracker => {
                    current_tracker_fields.insert(key, value);
                }
                Section::None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "configuration value outside of any section".into(),
                    });
                }
            }
        }

        if let Section::Tracker = current {
            flush_tracker(&mut trackers, &current_tracker_name, &current_tracker_fields);
        }

        let identity_key = daemon_fields
            .get("identity_key")
            .ok_or_else(|| ConfigError::MissingField {
                field: "[daemon] identity_key".into(),
            })?
            .into();
        let ca_bundle = daemon_fields
            .get("ca_bundle")
            .ok_or_else(|| ConfigError::MissingField {
                field: "[daemon] ca_bundle".into(),
            })?
            .into();
        let runtime_dir = daemon_fields
            .get("runtime_dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/run/warren"));
        let udp_port = match daemon_fields.get("udp_port") {
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidKey {
                field: "[daemon] udp_port".into(),
            })?,
            None => DEFAULT_UDP_PORT,
        };

        for tracker in &trackers {
            if tracker.endpoint.is_empty() {
                return Err(ConfigError::MissingField {
                    field: format!("[tracker.{}] endpoint", tracker.name),
                });
            }
        }

        Ok(WarrenConfig {
            daemon: DaemonConfig {
                identity_key,
                ca_bundle,
                runtime_dir,
                udp_port,
            },
            trackers,
        })
    }

    pub fn tracker(&self, name: &str) -> Option<&TrackerConfig> {
        self.trackers.iter().find(|t| t.name == name)
    }
}

#[derive(Clone, Copy)]
enum Section {
    None,
    Daemon,
    Tracker,
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CONFIG: &str = r#"
[daemon]
identity_key = /etc/warren/id_ed25519
ca_bundle = /etc/warren/ca.pem
runtime_dir = /var/run/warren

[tracker.t1]
endpoint = tracker.example.com:4444
token = abc123

[tracker.t2]
endpoint = tracker2.example.com:4444
token = def456
master_token = master789
"#;

    #[test]
    fn parses_daemon_and_trackers() {
        let config = WarrenConfig::parse(TEST_CONFIG).unwrap();

        assert_eq!(config.daemon.identity_key, PathBuf::from("/etc/warren/id_ed25519"));
        assert_eq!(config.trackers.len(), 2);

        let t1 = config.tracker("t1").unwrap();
        assert_eq!(t1.endpoint, "tracker.example.com:4444");
        assert_eq!(t1.token.as_deref(), Some("abc123"));
        assert_eq!(t1.master_token, None);

        let t2 = config.tracker("t2").unwrap();
        assert_eq!(t2.master_token.as_deref(), Some("master789"));
        assert_eq!(config.daemon.udp_port, DEFAULT_UDP_PORT);
    }

    #[test]
    fn udp_port_can_be_overridden() {
        let config = r#"
[daemon]
identity_key = /etc/warren/id_ed25519
ca_bundle = /etc/warren/ca.pem
udp_port = 6000
"#;
        let config = WarrenConfig::parse(config).unwrap();
        assert_eq!(config.daemon.udp_port, 6000);
    }

    #[test]
    fn missing_identity_key_is_an_error() {
        let config = "[daemon]\nca_bundle = /etc/warren/ca.pem\n";
        assert!(WarrenConfig::parse(config).is_err());
    }

    #[test]
    fn tracker_without_endpoint_is_an_error() {
        let config = r#"
[daemon]
identity_key = /etc/warren/id_ed25519
ca_bundle = /etc/warren/ca.pem

[tracker.t1]
token = abc123
"#;
        assert!(WarrenConfig::parse(config).is_err());
    }

    #[test]
    fn unknown_section_is_an_error() {
        let config = "[bogus]\nkey = value\n";
        assert!(WarrenConfig::parse(config).is_err());
    }

    #[test]
    fn value_outside_section_is_an_error() {
        let config = "key = value\n";
        assert!(WarrenConfig::parse(config).is_err());
    }
}
