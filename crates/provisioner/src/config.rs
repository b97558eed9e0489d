use std::path::Path;

use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::{
    Error, Result,
    api::{
        AccessMode, ComputeSizing, Filesystem, Network, OperatingSystem, PvcReference, RootVolume,
        Storage, User, VolumeMode, VolumeSource,
    },
    builder::validate_dns_label,
    orchestrator::ReadinessPolicy,
    template::DEFAULT_CLOUD_INIT,
};

/// Everything the builder and orchestrator need besides the server's identity.
///
/// Every field has a default, so an empty file (or no file) provisions the
/// stock GPU workstation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvisionConfig {
    #[garde(custom(dns_label))]
    pub namespace: String,
    /// Prepended to the project id to form the server name.
    #[garde(skip)]
    pub name_prefix: String,
    /// Zone for the external-dns hostname annotation; none skips the annotation.
    #[garde(skip)]
    pub dns_zone: Option<String>,
    #[garde(length(min = 1))]
    pub region: String,
    #[garde(skip)]
    pub os: OperatingSystem,
    #[garde(dive)]
    pub compute: ComputeSizing,
    #[garde(length(min = 1))]
    pub memory: String,
    #[garde(dive)]
    pub users: Vec<User>,
    #[garde(skip)]
    pub cloud_init: String,
    #[garde(dive)]
    pub storage: Storage,
    #[garde(skip)]
    pub network: Network,
    #[garde(skip)]
    pub initialize_running: bool,
    #[garde(dive)]
    pub readiness: ReadinessPolicy,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            namespace: "tenant-palatial-platform".to_string(),
            name_prefix: "vs-".to_string(),
            dns_zone: Some("tenant-palatial-platform.coreweave.cloud".to_string()),
            region: "LGA1".to_string(),
            os: OperatingSystem::default(),
            compute: ComputeSizing::default(),
            memory: "32Gi".to_string(),
            users: vec![],
            cloud_init: DEFAULT_CLOUD_INIT.to_string(),
            storage: Storage {
                root: RootVolume {
                    size: "821Gi".to_string(),
                    source: VolumeSource {
                        pvc: PvcReference {
                            name: "new-2761".to_string(),
                            namespace: "tenant-palatial-platform".to_string(),
                        },
                    },
                    storage_class_name: "block-nvme-lga1".to_string(),
                    volume_mode: VolumeMode::Block,
                    access_mode: AccessMode::ReadWriteOnce,
                },
                filesystems: vec![Filesystem::from_claim("ue5storagehub")],
            },
            network: Network::default(),
            initialize_running: true,
            readiness: ReadinessPolicy::default(),
        }
    }
}

impl ProvisionConfig {
    /// Load from a YAML file, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let data = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_yaml(&data)?
            }
            None => Self::default(),
        };

        Ok(config)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        // an empty document deserializes as unit, not as an empty map
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml_ng::from_str(data)?)
    }

    /// Grant login to one more user, replacing any user with the same name.
    pub fn with_user(mut self, username: String, ssh_public_key: Option<String>) -> Self {
        self.users.retain(|user| user.username != username);
        self.users.push(User {
            username,
            ssh_public_key,
        });
        self
    }

    pub fn check(&self) -> Result<()> {
        self.validate().map_err(Error::InvalidConfig)
    }
}

fn dns_label(value: &str, _context: &()) -> garde::Result {
    validate_dns_label(value).map_err(garde::Error::new)
}

/// Serde adapter for durations written as `30s`, `5m` or `1h 30m`.
pub(crate) mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(D::Error::custom)
    }
}
