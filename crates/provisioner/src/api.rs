use garde::Validate;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type whose `reason` carries the lifecycle state of a VirtualServer.
pub const READY_CONDITION: &str = "Ready";

/// State reported while the server has no status yet.
pub const PENDING_STATE: &str = "Pending";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, Validate, JsonSchema)]
#[kube(
    group = "virtualservers.coreweave.com",
    version = "v1alpha1",
    kind = "VirtualServer",
    namespaced
)]
#[kube(status = "VirtualServerStatus", derive = "PartialEq")]
#[serde(rename_all = "camelCase")]
pub struct VirtualServerSpec {
    #[garde(length(min = 1))]
    pub region: String,
    #[garde(skip)]
    pub os: OperatingSystem,
    #[garde(dive)]
    pub resources: Resources,
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
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServerStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<VirtualServerCondition>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServerCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl VirtualServer {
    /// Lifecycle state as reported by the `Ready` condition, e.g. `Running` or `Stopped`.
    pub fn current_state(&self) -> String {
        self.status
            .as_ref()
            .and_then(|status| {
                status
                    .conditions
                    .iter()
                    .find(|c| c.type_ == READY_CONDITION)
            })
            .and_then(|c| c.reason.clone())
            .unwrap_or_else(|| PENDING_STATE.to_string())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Default, JsonSchema)]
pub struct OperatingSystem {
    #[serde(rename = "type")]
    pub type_: OsType,
    #[serde(rename = "enableUEFIBoot", default)]
    pub enable_uefi_boot: bool,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    #[default]
    Windows,
    Linux,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Validate, JsonSchema)]
pub struct Resources {
    #[garde(dive)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuResource>,
    #[garde(dive, custom(cpu_type_unset_with_gpu(&self.gpu)))]
    pub cpu: CpuResource,
    #[garde(length(min = 1))]
    pub memory: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Validate, JsonSchema)]
pub struct GpuResource {
    #[garde(length(min = 1))]
    #[serde(rename = "type")]
    pub type_: String,
    #[garde(range(min = 1))]
    pub count: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Validate, JsonSchema)]
pub struct CpuResource {
    /// Only valid without a GPU; the cluster picks the CPU to match a GPU type.
    #[garde(length(min = 1))]
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[garde(range(min = 1))]
    pub count: u32,
}

fn cpu_type_unset_with_gpu(
    gpu: &Option<GpuResource>,
) -> impl FnOnce(&CpuResource, &()) -> garde::Result + '_ {
    move |cpu, _| match (gpu, &cpu.type_) {
        (Some(gpu), Some(cpu_type)) => Err(garde::Error::new(format!(
            "cpu type {cpu_type} cannot be set together with gpu type {}",
            gpu.type_
        ))),
        _ => Ok(()),
    }
}

/// Compute sizing as chosen by the operator. A GPU server only states a CPU count.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Validate)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ComputeSizing {
    #[serde(rename_all = "camelCase")]
    Gpu {
        #[garde(length(min = 1))]
        gpu_type: String,
        #[garde(range(min = 1))]
        gpu_count: u32,
        #[garde(range(min = 1))]
        cpu_count: u32,
    },
    #[serde(rename_all = "camelCase")]
    Cpu {
        #[garde(length(min = 1))]
        cpu_type: Option<String>,
        #[garde(range(min = 1))]
        cpu_count: u32,
    },
}

impl Default for ComputeSizing {
    fn default() -> Self {
        Self::Gpu {
            gpu_type: "Quadro_RTX_4000".to_string(),
            gpu_count: 1,
            cpu_count: 4,
        }
    }
}

impl ComputeSizing {
    pub fn resources(&self, memory: &str) -> Resources {
        let (gpu, cpu) = match self {
            Self::Gpu {
                gpu_type,
                gpu_count,
                cpu_count,
            } => (
                Some(GpuResource {
                    type_: gpu_type.clone(),
                    count: *gpu_count,
                }),
                CpuResource {
                    type_: None,
                    count: *cpu_count,
                },
            ),
            Self::Cpu {
                cpu_type,
                cpu_count,
            } => (
                None,
                CpuResource {
                    type_: cpu_type.clone(),
                    count: *cpu_count,
                },
            ),
        };

        Resources {
            gpu,
            cpu,
            memory: memory.to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Validate, JsonSchema)]
pub struct User {
    #[garde(length(min = 1))]
    pub username: String,
    #[garde(skip)]
    #[serde(rename = "sshpublickey", default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Validate, JsonSchema)]
pub struct Storage {
    #[garde(dive)]
    pub root: RootVolume,
    #[garde(dive)]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filesystems: Vec<Filesystem>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RootVolume {
    #[garde(length(min = 1))]
    pub size: String,
    #[garde(dive)]
    pub source: VolumeSource,
    #[garde(length(min = 1))]
    pub storage_class_name: String,
    #[garde(skip)]
    pub volume_mode: VolumeMode,
    #[garde(skip)]
    pub access_mode: AccessMode,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Validate, JsonSchema)]
pub struct VolumeSource {
    #[garde(dive)]
    pub pvc: PvcReference,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Validate, JsonSchema)]
pub struct PvcReference {
    #[garde(length(min = 1))]
    pub name: String,
    #[garde(length(min = 1))]
    pub namespace: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default, JsonSchema)]
pub enum VolumeMode {
    #[default]
    Block,
    Filesystem,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default, JsonSchema)]
pub enum AccessMode {
    #[default]
    ReadWriteOnce,
    ReadWriteMany,
    ReadOnlyMany,
}

/// Auxiliary filesystem mounted from an existing claim.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Validate, JsonSchema)]
pub struct Filesystem {
    #[garde(length(min = 1))]
    pub name: String,
    #[garde(dive)]
    pub spec: FilesystemSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemSpec {
    #[garde(dive)]
    pub persistent_volume_claim: ClaimReference,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimReference {
    #[garde(length(min = 1))]
    pub claim_name: String,
}

impl Filesystem {
    /// Mount named after the claim it binds, as the cluster examples do.
    pub fn from_claim(claim_name: &str) -> Self {
        Self {
            name: claim_name.to_string(),
            spec: FilesystemSpec {
                persistent_volume_claim: ClaimReference {
                    claim_name: claim_name.to_string(),
                },
            },
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub public: bool,
    #[serde(rename = "directAttachLoadBalancerIP", default)]
    pub direct_attach_load_balancer_ip: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<PortList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp: Option<PortList>,
}

impl Default for Network {
    fn default() -> Self {
        Self {
            public: true,
            direct_attach_load_balancer_ip: true,
            tcp: None,
            udp: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Default, JsonSchema)]
pub struct PortList {
    pub ports: Vec<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_with_conditions(conditions: Vec<VirtualServerCondition>) -> VirtualServer {
        let mut server = VirtualServer::new(
            "vs-1234",
            VirtualServerSpec {
                region: "LGA1".to_string(),
                os: OperatingSystem::default(),
                resources: ComputeSizing::default().resources("32Gi"),
                users: vec![],
                cloud_init: String::new(),
                storage: Storage {
                    root: RootVolume {
                        size: "40Gi".to_string(),
                        source: VolumeSource {
                            pvc: PvcReference {
                                name: "image".to_string(),
                                namespace: "vd-images".to_string(),
                            },
                        },
                        storage_class_name: "block-nvme-lga1".to_string(),
                        volume_mode: VolumeMode::Block,
                        access_mode: AccessMode::ReadWriteOnce,
                    },
                    filesystems: vec![],
                },
                network: Network::default(),
                initialize_running: true,
            },
        );
        server.status = Some(VirtualServerStatus { conditions });
        server
    }

    fn condition(type_: &str, reason: Option<&str>) -> VirtualServerCondition {
        VirtualServerCondition {
            type_: type_.to_string(),
            status: "False".to_string(),
            reason: reason.map(str::to_string),
            message: None,
            last_transition_time: None,
        }
    }

    #[test]
    fn state_comes_from_ready_condition_reason() {
        let server = server_with_conditions(vec![
            condition("Started", Some("Scheduled")),
            condition(READY_CONDITION, Some("Running")),
        ]);
        assert_eq!(server.current_state(), "Running");
    }

    #[test]
    fn missing_status_reads_as_pending() {
        let mut server = server_with_conditions(vec![]);
        assert_eq!(server.current_state(), PENDING_STATE);

        server.status = None;
        assert_eq!(server.current_state(), PENDING_STATE);

        let server = server_with_conditions(vec![condition(READY_CONDITION, None)]);
        assert_eq!(server.current_state(), PENDING_STATE);
    }

    #[test]
    fn gpu_sizing_leaves_cpu_type_to_the_cluster() {
        let resources = ComputeSizing::default().resources("32Gi");
        assert_eq!(resources.cpu.type_, None);
        assert_eq!(resources.cpu.count, 4);
        assert!(resources.validate().is_ok());

        let json = serde_json::to_value(&resources).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "gpu": { "type": "Quadro_RTX_4000", "count": 1 },
                "cpu": { "count": 4 },
                "memory": "32Gi",
            })
        );
    }

    #[test]
    fn gpu_and_cpu_type_together_are_rejected() {
        let mut resources = ComputeSizing::default().resources("32Gi");
        resources.cpu.type_ = Some("amd-epyc-rome".to_string());
        assert!(resources.validate().is_err());

        resources.gpu = None;
        assert!(resources.validate().is_ok());
    }

    #[test]
    fn compute_sizing_reads_tagged_yaml() {
        let sizing: ComputeSizing =
            serde_yaml_ng::from_str("kind: cpu\ncpuType: amd-epyc-rome\ncpuCount: 8\n").unwrap();
        assert_eq!(
            sizing,
            ComputeSizing::Cpu {
                cpu_type: Some("amd-epyc-rome".to_string()),
                cpu_count: 8,
            }
        );
        assert!(sizing.resources("64Gi").gpu.is_none());
    }

    #[test]
    fn zero_gpu_count_is_rejected() {
        let sizing = ComputeSizing::Gpu {
            gpu_type: "A40".to_string(),
            gpu_count: 0,
            cpu_count: 4,
        };
        assert!(sizing.validate().is_err());
    }
}
