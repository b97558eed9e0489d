use std::fmt;

use garde::Validate;
use kube::api::ObjectMeta;

use crate::{
    Error, Result,
    api::{VirtualServer, VirtualServerSpec},
    config::ProvisionConfig,
    template::{self, BootstrapValues},
};

const HOSTNAME_ANNOTATION: &str = "external-dns.alpha.kubernetes.io/hostname";

/// Longest name a DNS-1123 label may carry.
const MAX_NAME_LENGTH: usize = 63;

/// The `(namespace, name)` pair addressing one VirtualServer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VmIdentity {
    pub name: String,
    pub namespace: String,
}

impl VmIdentity {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_dns_label(&name).map_err(|reason| Error::InvalidName {
            name: name.clone(),
            reason,
        })?;

        Ok(Self {
            name,
            namespace: namespace.into(),
        })
    }

    /// Derive the server name from a project id, e.g. `vs-` + `1234`.
    pub fn from_project(prefix: &str, project_id: &str, namespace: impl Into<String>) -> Result<Self> {
        Self::new(format!("{prefix}{project_id}"), namespace)
    }
}

impl fmt::Display for VmIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

pub(crate) fn validate_dns_label(value: &str) -> std::result::Result<(), &'static str> {
    if value.is_empty() {
        return Err("must not be empty");
    }
    if value.len() > MAX_NAME_LENGTH {
        return Err("must be at most 63 characters");
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err("must consist of lowercase alphanumerics and '-'");
    }
    if value.starts_with('-') || value.ends_with('-') {
        return Err("must start and end with an alphanumeric character");
    }
    Ok(())
}

/// Build the complete VirtualServer document for `identity`.
///
/// The bootstrap template is rendered here, with the identity's name and
/// namespace added to `values`, so the result can be submitted as is.
pub fn build(
    config: &ProvisionConfig,
    identity: &VmIdentity,
    values: &BootstrapValues,
) -> Result<VirtualServer> {
    let values = BootstrapValues {
        name: Some(identity.name.clone()),
        namespace: Some(identity.namespace.clone()),
        ..values.clone()
    };
    let cloud_init = template::render(&config.cloud_init, &values)?;

    if config.users.is_empty() {
        tracing::warn!("No users configured for {}, login will not be possible", identity);
    }

    let annotations = config.dns_zone.as_ref().map(|zone| {
        [(
            HOSTNAME_ANNOTATION.to_string(),
            format!("{}.{}", identity.name, zone),
        )]
        .into()
    });

    let spec = VirtualServerSpec {
        region: config.region.clone(),
        os: config.os.clone(),
        resources: config.compute.resources(&config.memory),
        users: config.users.clone(),
        cloud_init,
        storage: config.storage.clone(),
        network: config.network.clone(),
        initialize_running: config.initialize_running,
    };
    spec.validate().map_err(Error::InvalidSpec)?;

    Ok(VirtualServer {
        metadata: ObjectMeta {
            name: Some(identity.name.clone()),
            namespace: Some(identity.namespace.clone()),
            annotations,
            ..Default::default()
        },
        spec,
        status: None,
    })
}

/// YAML form of a built document, as it would be submitted.
pub fn render_manifest(server: &VirtualServer) -> Result<String> {
    Ok(serde_yaml_ng::to_string(server)?)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::api::{ComputeSizing, PortList, User};

    fn values() -> BootstrapValues {
        BootstrapValues {
            project_id: Some("1234".to_string()),
            link: Some("https://example.com/session/1234".to_string()),
            ..Default::default()
        }
    }

    fn identity() -> VmIdentity {
        VmIdentity::from_project("vs-", "1234", "ns-a").unwrap()
    }

    #[test]
    fn name_is_prefix_plus_project_id() {
        let identity = identity();
        assert_eq!(identity.name, "vs-1234");
        assert_eq!(identity.namespace, "ns-a");
        assert_eq!(identity.to_string(), "ns-a/vs-1234");
    }

    #[test]
    fn invalid_names_are_rejected() {
        let too_long = "a".repeat(64);
        for name in ["", "VS-1234", "vs_1234", "-vs", "vs-", too_long.as_str()] {
            let err = VmIdentity::new(name, "ns-a").unwrap_err();
            assert!(matches!(err, Error::InvalidName { .. }), "{name:?} accepted");
        }
        assert!(VmIdentity::new("a".repeat(63), "ns-a").is_ok());
    }

    #[test]
    fn document_carries_identity_and_annotation() {
        let server = build(&ProvisionConfig::default(), &identity(), &values()).unwrap();

        assert_eq!(server.metadata.name.as_deref(), Some("vs-1234"));
        assert_eq!(server.metadata.namespace.as_deref(), Some("ns-a"));
        assert_eq!(
            server
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(HOSTNAME_ANNOTATION))
                .map(String::as_str),
            Some("vs-1234.tenant-palatial-platform.coreweave.cloud")
        );
        assert!(server.status.is_none());
    }

    #[test]
    fn no_dns_zone_means_no_annotation() {
        let config = ProvisionConfig {
            dns_zone: None,
            ..Default::default()
        };
        let server = build(&config, &identity(), &values()).unwrap();
        assert_eq!(server.metadata.annotations, None);
    }

    #[test]
    fn bootstrap_is_rendered_before_submission() {
        let server = build(&ProvisionConfig::default(), &identity(), &values()).unwrap();
        assert!(
            server
                .spec
                .cloud_init
                .contains(r"startup.bat 1234 https://example.com/session/1234")
        );
        assert!(!server.spec.cloud_init.contains("{{"));
    }

    #[test]
    fn identity_values_are_available_to_the_template() {
        let config = ProvisionConfig {
            cloud_init: "hostname: {{name}}.{{namespace}}".to_string(),
            ..Default::default()
        };
        let server = build(&config, &identity(), &BootstrapValues::default()).unwrap();
        assert_eq!(server.spec.cloud_init, "hostname: vs-1234.ns-a");
    }

    #[test]
    fn missing_link_fails_the_build() {
        let values = BootstrapValues {
            link: None,
            ..values()
        };
        let err = build(&ProvisionConfig::default(), &identity(), &values).unwrap_err();
        assert!(matches!(err, Error::Template(_)));
    }

    #[test]
    fn identical_inputs_give_identical_manifests() {
        let config = ProvisionConfig::default().with_user(
            "ops".to_string(),
            Some("ssh-ed25519 AAAA ops@host".to_string()),
        );
        let first = render_manifest(&build(&config, &identity(), &values()).unwrap()).unwrap();
        let second = render_manifest(&build(&config, &identity(), &values()).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn manifest_uses_cluster_field_names() {
        let config = ProvisionConfig::default().with_user(
            "ops".to_string(),
            Some("ssh-ed25519 AAAA ops@host".to_string()),
        );
        let server = build(&config, &identity(), &values()).unwrap();
        let doc = serde_json::to_value(&server).unwrap();

        assert_eq!(doc["apiVersion"], "virtualservers.coreweave.com/v1alpha1");
        assert_eq!(doc["kind"], "VirtualServer");
        let spec = &doc["spec"];
        assert_eq!(spec["region"], "LGA1");
        assert_eq!(
            spec["os"],
            serde_json::json!({ "type": "windows", "enableUEFIBoot": false })
        );
        assert_eq!(spec["resources"]["gpu"]["type"], "Quadro_RTX_4000");
        assert_eq!(spec["resources"]["cpu"], serde_json::json!({ "count": 4 }));
        assert_eq!(spec["users"][0]["sshpublickey"], "ssh-ed25519 AAAA ops@host");
        assert_eq!(spec["storage"]["root"]["storageClassName"], "block-nvme-lga1");
        assert_eq!(spec["storage"]["root"]["volumeMode"], "Block");
        assert_eq!(spec["storage"]["root"]["accessMode"], "ReadWriteOnce");
        assert_eq!(
            spec["storage"]["filesystems"][0]["spec"]["persistentVolumeClaim"]["claimName"],
            "ue5storagehub"
        );
        assert_eq!(
            spec["network"],
            serde_json::json!({ "public": true, "directAttachLoadBalancerIP": true })
        );
        assert_eq!(spec["initializeRunning"], true);
    }

    #[test]
    fn explicit_port_lists_are_passed_through() {
        let mut config = ProvisionConfig::default();
        config.network.direct_attach_load_balancer_ip = false;
        config.network.tcp = Some(PortList {
            ports: vec![22, 443, 3389],
        });
        let server = build(&config, &identity(), &values()).unwrap();
        let doc = serde_json::to_value(&server.spec.network).unwrap();
        assert_eq!(doc["tcp"]["ports"], serde_json::json!([22, 443, 3389]));
        assert!(doc.get("udp").is_none());
    }

    #[test]
    fn cpu_sizing_sets_cpu_type_without_gpu() {
        let config = ProvisionConfig {
            compute: ComputeSizing::Cpu {
                cpu_type: Some("amd-epyc-rome".to_string()),
                cpu_count: 8,
            },
            ..Default::default()
        };
        let server = build(&config, &identity(), &values()).unwrap();
        assert_eq!(server.spec.resources.gpu, None);
        assert_eq!(server.spec.resources.cpu.type_.as_deref(), Some("amd-epyc-rome"));
    }

    #[test]
    fn invalid_user_is_rejected() {
        let config = ProvisionConfig {
            users: vec![User {
                username: String::new(),
                ssh_public_key: None,
            }],
            ..Default::default()
        };
        let err = build(&config, &identity(), &values()).unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }
}
