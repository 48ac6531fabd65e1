//! The subset of the Kubernetes `batch/v1` API the generated manifests use.
//!
//! Field order follows the order `kubectl` users expect to read them in.

use serde::Serialize;

pub(super) const API_VERSION: &str = "batch/v1";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CronJob {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub metadata: ObjectMeta,
    pub spec: CronJobSpec,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CronJobSpec {
    pub schedule: String,
    pub concurrency_policy: &'static str,
    pub job_template: JobTemplate,
}

#[derive(Debug, Serialize)]
pub(super) struct JobTemplate {
    pub spec: JobSpec,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct Job {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub metadata: ObjectMeta,
    pub spec: JobSpec,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct JobSpec {
    pub backoff_limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<u32>,
    pub template: PodTemplate,
}

#[derive(Debug, Serialize)]
pub(super) struct ObjectMeta {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Serialize)]
pub(super) struct PodTemplate {
    pub spec: PodSpec,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PodSpec {
    pub restart_policy: &'static str,
    pub security_context: SecurityContext,
    pub containers: Vec<Container>,
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SecurityContext {
    pub run_as_user: u32,
    pub run_as_group: u32,
    pub fs_group: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct Container {
    pub name: &'static str,
    pub image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env_from: Vec<EnvFromSource>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    pub args: Vec<String>,
    pub volume_mounts: Vec<VolumeMount>,
    pub resources: Resources,
}

/// Bulk injection of a Secret or ConfigMap, exactly one field is set.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct EnvFromSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<NameRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_map_ref: Option<NameRef>,
}

#[derive(Debug, Serialize)]
pub(super) struct NameRef {
    pub name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct EnvVar {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_from: Option<EnvVarSource>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct EnvVarSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<KeyRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_map_key_ref: Option<KeyRef>,
}

#[derive(Debug, Serialize)]
pub(super) struct KeyRef {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct VolumeMount {
    pub name: &'static str,
    pub mount_path: &'static str,
}

#[derive(Debug, Serialize)]
pub(super) struct Resources {
    pub requests: Quantities,
    pub limits: Quantities,
}

#[derive(Debug, Serialize)]
pub(super) struct Quantities {
    pub memory: String,
    pub cpu: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct Volume {
    pub name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<ClaimRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<EphemeralSource>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ClaimRef {
    pub claim_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct EphemeralSource {
    pub volume_claim_template: ClaimTemplate,
}

#[derive(Debug, Serialize)]
pub(super) struct ClaimTemplate {
    pub spec: ClaimSpec,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ClaimSpec {
    pub access_modes: Vec<&'static str>,
    pub resources: StorageResources,
}

#[derive(Debug, Serialize)]
pub(super) struct StorageResources {
    pub requests: Storage,
}

#[derive(Debug, Serialize)]
pub(super) struct Storage {
    pub storage: String,
}

impl Volume {
    pub fn claim(name: &'static str, claim_name: &str) -> Self {
        Self {
            name,
            persistent_volume_claim: Some(ClaimRef {
                claim_name: claim_name.to_string(),
            }),
            ephemeral: None,
        }
    }

    /// Volume provisioned with the pod and deleted with it.
    pub fn ephemeral(name: &'static str, size: &str) -> Self {
        Self {
            name,
            persistent_volume_claim: None,
            ephemeral: Some(EphemeralSource {
                volume_claim_template: ClaimTemplate {
                    spec: ClaimSpec {
                        access_modes: vec!["ReadWriteOnce"],
                        resources: StorageResources {
                            requests: Storage {
                                storage: size.to_string(),
                            },
                        },
                    },
                },
            }),
        }
    }
}
