//! Kubernetes manifests running `backup` as a CronJob and `restore` as a Job.
//!
//! Rendering is a pure function of the [ManifestSpec]; identical specs give
//! byte-identical YAML.

use std::str::FromStr;
use std::sync::LazyLock;

use derive_more::{Display, Error};
use regex::Regex;

mod pod;

use pod::{
    Container, CronJob, CronJobSpec, EnvFromSource, EnvVar, EnvVarSource, Job, JobSpec, JobTemplate,
    KeyRef, NameRef, ObjectMeta, PodSpec, PodTemplate, Quantities, Resources, SecurityContext,
    Volume, VolumeMount, API_VERSION,
};

const DATA_VOLUME: &str = "odoo-data";
const CACHE_VOLUME: &str = "kopia-cache";
const DUMP_VOLUME: &str = "postgres-dump";

const JOB_TTL_SECONDS: u32 = 600;

static DNS_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("DNS-1123 regex is valid")
});
static ENV_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$").expect("env name regex is valid"));

#[derive(Debug, Display, Error)]
pub enum ManifestError {
    /// A resource name is not a DNS-1123 subdomain.
    #[display("Invalid {_0} '{_1}': must consist of lower case alphanumerics, '-' or '.'")]
    InvalidName(#[error(ignore)] &'static str, #[error(ignore)] String),
    #[display("Invalid cron schedule '{_0}': expected five fields")]
    InvalidSchedule(#[error(ignore)] String),
    #[display("Invalid environment variable '{_0}': {_1}")]
    InvalidEnv(#[error(ignore)] String, #[error(ignore)] &'static str),
    #[display("Rendering the manifest failed: {_0}")]
    Render(serde_yaml::Error),
}

/// Literal environment variable given as `NAME=VALUE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvLiteral {
    pub name: String,
    pub value: String,
}

impl FromStr for EnvLiteral {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, value) = s
            .split_once('=')
            .ok_or_else(|| ManifestError::InvalidEnv(s.to_string(), "expected NAME=VALUE"))?;
        Ok(Self {
            name: env_name(s, name)?,
            value: value.to_string(),
        })
    }
}

/// Single key of a Secret or ConfigMap given as `NAME=SOURCE:KEY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvKeyRef {
    pub name: String,
    pub source: String,
    pub key: String,
}

impl FromStr for EnvKeyRef {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ManifestError::InvalidEnv(s.to_string(), "expected NAME=SOURCE:KEY");

        let (name, reference) = s.split_once('=').ok_or_else(invalid)?;
        let (source, key) = reference.split_once(':').ok_or_else(invalid)?;
        if source.is_empty() || key.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            name: env_name(s, name)?,
            source: source.to_string(),
            key: key.to_string(),
        })
    }
}

fn env_name(entry: &str, name: &str) -> Result<String, ManifestError> {
    if ENV_NAME_RE.is_match(name) {
        Ok(name.to_string())
    } else {
        Err(ManifestError::InvalidEnv(entry.to_string(), "invalid variable name"))
    }
}

/// Environment injected into the container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSpec {
    /// Secrets injected with all their keys.
    pub secret_refs: Vec<String>,
    /// ConfigMaps injected with all their keys.
    pub configmap_refs: Vec<String>,
    pub literals: Vec<EnvLiteral>,
    pub from_secret: Vec<EnvKeyRef>,
    pub from_configmap: Vec<EnvKeyRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub memory_request: String,
    pub memory_limit: String,
    pub cpu_request: String,
    pub cpu_limit: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecuritySpec {
    pub run_as_user: u32,
    pub run_as_group: u32,
    pub fs_group: u32,
}

/// Sizes of the volumes living only as long as the pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralSizes {
    pub kopia_cache: String,
    pub postgres_dump: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Workload {
    /// Scheduled backups.
    Backup { schedule: String, args: Vec<String> },
    /// One-shot restore of `snapshot`.
    Restore { snapshot: String, args: Vec<String> },
}

/// Everything a manifest is rendered from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestSpec {
    pub name: String,
    pub namespace: String,
    pub image: String,
    /// Claim holding the Odoo data directory.
    pub data_pvc: String,
    pub env: EnvSpec,
    pub resources: ResourceSpec,
    pub security: SecuritySpec,
    pub ephemeral: EphemeralSizes,
    pub workload: Workload,
}

impl ManifestSpec {
    fn validate(&self) -> Result<(), ManifestError> {
        let names = [
            ("name", &self.name),
            ("namespace", &self.namespace),
            ("PVC name", &self.data_pvc),
        ];
        let refs = self
            .env
            .secret_refs
            .iter()
            .chain(&self.env.configmap_refs)
            .chain(self.env.from_secret.iter().map(|r| &r.source))
            .chain(self.env.from_configmap.iter().map(|r| &r.source))
            .map(|name| ("reference", name));

        for (what, name) in names.into_iter().chain(refs) {
            if name.len() > 253 || !DNS_LABEL_RE.is_match(name) {
                return Err(ManifestError::InvalidName(what, name.clone()));
            }
        }

        if let Workload::Backup { schedule, .. } = &self.workload {
            if schedule.split_whitespace().count() != 5 {
                return Err(ManifestError::InvalidSchedule(schedule.clone()));
            }
        }
        Ok(())
    }

    fn metadata(&self) -> ObjectMeta {
        ObjectMeta {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        }
    }

    fn pod_template(&self) -> PodTemplate {
        let (command, args) = match &self.workload {
            Workload::Backup { args, .. } => ("backup", args.clone()),
            Workload::Restore { snapshot, args } => {
                let mut restore_args = vec![snapshot.clone()];
                restore_args.extend(args.iter().cloned());
                ("restore", restore_args)
            }
        };

        let container = Container {
            name: command,
            image: self.image.clone(),
            env_from: self.env_from(),
            env: self.env_vars(),
            args: std::iter::once(command.to_string()).chain(args).collect(),
            volume_mounts: vec![
                VolumeMount {
                    name: DATA_VOLUME,
                    mount_path: crate::odoo::DEFAULT_DATA_DIR,
                },
                VolumeMount {
                    name: CACHE_VOLUME,
                    mount_path: crate::backends::kopia::DEFAULT_ROOT,
                },
                VolumeMount {
                    name: DUMP_VOLUME,
                    mount_path: crate::odoo::DEFAULT_DUMP_DIR,
                },
            ],
            resources: Resources {
                requests: Quantities {
                    memory: self.resources.memory_request.clone(),
                    cpu: self.resources.cpu_request.clone(),
                },
                limits: Quantities {
                    memory: self.resources.memory_limit.clone(),
                    cpu: self.resources.cpu_limit.clone(),
                },
            },
        };

        PodTemplate {
            spec: PodSpec {
                restart_policy: "Never",
                security_context: SecurityContext {
                    run_as_user: self.security.run_as_user,
                    run_as_group: self.security.run_as_group,
                    fs_group: self.security.fs_group,
                },
                containers: vec![container],
                volumes: vec![
                    Volume::claim(DATA_VOLUME, &self.data_pvc),
                    Volume::ephemeral(CACHE_VOLUME, &self.ephemeral.kopia_cache),
                    Volume::ephemeral(DUMP_VOLUME, &self.ephemeral.postgres_dump),
                ],
            },
        }
    }

    fn env_from(&self) -> Vec<EnvFromSource> {
        let secrets = self.env.secret_refs.iter().map(|name| EnvFromSource {
            secret_ref: Some(NameRef { name: name.clone() }),
            ..Default::default()
        });
        let configmaps = self.env.configmap_refs.iter().map(|name| EnvFromSource {
            config_map_ref: Some(NameRef { name: name.clone() }),
            ..Default::default()
        });
        secrets.chain(configmaps).collect()
    }

    fn env_vars(&self) -> Vec<EnvVar> {
        let key_ref = |r: &EnvKeyRef| KeyRef {
            name: r.source.clone(),
            key: r.key.clone(),
        };

        let literals = self.env.literals.iter().map(|literal| EnvVar {
            name: literal.name.clone(),
            value: Some(literal.value.clone()),
            value_from: None,
        });
        let secrets = self.env.from_secret.iter().map(|r| EnvVar {
            name: r.name.clone(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(key_ref(r)),
                ..Default::default()
            }),
        });
        let configmaps = self.env.from_configmap.iter().map(|r| EnvVar {
            name: r.name.clone(),
            value: None,
            value_from: Some(EnvVarSource {
                config_map_key_ref: Some(key_ref(r)),
                ..Default::default()
            }),
        });
        literals.chain(secrets).chain(configmaps).collect()
    }
}

/// Renders `spec` as a single YAML document.
pub fn render(spec: &ManifestSpec) -> Result<String, ManifestError> {
    spec.validate()?;

    let yaml = match &spec.workload {
        Workload::Backup { schedule, .. } => serde_yaml::to_string(&CronJob {
            api_version: API_VERSION,
            kind: "CronJob",
            metadata: spec.metadata(),
            spec: CronJobSpec {
                schedule: schedule.clone(),
                concurrency_policy: "Forbid",
                job_template: JobTemplate {
                    spec: JobSpec {
                        backoff_limit: 0,
                        ttl_seconds_after_finished: None,
                        template: spec.pod_template(),
                    },
                },
            },
        }),
        Workload::Restore { .. } => serde_yaml::to_string(&Job {
            api_version: API_VERSION,
            kind: "Job",
            metadata: spec.metadata(),
            spec: JobSpec {
                backoff_limit: 0,
                ttl_seconds_after_finished: Some(JOB_TTL_SECONDS),
                template: spec.pod_template(),
            },
        }),
    };
    yaml.map_err(ManifestError::Render)
}
