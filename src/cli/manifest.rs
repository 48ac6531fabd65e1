use clap::Args;

use crate::kube::{
    EnvKeyRef, EnvLiteral, EnvSpec, EphemeralSizes, ManifestSpec, ResourceSpec, SecuritySpec,
    Workload,
};

/// Options shared by both manifests.
#[derive(Args, Debug)]
pub struct ManifestArgs {
    /// Kubernetes namespace.
    #[arg(long)]
    pub namespace: String,

    /// Container image (e.g. ghcr.io/.../odoo-kopia:1.0.0).
    #[arg(long)]
    pub image: String,

    /// Inject all keys of a Secret via envFrom (repeatable).
    #[arg(long = "secret-ref")]
    pub secret_refs: Vec<String>,

    /// Inject all keys of a ConfigMap via envFrom (repeatable).
    #[arg(long = "configmap-ref")]
    pub configmap_refs: Vec<String>,

    /// Literal env var, NAME=VALUE (repeatable).
    #[arg(long = "env")]
    pub env: Vec<EnvLiteral>,

    /// Single env var from a Secret, NAME=SECRET:KEY (repeatable).
    #[arg(long)]
    pub env_from_secret: Vec<EnvKeyRef>,

    /// Single env var from a ConfigMap, NAME=CONFIGMAP:KEY (repeatable).
    #[arg(long)]
    pub env_from_configmap: Vec<EnvKeyRef>,

    #[arg(long, default_value = "4Gi")]
    pub memory_request: String,

    #[arg(long, default_value = "4Gi")]
    pub memory_limit: String,

    #[arg(long, default_value = "250m")]
    pub cpu_request: String,

    #[arg(long, default_value = "1")]
    pub cpu_limit: String,

    #[arg(long, default_value_t = 1000)]
    pub run_as_user: u32,

    #[arg(long, default_value_t = 1000)]
    pub run_as_group: u32,

    #[arg(long, default_value_t = 1000)]
    pub fs_group: u32,

    /// PVC name of the Odoo data volume.
    #[arg(long)]
    pub filestore_pvc: String,

    /// Ephemeral volume size of the Kopia cache.
    #[arg(long, default_value = "25Gi")]
    pub kopia_cache_size: String,

    /// Ephemeral volume size of the PostgreSQL dumps.
    #[arg(long, default_value = "100Gi")]
    pub postgres_dump_size: String,
}

impl ManifestArgs {
    fn spec(&self, name: &str, workload: Workload) -> ManifestSpec {
        ManifestSpec {
            name: name.to_string(),
            namespace: self.namespace.clone(),
            image: self.image.clone(),
            data_pvc: self.filestore_pvc.clone(),
            env: EnvSpec {
                secret_refs: self.secret_refs.clone(),
                configmap_refs: self.configmap_refs.clone(),
                literals: self.env.clone(),
                from_secret: self.env_from_secret.clone(),
                from_configmap: self.env_from_configmap.clone(),
            },
            resources: ResourceSpec {
                memory_request: self.memory_request.clone(),
                memory_limit: self.memory_limit.clone(),
                cpu_request: self.cpu_request.clone(),
                cpu_limit: self.cpu_limit.clone(),
            },
            security: SecuritySpec {
                run_as_user: self.run_as_user,
                run_as_group: self.run_as_group,
                fs_group: self.fs_group,
            },
            ephemeral: EphemeralSizes {
                kopia_cache: self.kopia_cache_size.clone(),
                postgres_dump: self.postgres_dump_size.clone(),
            },
            workload,
        }
    }
}

#[derive(Args, Debug)]
pub struct BackupManifestArgs {
    /// CronJob resource name.
    #[arg(long, default_value = "kopia-backup")]
    pub name: String,

    /// Cron schedule expression.
    #[arg(long, default_value = "0 0 * * *")]
    pub schedule: String,

    #[command(flatten)]
    pub common: ManifestArgs,

    /// Extra arguments of the backup command (e.g. `-- --keep-latest 10`).
    #[arg(last = true)]
    pub backup_args: Vec<String>,
}

impl BackupManifestArgs {
    pub fn spec(&self) -> ManifestSpec {
        self.common.spec(
            &self.name,
            Workload::Backup {
                schedule: self.schedule.clone(),
                args: self.backup_args.clone(),
            },
        )
    }
}

#[derive(Args, Debug)]
pub struct RestoreManifestArgs {
    /// Job resource name.
    #[arg(long, default_value = "kopia-restore")]
    pub name: String,

    /// Kopia snapshot ID to restore.
    #[arg(long)]
    pub snapshot: String,

    #[command(flatten)]
    pub common: ManifestArgs,

    /// Extra arguments of the restore command (e.g. `-- --postgres-restore`).
    #[arg(last = true)]
    pub restore_args: Vec<String>,
}

impl RestoreManifestArgs {
    pub fn spec(&self) -> ManifestSpec {
        self.common.spec(
            &self.name,
            Workload::Restore {
                snapshot: self.snapshot.clone(),
                args: self.restore_args.clone(),
            },
        )
    }
}
