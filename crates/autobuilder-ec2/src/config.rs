//! Farm configuration
//!
//! The farm is described by a JSON file listing every worker. Workers with an
//! `ec2` section are latent; the rest are permanently connected. Loading
//! validates every worker up front so that a bad definition is reported at
//! startup rather than on first use.

use crate::aws::ec2::BlockDevice;
use crate::error::ConfigError;
use crate::spot::SpotPricing;
use crate::worker::{
    ImageSelector, InstanceSizing, LatentWorkerSpec, QuarantinePolicy, Worker, WorkerKind,
    WorkerTimeouts,
};
use autobuilder_common::defaults::{
    DEFAULT_IO1_IOPS, DEFAULT_MISSING_TIMEOUT, DEFAULT_ON_DEMAND_BUILD_WAIT_TIMEOUT,
    DEFAULT_QUARANTINE_INITIAL_TIMEOUT, DEFAULT_QUARANTINE_MAX_TIMEOUT, DEFAULT_READY_TIMEOUT,
    DEFAULT_SPOT_BUILD_WAIT_TIMEOUT, default_max_builds, default_product_description,
    default_scratch_device, default_scratch_size, default_scratch_volume_type,
};
use rand::Rng;
use rand::distr::Alphanumeric;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable overriding the master address given to workers
pub const MASTER_IP_ENV: &str = "MASTER_IP_ADDRESS";

const GENERATED_PASSWORD_LEN: usize = 16;

/// Top-level farm file
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FarmConfig {
    /// AWS region every latent worker lives in
    pub region: String,
    #[serde(default)]
    pub aws_profile: Option<String>,
    #[serde(default)]
    pub master: MasterConfig,
    pub workers: Vec<WorkerConfig>,
    /// Directory relative template paths are resolved against
    #[serde(skip)]
    base_dir: PathBuf,
}

/// How workers reach the build master
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MasterConfig {
    pub ip: Option<String>,
    pub hostname: Option<String>,
    pub fqdn: Option<String>,
}

/// Resolved master addressing, exposed to user data templates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterInfo {
    pub ip: Option<String>,
    pub hostname: String,
    pub fqdn: String,
}

impl MasterConfig {
    /// Resolve against an optional address override
    pub fn resolve(&self, ip_override: Option<String>) -> MasterInfo {
        let hostname = self
            .hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string());
        MasterInfo {
            ip: ip_override.filter(|ip| !ip.is_empty()).or_else(|| self.ip.clone()),
            fqdn: self.fqdn.clone().unwrap_or_else(|| hostname.clone()),
            hostname,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    pub name: String,
    /// Generated when absent
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_max_builds")]
    pub max_builds: u32,
    #[serde(default)]
    pub ec2: Option<Ec2WorkerConfig>,
}

/// Latent worker parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Ec2WorkerConfig {
    #[serde(default)]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub instance_types: Option<Vec<String>>,

    #[serde(default)]
    pub ami: Option<String>,
    #[serde(default)]
    pub ami_owners: Vec<String>,
    #[serde(default)]
    pub ami_name_regex: Option<String>,

    #[serde(default)]
    pub subnet_id: Option<String>,
    #[serde(default)]
    pub subnet_ids: Option<Vec<String>>,
    /// Availability zone letter, appended to the region
    #[serde(default)]
    pub placement: Option<String>,

    #[serde(default)]
    pub security_group_ids: Vec<String>,
    #[serde(default)]
    pub keypair_name: Option<String>,
    #[serde(default)]
    pub instance_profile_name: Option<String>,
    #[serde(default)]
    pub elastic_ip: Option<String>,
    #[serde(default)]
    pub disassociate_dynamic_addresses: bool,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub scratch_volume: Option<ScratchVolumeConfig>,

    #[serde(default)]
    pub spot_instance: bool,
    #[serde(default)]
    pub max_spot_price: Option<f64>,
    #[serde(default)]
    pub price_multiplier: Option<f64>,
    #[serde(default = "default_product_description")]
    pub product_description: String,

    #[serde(default, with = "humantime_serde")]
    pub build_wait_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub ready_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub missing_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub quarantine_initial_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub quarantine_max_timeout: Option<Duration>,

    /// Template for the boot payload, relative to the config file
    #[serde(default)]
    pub user_data_template: Option<PathBuf>,
    /// Extra template variables, overriding the built-in ones
    #[serde(default)]
    pub user_data_context: serde_json::Map<String, serde_json::Value>,
}

/// Extra EBS volume for build scratch space
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScratchVolumeConfig {
    #[serde(default = "default_scratch_device")]
    pub device_name: String,
    #[serde(default = "default_scratch_size")]
    pub size: i32,
    #[serde(default = "default_scratch_volume_type")]
    pub volume_type: String,
    #[serde(default)]
    pub iops: Option<i32>,
    #[serde(default)]
    pub encrypted: bool,
}

impl ScratchVolumeConfig {
    fn block_device(&self) -> BlockDevice {
        let iops = match self.volume_type.as_str() {
            "io1" => Some(self.iops.unwrap_or(DEFAULT_IO1_IOPS)),
            _ => self.iops,
        };
        BlockDevice {
            device_name: self.device_name.clone(),
            size_gib: self.size,
            volume_type: self.volume_type.clone(),
            iops,
            encrypted: self.encrypted,
        }
    }
}

impl FarmConfig {
    /// Read and parse a farm file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: FarmConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        debug!(path = %path.display(), workers = config.workers.len(), "Loaded farm config");
        Ok(config)
    }

    /// Master addressing, honouring `MASTER_IP_ADDRESS`
    pub fn master_info(&self) -> MasterInfo {
        self.master.resolve(std::env::var(MASTER_IP_ENV).ok())
    }

    /// Validate every worker and build its runtime definition
    pub fn into_workers(self) -> Result<Vec<Worker>, ConfigError> {
        let master = self.master_info();
        self.build_workers(&master)
    }

    fn build_workers(&self, master: &MasterInfo) -> Result<Vec<Worker>, ConfigError> {
        let mut seen = HashSet::new();
        let mut workers = Vec::with_capacity(self.workers.len());

        for wc in &self.workers {
            if !seen.insert(wc.name.as_str()) {
                return Err(ConfigError::DuplicateWorker(wc.name.clone()));
            }
            workers.push(self.build_worker(wc, master)?);
        }

        Ok(workers)
    }

    fn build_worker(&self, wc: &WorkerConfig, master: &MasterInfo) -> Result<Worker, ConfigError> {
        if wc.name.trim().is_empty() {
            return Err(ConfigError::invalid(&wc.name, "worker name must not be empty"));
        }
        if wc.max_builds < 1 {
            return Err(ConfigError::invalid(&wc.name, "max_builds must be at least 1"));
        }

        let password = wc.password.clone().unwrap_or_else(generate_password);

        let kind = match &wc.ec2 {
            None => WorkerKind::Fixed,
            Some(ec2) => {
                let spec = self.latent_spec(&wc.name, &password, ec2, master)?;
                WorkerKind::Latent(Box::new(spec))
            }
        };

        Ok(Worker {
            name: wc.name.clone(),
            password,
            max_builds: wc.max_builds,
            kind,
        })
    }

    fn latent_spec(
        &self,
        name: &str,
        password: &str,
        ec2: &Ec2WorkerConfig,
        master: &MasterInfo,
    ) -> Result<LatentWorkerSpec, ConfigError> {
        let zone = ec2
            .placement
            .as_ref()
            .map(|letter| format!("{}{}", self.region, letter));

        if ec2.subnet_id.is_some() && ec2.subnet_ids.is_some() {
            return Err(ConfigError::invalid(
                name,
                "specify only one of subnet_id, subnet_ids",
            ));
        }

        let sizing = if ec2.spot_instance {
            spot_sizing(name, ec2, zone)?
        } else {
            fixed_sizing(name, ec2, zone)?
        };

        let build_wait = ec2.build_wait_timeout.unwrap_or(if sizing.is_spot() {
            DEFAULT_SPOT_BUILD_WAIT_TIMEOUT
        } else {
            DEFAULT_ON_DEMAND_BUILD_WAIT_TIMEOUT
        });

        let quarantine = QuarantinePolicy {
            initial: ec2
                .quarantine_initial_timeout
                .unwrap_or(DEFAULT_QUARANTINE_INITIAL_TIMEOUT),
            max: ec2
                .quarantine_max_timeout
                .unwrap_or(DEFAULT_QUARANTINE_MAX_TIMEOUT),
        };
        if quarantine.initial.is_zero() || quarantine.max < quarantine.initial {
            return Err(ConfigError::invalid(
                name,
                "quarantine timeouts must satisfy 0 < initial <= max",
            ));
        }

        Ok(LatentWorkerSpec {
            image: image_selector(name, ec2)?,
            sizing,
            security_group_ids: ec2.security_group_ids.clone(),
            keypair_name: ec2.keypair_name.clone(),
            instance_profile_name: ec2.instance_profile_name.clone(),
            user_data: self.render_user_data(name, password, ec2, master)?,
            block_devices: ec2
                .scratch_volume
                .iter()
                .map(ScratchVolumeConfig::block_device)
                .collect(),
            elastic_ip: ec2.elastic_ip.clone(),
            disassociate_dynamic_addresses: ec2.disassociate_dynamic_addresses,
            tags: ec2.tags.clone(),
            timeouts: WorkerTimeouts {
                build_wait,
                ready: ec2.ready_timeout.unwrap_or(DEFAULT_READY_TIMEOUT),
                missing: ec2.missing_timeout.unwrap_or(DEFAULT_MISSING_TIMEOUT),
            },
            quarantine,
        })
    }

    /// Boot payload: the template when one is configured, else a plain
    /// `KEY="value"` block naming the worker, its secret and the master
    fn render_user_data(
        &self,
        name: &str,
        password: &str,
        ec2: &Ec2WorkerConfig,
        master: &MasterInfo,
    ) -> Result<String, ConfigError> {
        let Some(template) = &ec2.user_data_template else {
            let ip = master.ip.as_deref().ok_or_else(|| {
                ConfigError::invalid(
                    name,
                    format!("master address unknown; set master.ip or {MASTER_IP_ENV}"),
                )
            })?;
            return Ok(format!(
                "WORKERNAME=\"{name}\"\nWORKERSECRET=\"{password}\"\nMASTER=\"{ip}\"\n"
            ));
        };

        let path = self.base_dir.join(template);
        let source = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;

        let mut ctx = serde_json::Map::new();
        ctx.insert("workername".into(), name.into());
        ctx.insert("workersecret".into(), password.into());
        ctx.insert(
            "master_ip".into(),
            master.ip.clone().map_or(serde_json::Value::Null, Into::into),
        );
        ctx.insert("master_hostname".into(), master.hostname.clone().into());
        ctx.insert("master_fqdn".into(), master.fqdn.clone().into());
        ctx.insert("extra_packages".into(), serde_json::Value::Array(vec![]));
        ctx.insert("extra_cmds".into(), serde_json::Value::Array(vec![]));
        ctx.extend(ec2.user_data_context.clone());

        let mut env = minijinja::Environment::new();
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
        env.render_str(&source, ctx)
            .map_err(|source| ConfigError::Template {
                worker: name.to_string(),
                source,
            })
    }
}

/// Look up a worker by name
pub fn find_worker<'a>(workers: &'a [Worker], name: &str) -> Result<&'a Worker, ConfigError> {
    workers
        .iter()
        .find(|w| w.name == name)
        .ok_or_else(|| ConfigError::UnknownWorker(name.to_string()))
}

fn generate_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

fn image_selector(name: &str, ec2: &Ec2WorkerConfig) -> Result<ImageSelector, ConfigError> {
    let lookup = !ec2.ami_owners.is_empty() || ec2.ami_name_regex.is_some();
    match (&ec2.ami, lookup) {
        (Some(_), true) => Err(ConfigError::invalid(
            name,
            "specify either ami or ami_owners/ami_name_regex, not both",
        )),
        (Some(ami), false) => Ok(ImageSelector::Id(ami.clone())),
        (None, true) => {
            let name_regex = ec2
                .ami_name_regex
                .as_deref()
                .map(Regex::new)
                .transpose()
                .map_err(|source| ConfigError::Regex {
                    worker: name.to_string(),
                    source,
                })?;
            Ok(ImageSelector::Lookup {
                owners: ec2.ami_owners.clone(),
                name_regex,
            })
        }
        (None, false) => Err(ConfigError::invalid(
            name,
            "missing ami (or ami_owners/ami_name_regex)",
        )),
    }
}

fn fixed_sizing(
    name: &str,
    ec2: &Ec2WorkerConfig,
    zone: Option<String>,
) -> Result<InstanceSizing, ConfigError> {
    if ec2.instance_types.is_some() {
        return Err(ConfigError::invalid(
            name,
            "instance_types only valid for spot instance workers",
        ));
    }
    if ec2.subnet_ids.is_some() {
        return Err(ConfigError::invalid(
            name,
            "subnet_ids only valid for spot instance workers",
        ));
    }
    let instance_type = ec2
        .instance_type
        .clone()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ConfigError::invalid(name, "invalid instance_type"))?;

    Ok(InstanceSizing::Fixed {
        instance_type,
        subnet_id: ec2.subnet_id.clone(),
        zone,
    })
}

fn spot_sizing(
    name: &str,
    ec2: &Ec2WorkerConfig,
    zone: Option<String>,
) -> Result<InstanceSizing, ConfigError> {
    let instance_types = match (&ec2.instance_type, &ec2.instance_types) {
        (Some(_), Some(_)) => {
            return Err(ConfigError::invalid(
                name,
                "specify only one of instance_type, instance_types for spot instances",
            ));
        }
        (Some(t), None) => vec![t.clone()],
        (None, Some(types)) if !types.is_empty() => types.clone(),
        _ => {
            return Err(ConfigError::invalid(
                name,
                "missing instance_types for spot instance worker",
            ));
        }
    };

    for (label, value) in [
        ("max_spot_price", ec2.max_spot_price),
        ("price_multiplier", ec2.price_multiplier),
    ] {
        if value.is_some_and(|v| !(v.is_finite() && v > 0.0)) {
            return Err(ConfigError::invalid(name, format!("{label} must be positive")));
        }
    }

    let pricing = match (ec2.max_spot_price, ec2.price_multiplier) {
        (None, None) => {
            return Err(ConfigError::invalid(
                name,
                "spot instances need max_spot_price, price_multiplier, or both",
            ));
        }
        (Some(max_price), None) => SpotPricing::Flat { max_price },
        (max_price, Some(multiplier)) => SpotPricing::History {
            multiplier,
            max_price,
        },
    };

    let subnet_ids = match (&ec2.subnet_id, &ec2.subnet_ids) {
        (Some(id), _) => vec![id.clone()],
        (None, Some(ids)) => ids.clone(),
        (None, None) => Vec::new(),
    };
    if subnet_ids.is_empty() && zone.is_none() {
        return Err(ConfigError::invalid(
            name,
            "spot instances need subnet_id, subnet_ids or placement",
        ));
    }

    Ok(InstanceSizing::Spot {
        instance_types,
        subnet_ids,
        zone,
        pricing,
        product_description: ec2.product_description.clone(),
    })
}
