//! In-memory EC2 double for unit tests

use crate::aws::ec2::{
    AddressInfo, Ec2Operations, ImageInfo, InstanceSnapshot, LaunchSpec, SpotPriceSample,
    SpotRequestSpec, SpotRequestStatus,
};
use crate::spot::SpotPricing;
use crate::worker::{
    ImageSelector, InstanceSizing, LatentWorkerSpec, QuarantinePolicy, WorkerTimeouts,
};
use anyhow::{Result, anyhow};
use autobuilder_common::InstanceState;
use autobuilder_common::defaults::{
    DEFAULT_MISSING_TIMEOUT, DEFAULT_ON_DEMAND_BUILD_WAIT_TIMEOUT, DEFAULT_PRODUCT_DESCRIPTION,
    DEFAULT_QUARANTINE_INITIAL_TIMEOUT, DEFAULT_QUARANTINE_MAX_TIMEOUT, DEFAULT_READY_TIMEOUT,
    DEFAULT_SPOT_BUILD_WAIT_TIMEOUT,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// How a fake spot request behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpotBehaviour {
    /// Stays open until cancelled
    #[default]
    Never,
    /// Fulfilled on the nth status check
    FulfilAfter(u32),
    /// Rejected on the first status check
    Reject,
    /// Launches an instance just as it is cancelled
    FulfilOnCancel,
}

#[derive(Debug, Clone)]
pub struct FakeSpotRequest {
    pub request_id: String,
    pub instance_type: String,
    pub zone: Option<String>,
    pub price: f64,
    pub behaviour: SpotBehaviour,
    pub polls: u32,
    pub cancelled: bool,
    pub instance_id: Option<String>,
    launch: LaunchSpec,
}

#[derive(Debug)]
struct FakeInstance {
    snapshot: InstanceSnapshot,
    /// States reported by successive describes; the last one sticks
    script: VecDeque<InstanceState>,
}

#[derive(Debug, Default)]
struct FakeState {
    next_id: u32,
    images: Vec<ImageInfo>,
    subnets: HashMap<String, String>,
    instances: HashMap<String, FakeInstance>,
    boot_states: Vec<InstanceState>,
    launch_failures: VecDeque<String>,
    launches: Vec<LaunchSpec>,
    terminated: Vec<String>,
    tags: HashMap<String, Vec<(String, String)>>,
    describe_failures: u32,
    terminate_failures: u32,
    disassociate_failures: u32,
    prices: Vec<SpotPriceSample>,
    spot_behaviour: HashMap<(String, String), SpotBehaviour>,
    failing_spot_types: HashSet<String>,
    spot_requests: Vec<FakeSpotRequest>,
    addresses: Vec<AddressInfo>,
    disassociated: Vec<String>,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:04}", self.next_id)
    }

    fn create_instance(&mut self, spec: &LaunchSpec, states: Vec<InstanceState>) -> String {
        let id = self.next_id("i");
        let script: VecDeque<_> = if states.is_empty() {
            VecDeque::from([InstanceState::Running])
        } else {
            states.into()
        };
        self.instances.insert(
            id.clone(),
            FakeInstance {
                snapshot: InstanceSnapshot {
                    instance_id: id.clone(),
                    image_id: Some(spec.image_id.clone()),
                    state: script[0],
                    state_reason: None,
                    instance_type: Some(spec.instance_type.clone()),
                    zone: spec.zone.clone(),
                    subnet_id: spec.subnet_id.clone(),
                    launch_time: Some(Utc::now()),
                },
                script,
            },
        );
        id
    }
}

/// EC2 double keeping every resource in memory.
///
/// Defaults: launched instances are immediately running, spot requests never
/// fulfil, no price history, no addresses.
#[derive(Debug, Default)]
pub struct FakeEc2 {
    state: Mutex<FakeState>,
}

impl FakeEc2 {
    fn with<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    /// Register an existing instance reporting `states` in order
    pub fn add_instance(&self, states: &[InstanceState]) -> String {
        let spec = LaunchSpec {
            image_id: "ami-existing".into(),
            instance_type: "c5.large".into(),
            subnet_id: None,
            zone: None,
            security_group_ids: vec![],
            keypair_name: None,
            instance_profile_name: None,
            user_data: String::new(),
            block_devices: vec![],
            tags: vec![],
        };
        self.with(|s| s.create_instance(&spec, states.to_vec()))
    }

    /// States reported by newly launched or fulfilled instances
    pub fn set_boot_states(&self, states: &[InstanceState]) {
        self.with(|s| s.boot_states = states.to_vec());
    }

    pub fn fail_launches(&self, count: usize, code: &str) {
        self.with(|s| s.launch_failures.extend(std::iter::repeat_n(code.to_string(), count)));
    }

    pub fn fail_describes(&self, count: u32) {
        self.with(|s| s.describe_failures = count);
    }

    pub fn fail_terminates(&self, count: u32) {
        self.with(|s| s.terminate_failures = count);
    }

    pub fn fail_disassociates(&self, count: u32) {
        self.with(|s| s.disassociate_failures = count);
    }

    pub fn add_image(&self, image: ImageInfo) {
        self.with(|s| s.images.push(image));
    }

    pub fn add_subnet(&self, subnet_id: &str, zone: &str) {
        self.with(|s| s.subnets.insert(subnet_id.to_string(), zone.to_string()));
    }

    pub fn add_price(&self, instance_type: &str, zone: &str, price: f64) {
        self.with(|s| {
            s.prices.push(SpotPriceSample {
                instance_type: instance_type.to_string(),
                zone: zone.to_string(),
                price,
                timestamp: Utc::now(),
            })
        });
    }

    pub fn set_spot_behaviour(&self, instance_type: &str, zone: &str, behaviour: SpotBehaviour) {
        self.with(|s| {
            s.spot_behaviour
                .insert((instance_type.to_string(), zone.to_string()), behaviour)
        });
    }

    pub fn fail_spot_requests_for(&self, instance_type: &str) {
        self.with(|s| s.failing_spot_types.insert(instance_type.to_string()));
    }

    pub fn add_elastic_ip(&self, public_ip: &str, allocation_id: &str) {
        self.with(|s| {
            s.addresses.push(AddressInfo {
                public_ip: public_ip.to_string(),
                allocation_id: Some(allocation_id.to_string()),
                association_id: None,
                instance_id: None,
            })
        });
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.with(|s| s.launches.clone())
    }

    pub fn terminated(&self) -> Vec<String> {
        self.with(|s| s.terminated.clone())
    }

    pub fn disassociated(&self) -> Vec<String> {
        self.with(|s| s.disassociated.clone())
    }

    pub fn spot_requests(&self) -> Vec<FakeSpotRequest> {
        self.with(|s| s.spot_requests.clone())
    }

    pub fn tags_of(&self, instance_id: &str) -> Vec<(String, String)> {
        self.with(|s| s.tags.get(instance_id).cloned().unwrap_or_default())
    }

    /// Last reported state of an instance
    pub fn instance_state(&self, instance_id: &str) -> Option<InstanceState> {
        self.with(|s| {
            s.instances.get(instance_id).map(|i| {
                // Report where the script ends up if nobody polls again
                i.script.back().copied().unwrap_or(i.snapshot.state)
            })
        })
    }

    /// Instances launched by cancelled spot requests that were never terminated
    pub fn unclaimed_spot_instances(&self) -> Vec<String> {
        self.with(|s| {
            s.spot_requests
                .iter()
                .filter(|r| r.cancelled)
                .filter_map(|r| r.instance_id.clone())
                .filter(|id| !s.terminated.contains(id))
                .collect()
        })
    }
}

impl Ec2Operations for FakeEc2 {
    async fn list_images(&self, _owners: &[String]) -> Result<Vec<ImageInfo>> {
        Ok(self.with(|s| s.images.clone()))
    }

    async fn subnet_zone(&self, subnet_id: &str) -> Result<String> {
        self.with(|s| s.subnets.get(subnet_id).cloned())
            .ok_or_else(|| anyhow!("InvalidSubnetID.NotFound: {subnet_id}"))
    }

    async fn launch_instance(&self, spec: LaunchSpec) -> Result<String> {
        self.with(|s| {
            if let Some(code) = s.launch_failures.pop_front() {
                return Err(anyhow!("{code}: launch rejected"));
            }
            let states = s.boot_states.clone();
            let id = s.create_instance(&spec, states);
            s.tags.insert(id.clone(), spec.tags.clone());
            s.launches.push(spec);
            Ok(id)
        })
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<Option<InstanceSnapshot>> {
        self.with(|s| {
            if s.describe_failures > 0 {
                s.describe_failures -= 1;
                return Err(anyhow!("RequestLimitExceeded"));
            }
            let Some(instance) = s.instances.get_mut(instance_id) else {
                return Ok(None);
            };
            if let Some(&state) = instance.script.front() {
                instance.snapshot.state = state;
            }
            if instance.script.len() > 1 {
                instance.script.pop_front();
            }
            Ok(Some(instance.snapshot.clone()))
        })
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        self.with(|s| {
            if s.terminate_failures > 0 {
                s.terminate_failures -= 1;
                return Err(anyhow!("RequestLimitExceeded"));
            }
            let Some(instance) = s.instances.get_mut(instance_id) else {
                return Err(anyhow!("InvalidInstanceID.NotFound: {instance_id}"));
            };
            instance.script = VecDeque::from([InstanceState::ShuttingDown, InstanceState::Terminated]);
            s.terminated.push(instance_id.to_string());
            Ok(())
        })
    }

    async fn tag_instance(&self, instance_id: &str, tags: &[(String, String)]) -> Result<()> {
        self.with(|s| {
            s.tags
                .entry(instance_id.to_string())
                .or_default()
                .extend(tags.iter().cloned());
        });
        Ok(())
    }

    async fn spot_price_history(
        &self,
        instance_types: &[String],
        zones: &[String],
        _product_description: &str,
        _since: DateTime<Utc>,
    ) -> Result<Vec<SpotPriceSample>> {
        Ok(self.with(|s| {
            s.prices
                .iter()
                .filter(|p| instance_types.contains(&p.instance_type) && zones.contains(&p.zone))
                .cloned()
                .collect()
        }))
    }

    async fn request_spot_instance(&self, spec: SpotRequestSpec) -> Result<String> {
        self.with(|s| {
            if s.failing_spot_types.contains(&spec.launch.instance_type) {
                return Err(anyhow!("InsufficientInstanceCapacity"));
            }
            let behaviour = spec
                .launch
                .zone
                .as_ref()
                .and_then(|z| {
                    s.spot_behaviour
                        .get(&(spec.launch.instance_type.clone(), z.clone()))
                        .copied()
                })
                .unwrap_or_default();
            let request_id = s.next_id("sir");
            s.spot_requests.push(FakeSpotRequest {
                request_id: request_id.clone(),
                instance_type: spec.launch.instance_type.clone(),
                zone: spec.launch.zone.clone(),
                price: spec.price,
                behaviour,
                polls: 0,
                cancelled: false,
                instance_id: None,
                launch: spec.launch,
            });
            Ok(request_id)
        })
    }

    async fn describe_spot_request(&self, request_id: &str) -> Result<SpotRequestStatus> {
        self.with(|s| {
            let boot_states = s.boot_states.clone();
            let idx = s
                .spot_requests
                .iter()
                .position(|r| r.request_id == request_id)
                .ok_or_else(|| anyhow!("InvalidSpotInstanceRequestID.NotFound"))?;

            s.spot_requests[idx].polls += 1;
            let request = s.spot_requests[idx].clone();

            if let Some(instance_id) = request.instance_id {
                return Ok(SpotRequestStatus::Fulfilled { instance_id });
            }

            match request.behaviour {
                SpotBehaviour::FulfilAfter(n) if !request.cancelled && request.polls >= n => {
                    let instance_id = s.create_instance(&request.launch, boot_states);
                    s.spot_requests[idx].instance_id = Some(instance_id.clone());
                    Ok(SpotRequestStatus::Fulfilled { instance_id })
                }
                SpotBehaviour::Reject => Ok(SpotRequestStatus::Rejected {
                    status_code: Some("bad-parameters".into()),
                    instance_id: None,
                }),
                _ if request.cancelled => Ok(SpotRequestStatus::Rejected {
                    status_code: Some("canceled-before-fulfillment".into()),
                    instance_id: None,
                }),
                _ => Ok(SpotRequestStatus::Open {
                    status_code: Some("pending-evaluation".into()),
                }),
            }
        })
    }

    async fn cancel_spot_request(&self, request_id: &str) -> Result<()> {
        self.with(|s| {
            let boot_states = s.boot_states.clone();
            let idx = s
                .spot_requests
                .iter()
                .position(|r| r.request_id == request_id)
                .ok_or_else(|| anyhow!("InvalidSpotInstanceRequestID.NotFound"))?;
            s.spot_requests[idx].cancelled = true;

            let request = s.spot_requests[idx].clone();
            if request.behaviour == SpotBehaviour::FulfilOnCancel && request.instance_id.is_none() {
                let instance_id = s.create_instance(&request.launch, boot_states);
                s.spot_requests[idx].instance_id = Some(instance_id);
            }
            Ok(())
        })
    }

    async fn find_elastic_ip(&self, public_ip: &str) -> Result<Option<AddressInfo>> {
        Ok(self.with(|s| s.addresses.iter().find(|a| a.public_ip == public_ip).cloned()))
    }

    async fn addresses_for_instance(&self, instance_id: &str) -> Result<Vec<AddressInfo>> {
        Ok(self.with(|s| {
            s.addresses
                .iter()
                .filter(|a| a.instance_id.as_deref() == Some(instance_id))
                .cloned()
                .collect()
        }))
    }

    async fn associate_address(&self, allocation_id: &str, instance_id: &str) -> Result<String> {
        self.with(|s| {
            let association_id = s.next_id("eipassoc");
            let address = s
                .addresses
                .iter_mut()
                .find(|a| a.allocation_id.as_deref() == Some(allocation_id))
                .ok_or_else(|| anyhow!("InvalidAllocationID.NotFound: {allocation_id}"))?;
            address.association_id = Some(association_id.clone());
            address.instance_id = Some(instance_id.to_string());
            Ok(association_id)
        })
    }

    async fn disassociate_address(&self, association_id: &str) -> Result<()> {
        self.with(|s| {
            if s.disassociate_failures > 0 {
                s.disassociate_failures -= 1;
                return Err(anyhow!("RequestLimitExceeded"));
            }
            let address = s
                .addresses
                .iter_mut()
                .find(|a| a.association_id.as_deref() == Some(association_id))
                .ok_or_else(|| anyhow!("InvalidAssociationID.NotFound: {association_id}"))?;
            address.association_id = None;
            address.instance_id = None;
            s.disassociated.push(association_id.to_string());
            Ok(())
        })
    }
}

fn base_spec(sizing: InstanceSizing, build_wait: std::time::Duration) -> LatentWorkerSpec {
    LatentWorkerSpec {
        image: ImageSelector::Id("ami-test".into()),
        sizing,
        security_group_ids: vec!["sg-test".into()],
        keypair_name: None,
        instance_profile_name: None,
        user_data: "WORKERNAME=\"w\"\n".into(),
        block_devices: vec![],
        elastic_ip: None,
        disassociate_dynamic_addresses: false,
        tags: BTreeMap::new(),
        timeouts: WorkerTimeouts {
            build_wait,
            ready: DEFAULT_READY_TIMEOUT,
            missing: DEFAULT_MISSING_TIMEOUT,
        },
        quarantine: QuarantinePolicy {
            initial: DEFAULT_QUARANTINE_INITIAL_TIMEOUT,
            max: DEFAULT_QUARANTINE_MAX_TIMEOUT,
        },
    }
}

/// On-demand worker spec with default timeouts
pub fn fixed_spec(instance_type: &str, subnet_id: Option<&str>) -> LatentWorkerSpec {
    base_spec(
        InstanceSizing::Fixed {
            instance_type: instance_type.to_string(),
            subnet_id: subnet_id.map(str::to_string),
            zone: None,
        },
        DEFAULT_ON_DEMAND_BUILD_WAIT_TIMEOUT,
    )
}

/// Spot worker spec with default timeouts
pub fn spot_spec(instance_types: &[&str], subnet_ids: &[&str], pricing: SpotPricing) -> LatentWorkerSpec {
    base_spec(
        InstanceSizing::Spot {
            instance_types: instance_types.iter().map(|s| s.to_string()).collect(),
            subnet_ids: subnet_ids.iter().map(|s| s.to_string()).collect(),
            zone: None,
            pricing,
            product_description: DEFAULT_PRODUCT_DESCRIPTION.to_string(),
        },
        DEFAULT_SPOT_BUILD_WAIT_TIMEOUT,
    )
}
