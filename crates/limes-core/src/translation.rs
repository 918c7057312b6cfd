//! Translation rules that reshape subresource and subcapacity payloads into
//! the legacy formats that existing API clients expect.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::names::{AvailabilityZone, LiquidResourceName};

/// Error from applying a translation rule to a payload.
#[derive(Debug, thiserror::Error)]
pub enum TranslationError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("no usage in subcapacity {0:?}")]
    MissingUsage(String),
    #[error("while parsing resource attributes: {0}")]
    ResourceAttributes(serde_json::Error),
}

/// A named translation rule, configured per resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TranslationRule {
    /// Payloads pass through unchanged.
    #[default]
    None,
    CinderVolumes,
    CinderSnapshots,
    CinderManilaCapacity,
    IronicFlavors,
}

/// Context for a single payload: where it came from.
#[derive(Debug, Clone, Copy)]
pub struct TranslationContext<'a> {
    pub az: &'a AvailabilityZone,
    pub resource_name: &'a LiquidResourceName,
    /// Resource attributes as declared by the backend (may be `Null`).
    pub resource_attributes: &'a Value,
}

impl TranslationRule {
    /// Looks up a rule by its configuration name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "" => Some(Self::None),
            "cinder-volumes" => Some(Self::CinderVolumes),
            "cinder-snapshots" => Some(Self::CinderSnapshots),
            "cinder-manila-capacity" => Some(Self::CinderManilaCapacity),
            "ironic-flavors" => Some(Self::IronicFlavors),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self == Self::None
    }

    #[must_use]
    pub fn translates_subresources(self) -> bool {
        matches!(
            self,
            Self::CinderVolumes | Self::CinderSnapshots | Self::IronicFlavors
        )
    }

    #[must_use]
    pub fn translates_subcapacities(self) -> bool {
        matches!(self, Self::CinderManilaCapacity | Self::IronicFlavors)
    }

    /// Rewrites a subresource list. Rules without a subresource translation
    /// return the input unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`TranslationError`] if the payload does not have the shape
    /// expected by the rule.
    pub fn translate_subresources(
        self,
        input: &str,
        ctx: TranslationContext<'_>,
    ) -> Result<String, TranslationError> {
        if input.is_empty() || input == "[]" {
            return Ok(input.to_owned());
        }
        match self {
            Self::CinderVolumes => cinder_volume_subresources(input, ctx),
            Self::CinderSnapshots => cinder_snapshot_subresources(input),
            Self::IronicFlavors => ironic_subresources(input, ctx),
            Self::None | Self::CinderManilaCapacity => Ok(input.to_owned()),
        }
    }

    /// Rewrites a subcapacity list. Rules without a subcapacity translation
    /// return the input unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`TranslationError`] if the payload does not have the shape
    /// expected by the rule.
    pub fn translate_subcapacities(
        self,
        input: &str,
        ctx: TranslationContext<'_>,
    ) -> Result<String, TranslationError> {
        if input.is_empty() || input == "[]" {
            return Ok(input.to_owned());
        }
        match self {
            Self::CinderManilaCapacity => cinder_manila_subcapacities(input, ctx),
            Self::IronicFlavors => ironic_subcapacities(input, ctx),
            Self::None | Self::CinderVolumes | Self::CinderSnapshots => Ok(input.to_owned()),
        }
    }
}

#[derive(Serialize)]
struct SizeWithUnit {
    value: u64,
    unit: &'static str,
}

impl SizeWithUnit {
    fn gib(value: u64) -> Self {
        Self { value, unit: "GiB" }
    }

    fn mib(value: u64) -> Self {
        Self { value, unit: "MiB" }
    }
}

// ── Cinder ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct VolumeAttributes {
    #[serde(default)]
    size_gib: u64,
    #[serde(default)]
    status: String,
    #[serde(default)]
    volume_id: String,
}

#[derive(Deserialize)]
struct ItemWithAttributes<A> {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    attributes: A,
}

fn cinder_volume_subresources(
    input: &str,
    ctx: TranslationContext<'_>,
) -> Result<String, TranslationError> {
    #[derive(Serialize)]
    struct Legacy<'a> {
        id: String,
        name: String,
        status: String,
        size: SizeWithUnit,
        availability_zone: &'a AvailabilityZone,
    }

    let items: Vec<ItemWithAttributes<VolumeAttributes>> = serde_json::from_str(input)?;
    let out: Vec<Legacy<'_>> = items
        .into_iter()
        .map(|item| Legacy {
            id: item.id,
            name: item.name,
            status: item.attributes.status,
            size: SizeWithUnit::gib(item.attributes.size_gib),
            availability_zone: ctx.az,
        })
        .collect();
    Ok(serde_json::to_string(&out)?)
}

fn cinder_snapshot_subresources(input: &str) -> Result<String, TranslationError> {
    #[derive(Serialize)]
    struct Legacy {
        id: String,
        name: String,
        status: String,
        size: SizeWithUnit,
        volume_id: String,
    }

    let items: Vec<ItemWithAttributes<VolumeAttributes>> = serde_json::from_str(input)?;
    let out: Vec<Legacy> = items
        .into_iter()
        .map(|item| Legacy {
            id: item.id,
            name: item.name,
            status: item.attributes.status,
            size: SizeWithUnit::gib(item.attributes.size_gib),
            volume_id: item.attributes.volume_id,
        })
        .collect();
    Ok(serde_json::to_string(&out)?)
}

fn cinder_manila_subcapacities(
    input: &str,
    ctx: TranslationContext<'_>,
) -> Result<String, TranslationError> {
    #[derive(Deserialize, Default)]
    struct PoolAttributes {
        #[serde(default)]
        exclusion_reason: String,
        #[serde(default)]
        real_capacity: u64,
    }
    #[derive(Deserialize)]
    struct Pool {
        #[serde(default)]
        name: String,
        #[serde(default)]
        capacity: u64,
        usage: Option<u64>,
        #[serde(default)]
        attributes: PoolAttributes,
    }
    #[derive(Serialize)]
    struct Legacy<'a> {
        pool_name: String,
        az: &'a AvailabilityZone,
        capacity_gib: u64,
        usage_gib: u64,
        exclusion_reason: String,
    }

    let pools: Vec<Pool> = serde_json::from_str(input)?;
    let mut out = Vec::with_capacity(pools.len());
    for pool in pools {
        let usage = pool
            .usage
            .ok_or_else(|| TranslationError::MissingUsage(pool.name.clone()))?;
        let capacity = if pool.attributes.exclusion_reason.is_empty() {
            pool.capacity
        } else {
            pool.attributes.real_capacity
        };
        out.push(Legacy {
            pool_name: pool.name,
            az: ctx.az,
            capacity_gib: capacity,
            usage_gib: usage,
            exclusion_reason: pool.attributes.exclusion_reason,
        });
    }
    Ok(serde_json::to_string(&out)?)
}

// ── Ironic ──────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
struct FlavorAttributes {
    #[serde(default)]
    cores: u64,
    #[serde(default)]
    ram_mib: u64,
    #[serde(default)]
    disk_gib: u64,
}

fn flavor_attributes(ctx: TranslationContext<'_>) -> Result<FlavorAttributes, TranslationError> {
    if ctx.resource_attributes.is_null() {
        return Ok(FlavorAttributes::default());
    }
    FlavorAttributes::deserialize(ctx.resource_attributes)
        .map_err(TranslationError::ResourceAttributes)
}

fn ironic_subcapacities(
    input: &str,
    ctx: TranslationContext<'_>,
) -> Result<String, TranslationError> {
    #[derive(Deserialize, Default)]
    struct NodeAttributes {
        #[serde(default)]
        provision_state: String,
        target_provision_state: Option<String>,
        #[serde(default)]
        serial_number: String,
        instance_id: Option<String>,
    }
    #[derive(Serialize)]
    struct Legacy<'a> {
        id: String,
        name: String,
        #[serde(skip_serializing_if = "String::is_empty")]
        provision_state: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        target_provision_state: Option<String>,
        availability_zone: &'a AvailabilityZone,
        #[serde(skip_serializing_if = "Option::is_none")]
        ram: Option<SizeWithUnit>,
        #[serde(skip_serializing_if = "Option::is_none")]
        disk: Option<SizeWithUnit>,
        #[serde(skip_serializing_if = "is_zero")]
        cores: u64,
        #[serde(rename = "serial", skip_serializing_if = "String::is_empty")]
        serial_number: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        instance_id: Option<String>,
    }

    let flavor = flavor_attributes(ctx)?;
    let nodes: Vec<ItemWithAttributes<NodeAttributes>> = serde_json::from_str(input)?;
    let out: Vec<Legacy<'_>> = nodes
        .into_iter()
        .map(|node| Legacy {
            id: node.id,
            name: node.name,
            provision_state: node.attributes.provision_state,
            target_provision_state: node.attributes.target_provision_state,
            availability_zone: ctx.az,
            ram: (flavor.ram_mib > 0).then(|| SizeWithUnit::mib(flavor.ram_mib)),
            disk: (flavor.disk_gib > 0).then(|| SizeWithUnit::gib(flavor.disk_gib)),
            cores: flavor.cores,
            serial_number: node.attributes.serial_number,
            instance_id: node.attributes.instance_id,
        })
        .collect();
    Ok(serde_json::to_string(&out)?)
}

fn ironic_subresources(input: &str, ctx: TranslationContext<'_>) -> Result<String, TranslationError> {
    #[derive(Deserialize, Default)]
    struct InstanceAttributes {
        #[serde(default)]
        status: String,
        #[serde(default)]
        metadata: serde_json::Map<String, Value>,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default)]
        os_type: String,
    }
    #[derive(Serialize)]
    struct Legacy<'a> {
        id: String,
        name: String,
        status: String,
        metadata: serde_json::Map<String, Value>,
        tags: Vec<String>,
        availability_zone: &'a AvailabilityZone,
        hypervisor: &'static str,
        flavor: &'a str,
        vcpu: u64,
        ram: SizeWithUnit,
        disk: SizeWithUnit,
        os_type: String,
    }

    let flavor = flavor_attributes(ctx)?;
    let flavor_name = ctx
        .resource_name
        .as_str()
        .strip_prefix("instances_")
        .unwrap_or(ctx.resource_name.as_str());
    let instances: Vec<ItemWithAttributes<InstanceAttributes>> = serde_json::from_str(input)?;
    let out: Vec<Legacy<'_>> = instances
        .into_iter()
        .map(|inst| Legacy {
            id: inst.id,
            name: inst.name,
            status: inst.attributes.status,
            metadata: inst.attributes.metadata,
            tags: inst.attributes.tags,
            availability_zone: ctx.az,
            // baremetal has no hypervisor
            hypervisor: "none",
            flavor: flavor_name,
            vcpu: flavor.cores,
            ram: SizeWithUnit::mib(flavor.ram_mib),
            disk: SizeWithUnit::gib(flavor.disk_gib),
            os_type: inst.attributes.os_type,
        })
        .collect();
    Ok(serde_json::to_string(&out)?)
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(value: &u64) -> bool {
    *value == 0
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn ctx<'a>(az: &'a AvailabilityZone, res: &'a LiquidResourceName, attrs: &'a Value) -> TranslationContext<'a> {
        TranslationContext {
            az,
            resource_name: res,
            resource_attributes: attrs,
        }
    }

    #[test]
    fn rule_names() {
        assert_eq!(TranslationRule::from_name(""), Some(TranslationRule::None));
        assert_eq!(
            TranslationRule::from_name("ironic-flavors"),
            Some(TranslationRule::IronicFlavors)
        );
        assert_eq!(TranslationRule::from_name("nonsense"), None);
    }

    #[test]
    fn empty_payloads_pass_through() {
        let az = AvailabilityZone::new("az-one");
        let res = LiquidResourceName::new("capacity");
        let attrs = Value::Null;
        let rule = TranslationRule::CinderVolumes;
        assert_eq!(rule.translate_subresources("[]", ctx(&az, &res, &attrs)).unwrap(), "[]");
        assert_eq!(rule.translate_subresources("", ctx(&az, &res, &attrs)).unwrap(), "");
    }

    #[test]
    fn cinder_volumes_get_legacy_shape() {
        let az = AvailabilityZone::new("az-one");
        let res = LiquidResourceName::new("capacity");
        let attrs = Value::Null;
        let input = r#"[{"id":"v1","name":"vol","attributes":{"size_gib":10,"status":"available"}}]"#;
        let out = TranslationRule::CinderVolumes
            .translate_subresources(input, ctx(&az, &res, &attrs))
            .unwrap();
        assert_eq!(
            out,
            r#"[{"id":"v1","name":"vol","status":"available","size":{"value":10,"unit":"GiB"},"availability_zone":"az-one"}]"#
        );
    }

    #[test]
    fn manila_capacity_uses_real_capacity_when_excluded() {
        let az = AvailabilityZone::new("az-one");
        let res = LiquidResourceName::new("capacity");
        let attrs = Value::Null;
        let input = r#"[{"name":"pool1","capacity":0,"usage":5,"attributes":{"exclusion_reason":"hardware","real_capacity":50}}]"#;
        let out = TranslationRule::CinderManilaCapacity
            .translate_subcapacities(input, ctx(&az, &res, &attrs))
            .unwrap();
        assert_eq!(
            out,
            r#"[{"pool_name":"pool1","az":"az-one","capacity_gib":50,"usage_gib":5,"exclusion_reason":"hardware"}]"#
        );
    }

    #[test]
    fn manila_capacity_requires_usage() {
        let az = AvailabilityZone::new("az-one");
        let res = LiquidResourceName::new("capacity");
        let attrs = Value::Null;
        let input = r#"[{"name":"pool1","capacity":10}]"#;
        let err = TranslationRule::CinderManilaCapacity
            .translate_subcapacities(input, ctx(&az, &res, &attrs))
            .unwrap_err();
        assert!(matches!(err, TranslationError::MissingUsage(_)));
    }

    #[test]
    fn ironic_subresources_carry_flavor_data() {
        let az = AvailabilityZone::new("az-one");
        let res = LiquidResourceName::new("instances_baremetal");
        let attrs = serde_json::json!({"cores": 8, "ram_mib": 1024, "disk_gib": 100});
        let input = r#"[{"id":"i1","name":"node","attributes":{"status":"ACTIVE","os_type":"linux"}}]"#;
        let out = TranslationRule::IronicFlavors
            .translate_subresources(input, ctx(&az, &res, &attrs))
            .unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed[0]["flavor"], "baremetal");
        assert_eq!(parsed[0]["vcpu"], 8);
        assert_eq!(parsed[0]["hypervisor"], "none");
        assert_eq!(parsed[0]["ram"]["unit"], "MiB");
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let az = AvailabilityZone::new("az-one");
        let res = LiquidResourceName::new("capacity");
        let attrs = Value::Null;
        let err = TranslationRule::CinderSnapshots
            .translate_subresources("{not json", ctx(&az, &res, &attrs))
            .unwrap_err();
        assert!(matches!(err, TranslationError::Json(_)));
    }
}
