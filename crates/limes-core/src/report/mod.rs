//! Report trees and the assemblers that fold query rows into them.
//!
//! Assemblers are fed typed rows (see [`rows`]) in the order the queries
//! produce them. They never touch the database themselves, so everything in
//! here is testable with hand-written rows.

pub mod cluster;
pub mod domain;
pub mod inconsistency;
pub mod project;
pub mod rates;
pub mod rows;
pub mod scrape_errors;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::ser::Error as _;
use serde::{Serialize, Serializer};
use serde_json::value::RawValue;

use crate::cluster::Cluster;
use crate::filter::Filter;
use crate::name_mapping::NameMapping;
use crate::names::{AvailabilityZone, DbServiceType, LiquidResourceName, ResourceName, ServiceType};
use crate::unit::Unit;

/// Service metadata shared by all report levels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    pub area: String,
}

/// Resource metadata shared by all report levels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceInfo {
    pub name: ResourceName,
    #[serde(skip_serializing_if = "Unit::is_none")]
    pub unit: Unit,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub category: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub externally_managed: bool,
    #[serde(skip)]
    pub no_quota: bool,
}

/// Serializes a keyed map as the list of its values, in key order.
pub(crate) fn serialize_values<K, V, S>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
where
    V: Serialize,
    S: Serializer,
{
    serializer.collect_seq(map.values())
}

/// Emits stored JSON text verbatim.
#[allow(clippy::ptr_arg)]
pub(crate) fn serialize_raw_json<S: Serializer>(json: &String, serializer: S) -> Result<S::Ok, S::Error> {
    let raw: &RawValue = serde_json::from_str(json).map_err(S::Error::custom)?;
    raw.serialize(serializer)
}

#[allow(clippy::trivially_copy_pass_by_ref)]
pub(crate) fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// Appends the items of the JSON list `input` to the JSON list in `target`
/// by splicing the texts. Both must be whitespace-free lists.
pub fn merge_json_list_into(target: &mut String, input: &str) {
    if input.is_empty() || input == "[]" {
        return;
    }
    if target.is_empty() || target == "[]" {
        input.clone_into(target);
        return;
    }
    target.truncate(target.trim_end_matches(']').len());
    target.push(',');
    target.push_str(input.strip_prefix('[').unwrap_or(input));
}

pub(crate) fn merge_min_time(lhs: Option<i64>, rhs: Option<DateTime<Utc>>) -> Option<i64> {
    match (lhs, rhs.map(|t| t.timestamp())) {
        (Some(l), Some(r)) => Some(l.min(r)),
        (l, r) => l.or(r),
    }
}

pub(crate) fn merge_max_time(lhs: Option<i64>, rhs: Option<DateTime<Utc>>) -> Option<i64> {
    match (lhs, rhs.map(|t| t.timestamp())) {
        (Some(l), Some(r)) => Some(l.max(r)),
        (l, r) => l.or(r),
    }
}

/// Splits committed amount against usage into the amount of commitments not
/// covered by usage and the usage not covered by commitments. Both are
/// non-negative and `unused - uncommitted == committed - usage`.
#[must_use]
pub fn commitment_balance(committed: u64, usage: u64) -> (u64, u64) {
    (committed.saturating_sub(usage), usage.saturating_sub(committed))
}

/// Per-AZ report nodes that can tell whether they carry any data.
pub(crate) trait AzEntry {
    fn is_empty(&self) -> bool;
}

/// Drops the `any` and `unknown` buckets if they carry no data and another
/// AZ is present. The last remaining AZ is never dropped.
pub(crate) fn prune_placeholder_azs<T: AzEntry>(per_az: &mut BTreeMap<AvailabilityZone, T>) {
    for placeholder in [AvailabilityZone::ANY, AvailabilityZone::UNKNOWN] {
        if per_az.len() < 2 {
            return;
        }
        if per_az.get(placeholder).is_some_and(AzEntry::is_empty) {
            per_az.remove(placeholder);
        }
    }
}

/// Commitment amounts of one AZ, by duration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitmentsByDuration {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub committed: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub pending_commitments: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub planned_commitments: BTreeMap<String, u64>,
}

impl CommitmentsByDuration {
    pub(crate) fn add(&mut self, row: &rows::CommitmentBreakdownRow) {
        let duration = row.duration.to_string();
        if row.active > 0 {
            self.committed.insert(duration.clone(), row.active);
        }
        if row.pending > 0 {
            self.pending_commitments.insert(duration.clone(), row.pending);
        }
        if row.planned > 0 {
            self.planned_commitments.insert(duration, row.planned);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.committed.is_empty() && self.pending_commitments.is_empty() && self.planned_commitments.is_empty()
    }

    /// Sum of all active commitments.
    #[must_use]
    pub fn total_committed(&self) -> u64 {
        self.committed.values().sum()
    }
}

/// Shared lookups of all assemblers.
#[derive(Debug, Clone, Copy)]
pub struct ReportContext<'a> {
    pub cluster: &'a Cluster,
    pub nm: &'a NameMapping,
    pub filter: &'a Filter,
    pub now: DateTime<Utc>,
}

impl<'a> ReportContext<'a> {
    #[must_use]
    pub fn new(cluster: &'a Cluster, nm: &'a NameMapping, filter: &'a Filter, now: DateTime<Utc>) -> Self {
        Self {
            cluster,
            nm,
            filter,
            now,
        }
    }

    /// API identity of a resource row, or `None` if the row is to be
    /// skipped because the resource is not configured or filtered out.
    pub(crate) fn resolve(
        &self,
        service_type: &DbServiceType,
        resource_name: &LiquidResourceName,
    ) -> Option<(ServiceType, ResourceName)> {
        if !self.cluster.has_resource(service_type, resource_name) {
            return None;
        }
        let (api_service, api_resource) = self.nm.map_resource_to_api(service_type, resource_name)?;
        self.filter
            .includes(&api_service, &api_resource)
            .then_some((api_service, api_resource))
    }

    pub(crate) fn service_info(&self, service_type: &DbServiceType, api_service: &ServiceType) -> ServiceInfo {
        ServiceInfo {
            service_type: api_service.clone(),
            area: self
                .cluster
                .service(service_type)
                .map(|svc| svc.area.clone())
                .unwrap_or_default(),
        }
    }

    pub(crate) fn resource_info(
        &self,
        service_type: &DbServiceType,
        resource_name: &LiquidResourceName,
        api_resource: &ResourceName,
        category: &str,
    ) -> ResourceInfo {
        let info = self.cluster.info_for_resource(service_type, resource_name);
        ResourceInfo {
            name: api_resource.clone(),
            unit: info.map(|i| i.unit).unwrap_or_default(),
            category: category.to_owned(),
            externally_managed: info.is_some_and(|i| i.externally_managed),
            no_quota: info.is_none_or(crate::config::ResourceInfo::no_quota),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn merge_json_lists() {
        let mut target = String::new();
        merge_json_list_into(&mut target, r#"[{"a":1}]"#);
        merge_json_list_into(&mut target, "");
        merge_json_list_into(&mut target, "[]");
        merge_json_list_into(&mut target, r#"[{"a":2}]"#);
        assert_eq!(target, r#"[{"a":1},{"a":2}]"#);

        let mut target = "[]".to_owned();
        merge_json_list_into(&mut target, "[1,2]");
        assert_eq!(target, "[1,2]");
    }

    #[test]
    fn commitment_balance_keeps_invariant() {
        for (committed, usage) in [(0, 0), (10, 3), (3, 10), (7, 7), (u64::MAX, 0)] {
            let (unused, uncommitted) = commitment_balance(committed, usage);
            assert_eq!(
                i128::from(unused) - i128::from(uncommitted),
                i128::from(committed) - i128::from(usage)
            );
        }
    }

    #[derive(Debug)]
    struct Entry(u64);

    impl AzEntry for Entry {
        fn is_empty(&self) -> bool {
            self.0 == 0
        }
    }

    #[test]
    fn placeholder_pruning() {
        let mut per_az = BTreeMap::new();
        per_az.insert(AvailabilityZone::any(), Entry(0));
        per_az.insert(AvailabilityZone::new("west-1"), Entry(5));
        prune_placeholder_azs(&mut per_az);
        assert_eq!(per_az.len(), 1);
        assert!(per_az.contains_key("west-1"));

        let mut per_az = BTreeMap::new();
        per_az.insert(AvailabilityZone::any(), Entry(0));
        prune_placeholder_azs(&mut per_az);
        assert_eq!(per_az.len(), 1);

        let mut per_az = BTreeMap::new();
        per_az.insert(AvailabilityZone::any(), Entry(0));
        per_az.insert(AvailabilityZone::unknown(), Entry(0));
        prune_placeholder_azs(&mut per_az);
        assert_eq!(per_az.len(), 1);

        let mut per_az = BTreeMap::new();
        per_az.insert(AvailabilityZone::any(), Entry(2));
        per_az.insert(AvailabilityZone::unknown(), Entry(0));
        per_az.insert(AvailabilityZone::new("west-1"), Entry(0));
        prune_placeholder_azs(&mut per_az);
        assert!(per_az.contains_key("any"));
        assert!(!per_az.contains_key("unknown"));
    }

    #[test]
    fn raw_json_is_embedded_verbatim() {
        #[derive(Serialize)]
        struct Wrapper {
            #[serde(serialize_with = "serialize_raw_json")]
            items: String,
        }
        let w = Wrapper {
            items: r#"[{"a":1}]"#.to_owned(),
        };
        assert_eq!(serde_json::to_string(&w).unwrap(), r#"{"items":[{"a":1}]}"#);
    }
}
