//! Quota setups that contradict each other or the measured usage.

use serde::Serialize;

use super::rows::{MismatchProjectRow, OvercommittedDomainRow, OverspentProjectRow};
use crate::cluster::Cluster;
use crate::name_mapping::NameMapping;
use crate::names::{DbServiceType, LiquidResourceName, ResourceName, ServiceType};
use crate::unit::Unit;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectRef {
    pub id: String,
    pub name: String,
    pub domain: DomainRef,
}

/// `sum(project quotas) > domain quota` for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OvercommittedDomainQuota {
    pub domain: DomainRef,
    pub service: ServiceType,
    pub resource: ResourceName,
    #[serde(skip_serializing_if = "Unit::is_none")]
    pub unit: Unit,
    pub domain_quota: u64,
    pub projects_quota: u64,
}

/// `usage > quota` for one project resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverspentProjectQuota {
    pub project: ProjectRef,
    pub service: ServiceType,
    pub resource: ResourceName,
    #[serde(skip_serializing_if = "Unit::is_none")]
    pub unit: Unit,
    pub quota: u64,
    pub usage: u64,
}

/// `backend_quota != quota` for one project resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MismatchProjectQuota {
    pub project: ProjectRef,
    pub service: ServiceType,
    pub resource: ResourceName,
    #[serde(skip_serializing_if = "Unit::is_none")]
    pub unit: Unit,
    pub quota: u64,
    pub backend_quota: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Inconsistencies {
    #[serde(rename = "domain_quota_overcommitted")]
    pub overcommitted_quotas: Vec<OvercommittedDomainQuota>,
    #[serde(rename = "project_quota_overspent")]
    pub overspent_quotas: Vec<OverspentProjectQuota>,
    #[serde(rename = "project_quota_mismatch")]
    pub mismatch_quotas: Vec<MismatchProjectQuota>,
}

/// Collects inconsistency rows, dropping rows for resources that have no
/// API identity.
pub struct InconsistencyCollector<'a> {
    cluster: &'a Cluster,
    nm: &'a NameMapping,
    result: Inconsistencies,
}

impl<'a> InconsistencyCollector<'a> {
    #[must_use]
    pub fn new(cluster: &'a Cluster, nm: &'a NameMapping) -> Self {
        Self {
            cluster,
            nm,
            result: Inconsistencies::default(),
        }
    }

    fn map(&self, service_type: &DbServiceType, resource_name: &LiquidResourceName) -> Option<(ServiceType, ResourceName, Unit)> {
        let (service, resource) = self.nm.map_resource_to_api(service_type, resource_name)?;
        let unit = self
            .cluster
            .info_for_resource(service_type, resource_name)
            .map(|info| info.unit)
            .unwrap_or_default();
        Some((service, resource, unit))
    }

    pub fn add_overcommitted_domain(&mut self, row: OvercommittedDomainRow) {
        let Some(domain_quota) = row.domain_quota.filter(|q| *q < row.projects_quota) else {
            return;
        };
        let Some((service, resource, unit)) = self.map(&row.service_type, &row.resource_name) else {
            return;
        };
        self.result.overcommitted_quotas.push(OvercommittedDomainQuota {
            domain: DomainRef {
                id: row.domain_uuid,
                name: row.domain_name,
            },
            service,
            resource,
            unit,
            domain_quota,
            projects_quota: row.projects_quota,
        });
    }

    pub fn add_overspent_project(&mut self, row: OverspentProjectRow) {
        let Some((service, resource, unit)) = self.map(&row.service_type, &row.resource_name) else {
            return;
        };
        self.result.overspent_quotas.push(OverspentProjectQuota {
            project: ProjectRef {
                id: row.project_uuid,
                name: row.project_name,
                domain: DomainRef {
                    id: row.domain_uuid,
                    name: row.domain_name,
                },
            },
            service,
            resource,
            unit,
            quota: row.quota,
            usage: row.usage,
        });
    }

    pub fn add_mismatch_project(&mut self, row: MismatchProjectRow) {
        let Some((service, resource, unit)) = self.map(&row.service_type, &row.resource_name) else {
            return;
        };
        self.result.mismatch_quotas.push(MismatchProjectQuota {
            project: ProjectRef {
                id: row.project_uuid,
                name: row.project_name,
                domain: DomainRef {
                    id: row.domain_uuid,
                    name: row.domain_name,
                },
            },
            service,
            resource,
            unit,
            quota: row.quota,
            backend_quota: row.backend_quota,
        });
    }

    #[must_use]
    pub fn finish(self) -> Inconsistencies {
        self.result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cluster::testing::test_cluster;

    #[test]
    fn empty_lists_serialize_as_arrays() {
        let cluster = test_cluster();
        let nm = NameMapping::new(&cluster);
        let result = InconsistencyCollector::new(&cluster, &nm).finish();
        assert_eq!(
            serde_json::to_string(&result).unwrap(),
            r#"{"domain_quota_overcommitted":[],"project_quota_overspent":[],"project_quota_mismatch":[]}"#
        );
    }

    #[test]
    fn rows_are_mapped_and_unknown_ones_dropped() {
        let cluster = test_cluster();
        let nm = NameMapping::new(&cluster);
        let mut collector = InconsistencyCollector::new(&cluster, &nm);
        collector.add_overcommitted_domain(OvercommittedDomainRow {
            domain_uuid: "uuid-d".to_owned(),
            domain_name: "germany".to_owned(),
            service_type: DbServiceType::new("shared"),
            resource_name: LiquidResourceName::new("capacity"),
            domain_quota: Some(10),
            projects_quota: 20,
        });
        collector.add_overspent_project(OverspentProjectRow {
            service_type: DbServiceType::new("unshared"),
            resource_name: LiquidResourceName::new("things"),
            quota: 5,
            usage: 7,
            ..OverspentProjectRow::default()
        });
        collector.add_mismatch_project(MismatchProjectRow {
            service_type: DbServiceType::new("shared"),
            resource_name: LiquidResourceName::new("removed"),
            quota: 5,
            backend_quota: -1,
            ..MismatchProjectRow::default()
        });
        let result = collector.finish();
        assert_eq!(result.overcommitted_quotas.len(), 1);
        assert_eq!(result.overcommitted_quotas[0].unit, Unit::Bytes);
        assert_eq!(result.overspent_quotas[0].resource.as_str(), "renamed_things");
        assert!(result.mismatch_quotas.is_empty());

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["domain_quota_overcommitted"][0]["domain"]["name"], "germany");
        assert_eq!(json["domain_quota_overcommitted"][0]["unit"], "B");
    }

    #[test]
    fn domains_without_stored_quota_are_not_overcommitted() {
        let cluster = test_cluster();
        let nm = NameMapping::new(&cluster);
        let mut collector = InconsistencyCollector::new(&cluster, &nm);
        let row = |domain_name: &str, domain_quota: Option<u64>| OvercommittedDomainRow {
            domain_uuid: format!("uuid-{domain_name}"),
            domain_name: domain_name.to_owned(),
            service_type: DbServiceType::new("shared"),
            resource_name: LiquidResourceName::new("things"),
            domain_quota,
            projects_quota: 20,
        };
        collector.add_overcommitted_domain(row("france", None));
        collector.add_overcommitted_domain(row("germany", Some(20)));
        collector.add_overcommitted_domain(row("spain", Some(19)));
        let result = collector.finish();
        assert_eq!(result.overcommitted_quotas.len(), 1);
        assert_eq!(result.overcommitted_quotas[0].domain.name, "spain");
        assert_eq!(result.overcommitted_quotas[0].domain_quota, 19);
    }
}
