//! Bidirectional mapping between database identifiers and API identifiers.
//!
//! Built once from the cluster registry. Lookups that miss return `None`;
//! callers skip such rows since they belong to resources that are no longer
//! configured.

use std::collections::{BTreeMap, BTreeSet};

use crate::cluster::Cluster;
use crate::names::{DbServiceType, LiquidRateName, LiquidResourceName, RateName, ResourceName, ServiceType};
use crate::translation::TranslationRule;

type DbResourceRef = (DbServiceType, LiquidResourceName);
type ApiResourceRef = (ServiceType, ResourceName);
type DbRateRef = (DbServiceType, LiquidRateName);
type ApiRateRef = (ServiceType, RateName);

#[derive(Debug, Clone, Default)]
pub struct NameMapping {
    resources_to_api: BTreeMap<DbResourceRef, ApiResourceRef>,
    resources_from_api: BTreeMap<ApiResourceRef, DbResourceRef>,
    rates_to_api: BTreeMap<DbRateRef, ApiRateRef>,
    rates_from_api: BTreeMap<ApiRateRef, DbRateRef>,
    translation_rules: BTreeMap<DbResourceRef, TranslationRule>,
    service_areas: BTreeMap<ServiceType, String>,
}

impl NameMapping {
    #[must_use]
    pub fn new(cluster: &Cluster) -> Self {
        let mut nm = Self::default();
        for svc in cluster.services() {
            let db_type = &svc.service_type;
            nm.service_areas
                .entry(ServiceType::new(db_type.as_str()))
                .or_insert_with(|| svc.area.clone());

            for resource_name in svc.resources.keys() {
                let behavior = cluster.behavior_for_resource(db_type, resource_name, "");
                let api_ref = behavior.identity_in_v1_api.unwrap_or_else(|| {
                    (
                        ServiceType::new(db_type.as_str()),
                        ResourceName::new(resource_name.as_str()),
                    )
                });
                let db_ref = (db_type.clone(), resource_name.clone());
                nm.service_areas
                    .entry(api_ref.0.clone())
                    .or_insert_with(|| svc.area.clone());
                if !behavior.translation_rule.is_empty() {
                    nm.translation_rules
                        .insert(db_ref.clone(), behavior.translation_rule);
                }
                nm.resources_from_api.insert(api_ref.clone(), db_ref.clone());
                nm.resources_to_api.insert(db_ref, api_ref);
            }

            // configured rate limits make a rate visible even if the backend
            // does not declare it
            let rate_names: BTreeSet<&LiquidRateName> = svc
                .rates
                .keys()
                .chain(svc.rate_limits.global.iter().map(|rl| &rl.name))
                .chain(svc.rate_limits.project_default.iter().map(|rl| &rl.name))
                .collect();
            for rate_name in rate_names {
                let behavior = cluster.behavior_for_rate(db_type, rate_name);
                let api_ref = behavior.identity_in_v1_api.unwrap_or_else(|| {
                    (
                        ServiceType::new(db_type.as_str()),
                        RateName::new(rate_name.as_str()),
                    )
                });
                let db_ref = (db_type.clone(), rate_name.clone());
                nm.service_areas
                    .entry(api_ref.0.clone())
                    .or_insert_with(|| svc.area.clone());
                nm.rates_from_api.insert(api_ref.clone(), db_ref.clone());
                nm.rates_to_api.insert(db_ref, api_ref);
            }
        }
        nm
    }

    #[must_use]
    pub fn map_resource_to_api(
        &self,
        service_type: &DbServiceType,
        resource_name: &LiquidResourceName,
    ) -> Option<(ServiceType, ResourceName)> {
        self.resources_to_api
            .get(&(service_type.clone(), resource_name.clone()))
            .cloned()
    }

    #[must_use]
    pub fn map_resource_from_api(
        &self,
        service_type: &ServiceType,
        resource_name: &ResourceName,
    ) -> Option<(DbServiceType, LiquidResourceName)> {
        self.resources_from_api
            .get(&(service_type.clone(), resource_name.clone()))
            .cloned()
    }

    #[must_use]
    pub fn map_rate_to_api(
        &self,
        service_type: &DbServiceType,
        rate_name: &LiquidRateName,
    ) -> Option<(ServiceType, RateName)> {
        self.rates_to_api
            .get(&(service_type.clone(), rate_name.clone()))
            .cloned()
    }

    #[must_use]
    pub fn map_rate_from_api(
        &self,
        service_type: &ServiceType,
        rate_name: &RateName,
    ) -> Option<(DbServiceType, LiquidRateName)> {
        self.rates_from_api
            .get(&(service_type.clone(), rate_name.clone()))
            .cloned()
    }

    /// The translation rule for a resource's subresource and subcapacity
    /// payloads.
    #[must_use]
    pub fn translation_rule(
        &self,
        service_type: &DbServiceType,
        resource_name: &LiquidResourceName,
    ) -> TranslationRule {
        self.translation_rules
            .get(&(service_type.clone(), resource_name.clone()))
            .copied()
            .unwrap_or_default()
    }

    /// The area of an API service type, or the empty string if unknown.
    #[must_use]
    pub fn area_for_service(&self, service_type: &ServiceType) -> &str {
        self.service_areas
            .get(service_type)
            .map_or("", String::as_str)
    }

    /// All API service types in the given area.
    #[must_use]
    pub fn service_types_in_area(&self, area: &str) -> Vec<ServiceType> {
        self.service_areas
            .iter()
            .filter(|(_, a)| a.as_str() == area)
            .map(|(svc, _)| svc.clone())
            .collect()
    }

    /// Database service types holding any resource or rate under one of the
    /// given API service types.
    #[must_use]
    pub fn db_service_types_for(&self, api_types: &[ServiceType]) -> BTreeSet<DbServiceType> {
        let resources = self
            .resources_to_api
            .iter()
            .filter(|(_, (svc, _))| api_types.contains(svc))
            .map(|((db_svc, _), _)| db_svc.clone());
        let rates = self
            .rates_to_api
            .iter()
            .filter(|(_, (svc, _))| api_types.contains(svc))
            .map(|((db_svc, _), _)| db_svc.clone());
        resources.chain(rates).collect()
    }

    /// Database resource names shown under one of the given API names.
    #[must_use]
    pub fn db_resource_names_for(&self, api_names: &[ResourceName]) -> BTreeSet<LiquidResourceName> {
        self.resources_to_api
            .iter()
            .filter(|(_, (_, res))| api_names.contains(res))
            .map(|((_, db_res), _)| db_res.clone())
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cluster::testing::test_cluster;

    #[test]
    fn resources_map_both_ways() {
        let nm = NameMapping::new(&test_cluster());
        let (svc, res) = nm
            .map_resource_to_api(&DbServiceType::new("unshared"), &LiquidResourceName::new("things"))
            .unwrap();
        assert_eq!(svc.as_str(), "unshared");
        assert_eq!(res.as_str(), "renamed_things");

        let (db_svc, db_res) = nm
            .map_resource_from_api(&svc, &ResourceName::new("renamed_things"))
            .unwrap();
        assert_eq!(db_svc.as_str(), "unshared");
        assert_eq!(db_res.as_str(), "things");

        assert!(nm
            .map_resource_from_api(&svc, &ResourceName::new("things"))
            .is_none());
        assert!(nm
            .map_resource_to_api(&DbServiceType::new("gone"), &LiquidResourceName::new("things"))
            .is_none());
    }

    #[test]
    fn rate_limits_extend_rate_mapping() {
        let nm = NameMapping::new(&test_cluster());
        // declared only via project_default
        assert!(nm
            .map_rate_to_api(&DbServiceType::new("shared"), &LiquidRateName::new("objects:update"))
            .is_some());
        assert!(nm
            .map_rate_from_api(&ServiceType::new("shared"), &RateName::new("objects:delete"))
            .is_some());
    }

    #[test]
    fn area_lookup() {
        let nm = NameMapping::new(&test_cluster());
        assert_eq!(nm.area_for_service(&ServiceType::new("shared")), "testing");
        assert_eq!(nm.service_types_in_area("testing").len(), 2);
        assert!(nm.service_types_in_area("elsewhere").is_empty());
    }

    #[test]
    fn db_names_for_filters() {
        let nm = NameMapping::new(&test_cluster());
        let svcs = nm.db_service_types_for(&[ServiceType::new("unshared")]);
        assert_eq!(svcs.len(), 1);
        let names = nm.db_resource_names_for(&[ResourceName::new("renamed_things")]);
        assert!(names.contains(&LiquidResourceName::new("things")));
    }
}
