//! Summary of failed scrapes, grouped by service type and message.

use std::collections::BTreeMap;

use serde::Serialize;

use super::inconsistency::{DomainRef, ProjectRef};
use super::rows::ScrapeErrorRow;
use crate::cluster::Cluster;
use crate::names::DbServiceType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScrapeError {
    /// The first affected project.
    pub project: ProjectRef,
    /// Only shown when more than one project is affected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_projects: Option<usize>,
    pub service_type: DbServiceType,
    pub checked_at: Option<i64>,
    pub message: String,
}

/// Groups identical errors of the same service type into one entry. Rows
/// for services that are no longer configured are dropped. The result is
/// ordered by service type, then by project UUID.
#[must_use]
pub fn group_scrape_errors(cluster: &Cluster, rows: Vec<ScrapeErrorRow>) -> Vec<ScrapeError> {
    let mut groups: BTreeMap<(DbServiceType, String), ScrapeError> = BTreeMap::new();
    for row in rows {
        if !cluster.has_service(&row.service_type) {
            continue;
        }
        groups
            .entry((row.service_type.clone(), row.message.clone()))
            .and_modify(|e| e.affected_projects = Some(e.affected_projects.unwrap_or(1) + 1))
            .or_insert_with(|| ScrapeError {
                project: ProjectRef {
                    id: row.project_uuid,
                    name: row.project_name,
                    domain: DomainRef {
                        id: row.domain_uuid,
                        name: row.domain_name,
                    },
                },
                affected_projects: None,
                service_type: row.service_type,
                checked_at: row.checked_at.map(|t| t.timestamp()),
                message: row.message,
            });
    }

    let mut result: Vec<ScrapeError> = groups.into_values().collect();
    result.sort_by(|a, b| {
        a.service_type
            .cmp(&b.service_type)
            .then_with(|| a.project.id.cmp(&b.project.id))
    });
    result
}
