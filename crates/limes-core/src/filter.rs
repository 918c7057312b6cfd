//! Report filters derived from request parameters.

use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::{Captures, Regex};

use crate::name_mapping::NameMapping;
use crate::names::{ResourceName, ServiceType};

#[allow(clippy::expect_used)]
static PLACEHOLDER_RX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{AND ([a-z._]+) = \$(service_type|resource_name)\}\}").expect("valid placeholder regex")
});

/// Decides whether subcapacities may be shown for a resource.
pub type SubcapacityPredicate = Arc<dyn Fn(&ServiceType, &ResourceName) -> bool + Send + Sync>;

/// Raw filter inputs as they come from a request.
#[derive(Debug, Clone, Default)]
pub struct FilterParams {
    pub services: Vec<String>,
    pub resources: Vec<String>,
    /// `None` if no `area` parameter was given at all.
    pub areas: Option<Vec<String>>,
    pub detail: bool,
    pub az_breakdown: bool,
}

/// Which parts of a report a request wants.
#[derive(Clone)]
pub struct Filter {
    /// Empty means "all services". A single empty string matches nothing.
    pub service_types: Vec<ServiceType>,
    /// Empty means "all resources".
    pub resource_names: Vec<ResourceName>,
    pub with_subresources: bool,
    pub with_subcapacities: bool,
    pub with_az_breakdown: bool,
    pub(crate) is_subcapacity_allowed: SubcapacityPredicate,
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("service_types", &self.service_types)
            .field("resource_names", &self.resource_names)
            .field("with_subresources", &self.with_subresources)
            .field("with_subcapacities", &self.with_subcapacities)
            .field("with_az_breakdown", &self.with_az_breakdown)
            .finish_non_exhaustive()
    }
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            service_types: Vec::new(),
            resource_names: Vec::new(),
            with_subresources: false,
            with_subcapacities: false,
            with_az_breakdown: false,
            is_subcapacity_allowed: Arc::new(|_, _| true),
        }
    }
}

/// A query with filter placeholders expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedQuery {
    pub sql: String,
    /// Values for `$1..$n`, in order.
    pub args: Vec<String>,
}

impl PreparedQuery {
    /// Replaces the `{{WHERE}}` token with `column = $k` conditions for
    /// parameters bound after the filter arguments, or `TRUE` if there are
    /// none.
    #[must_use]
    pub fn with_conditions(mut self, columns: &[&str]) -> Self {
        let offset = self.args.len();
        let clause = if columns.is_empty() {
            "TRUE".to_owned()
        } else {
            columns
                .iter()
                .enumerate()
                .map(|(idx, column)| format!("{column} = ${}", offset + idx + 1))
                .collect::<Vec<_>>()
                .join(" AND ")
        };
        self.sql = self.sql.replace("{{WHERE}}", &clause);
        self
    }
}

impl Filter {
    /// Builds a filter from request parameters. Areas are resolved to
    /// service types and intersected with explicit service filters; if
    /// nothing remains, a sentinel is used so that queries return no rows.
    #[must_use]
    pub fn from_params(params: &FilterParams, nm: &NameMapping) -> Self {
        let mut service_types: Vec<ServiceType> = params.services.iter().map(ServiceType::new).collect();
        if let Some(areas) = &params.areas {
            let area_services: Vec<ServiceType> = areas
                .iter()
                .flat_map(|area| nm.service_types_in_area(area))
                .collect();
            service_types = if service_types.is_empty() {
                area_services
            } else {
                service_types
                    .into_iter()
                    .filter(|svc| area_services.contains(svc))
                    .collect()
            };
            if service_types.is_empty() {
                service_types.push(ServiceType::new(""));
            }
        }
        Self {
            service_types,
            resource_names: params.resources.iter().map(ResourceName::new).collect(),
            with_subresources: params.detail,
            with_subcapacities: params.detail,
            with_az_breakdown: params.az_breakdown,
            ..Self::default()
        }
    }

    /// Installs the authorization check for subcapacities.
    #[must_use]
    pub fn with_subcapacity_authorization(mut self, predicate: SubcapacityPredicate) -> Self {
        self.is_subcapacity_allowed = predicate;
        self
    }

    #[must_use]
    pub fn includes_service(&self, service_type: &ServiceType) -> bool {
        self.service_types.is_empty() || self.service_types.contains(service_type)
    }

    #[must_use]
    pub fn includes(&self, service_type: &ServiceType, resource_name: &ResourceName) -> bool {
        self.includes_service(service_type)
            && (self.resource_names.is_empty() || self.resource_names.contains(resource_name))
    }

    /// Rate reports only honor the service filter.
    #[must_use]
    pub fn includes_rate_service(&self, service_type: &ServiceType) -> bool {
        self.includes_service(service_type)
    }

    #[must_use]
    pub fn is_subcapacity_allowed(&self, service_type: &ServiceType, resource_name: &ResourceName) -> bool {
        self.with_subcapacities && (self.is_subcapacity_allowed)(service_type, resource_name)
    }

    /// Expands `{{AND <column> = $service_type}}` and
    /// `{{AND <column> = $resource_name}}` placeholders into `IN (...)`
    /// clauses over database identifiers, or into nothing if the filter is
    /// not set. A filter whose API names map to no database names expands to
    /// an impossible match instead.
    #[must_use]
    pub fn prepare_query(&self, query: &str, nm: &NameMapping) -> PreparedQuery {
        let mut args: Vec<String> = Vec::new();
        let sql = PLACEHOLDER_RX.replace_all(query, |caps: &Captures<'_>| {
            let column = &caps[1];
            let values: Vec<String> = if &caps[2] == "resource_name" {
                if self.resource_names.is_empty() {
                    return String::new();
                }
                nm.db_resource_names_for(&self.resource_names)
                    .into_iter()
                    .map(|n| n.0)
                    .collect()
            } else {
                if self.service_types.is_empty() {
                    return String::new();
                }
                nm.db_service_types_for(&self.service_types)
                    .into_iter()
                    .map(|t| t.0)
                    .collect()
            };
            let values = if values.is_empty() {
                vec![String::new()]
            } else {
                values
            };
            let placeholders: Vec<String> = (0..values.len())
                .map(|idx| format!("${}", args.len() + idx + 1))
                .collect();
            args.extend(values);
            format!("AND {column} IN ({})", placeholders.join(","))
        });
        PreparedQuery {
            sql: sql.into_owned(),
            args,
        }
    }
}
