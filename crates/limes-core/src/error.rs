//! Error types for `limes-core`.
//!
//! Each subsystem has its own error enum. Per-resource validation outcomes
//! of the quota and rate-limit updaters are deliberately not errors; they
//! are plain values (see [`crate::validation::ValidationError`]) collected per
//! resource without aborting the request.

/// Errors from parsing or converting values with units.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitError {
    /// The source and target unit do not share a base unit.
    #[error("cannot convert value from {from_unit} to {to_unit} because units are incompatible")]
    Incompatible { from_unit: String, to_unit: String },

    /// The converted value would not be a whole number.
    #[error("value of {value} cannot be represented as integer number of {to_unit}")]
    Fractional { value: String, to_unit: String },

    /// The converted value does not fit into 64 bits.
    #[error("value of {value} is too large to be represented in {to_unit}")]
    Overflow { value: String, to_unit: String },

    /// The input is not of the form `<number> <unit>`.
    #[error("value {input:?} does not match expected format \"<number> <unit>\"")]
    Malformed { input: String },

    /// The numeric part could not be parsed.
    #[error("invalid number in {input:?}: {reason}")]
    InvalidNumber { input: String, reason: String },

    /// The unit string is not one of the known units.
    #[error("unknown unit {0:?}")]
    UnknownUnit(String),
}

/// Errors from loading configuration documents (cluster config, constraint
/// sets, policies).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("could not read {path}: {reason}")]
    Read { path: String, reason: String },

    /// The document is not valid YAML or does not match the expected shape.
    #[error("could not parse {path}: {reason}")]
    Parse { path: String, reason: String },

    /// The document parsed but failed semantic validation. All problems
    /// found are reported at once.
    #[error("invalid configuration: {}", .errors.join("; "))]
    Invalid { errors: Vec<String> },
}

/// Errors from parsing a single quota constraint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConstraintError {
    /// A clause does not start with a known keyword.
    #[error("clause {0:?} should start with \"at least\", \"at most\" or \"exactly\"")]
    UnknownClause(String),

    /// The "more than project constraints" form is only valid for domains.
    #[error("clause {0:?} is only allowed in domain constraints")]
    ProjectRelativeNotAllowed(String),

    /// Lower and upper bound contradict each other.
    #[error("constraint clauses cannot simultaneously be satisfied (at least {min}, but at most {max})")]
    Unsatisfiable { min: String, max: String },

    /// A value inside a clause could not be parsed.
    #[error(transparent)]
    Unit(#[from] UnitError),
}

/// Errors that abort the construction of a report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReportError {
    /// A translation rule rejected a subresource or subcapacity payload.
    #[error(
        "could not apply translation rule to {kind} in {service_type}/{resource_name}/{az}{}: {reason}",
        .project.map(|id| format!(" of project {id}")).unwrap_or_default()
    )]
    Translation {
        kind: &'static str,
        service_type: String,
        resource_name: String,
        az: String,
        project: Option<i64>,
        reason: String,
    },

    /// A stored historical usage series could not be decoded.
    #[error("could not parse historical usage for {service_type}/{resource_name}/{az}: {reason}")]
    HistoricalUsage {
        service_type: String,
        resource_name: String,
        az: String,
        reason: String,
    },

    /// A stored rate window could not be interpreted.
    #[error("invalid window stored for rate {service_type}/{rate_name}: {reason}")]
    InvalidWindow {
        service_type: String,
        rate_name: String,
        reason: String,
    },

    /// A row references a project that was not announced beforehand.
    #[error("received rows for project {project_id} after its report was already emitted")]
    ProjectOutOfOrder { project_id: i64 },
}

/// Errors that prevent a quota update from being validated at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateError {
    /// The cluster or domain report lacks a configured resource.
    #[error("no {level} report for resource {service_type}/{resource_name}")]
    MissingReport {
        level: &'static str,
        service_type: String,
        resource_name: String,
    },

    /// The project has not been scraped yet for this resource.
    #[error("no project report for resource {service_type}/{resource_name}")]
    MissingProjectReport {
        service_type: String,
        resource_name: String,
    },
}

/// Errors from audit sinks.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// A sink failed to persist or forward a fact.
    #[error("audit sink '{name}' failed: {reason}")]
    SinkFailure { name: String, reason: String },

    /// Every registered sink failed.
    #[error("all audit sinks failed")]
    AllSinksFailed,

    /// The fact could not be serialized.
    #[error("audit serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
