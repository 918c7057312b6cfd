//! Strongly-typed identifiers.
//!
//! Service types and resource or rate names exist in two namespaces: the
//! identifiers stored in the database (as declared by the backend) and the
//! identifiers shown in the API. Both are wrapped in distinct newtypes so
//! that they cannot be mixed up by accident; [`crate::name_mapping`]
//! converts between them.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        #[cfg_attr(feature = "sqlx", derive(sqlx::Type), sqlx(transparent))]
        pub struct $name(pub String);

        impl $name {
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_newtype!(
    /// Service type as shown in the API.
    ServiceType
);
string_newtype!(
    /// Resource name as shown in the API.
    ResourceName
);
string_newtype!(
    /// Rate name as shown in the API.
    RateName
);
string_newtype!(
    /// Service type as stored in the database.
    DbServiceType
);
string_newtype!(
    /// Resource name as declared by the backend and stored in the database.
    LiquidResourceName
);
string_newtype!(
    /// Rate name as declared by the backend and stored in the database.
    LiquidRateName
);
string_newtype!(
    /// Name of an availability zone, or one of the placeholders `any` and
    /// `unknown`.
    AvailabilityZone
);

impl AvailabilityZone {
    /// Bucket for resources that are not AZ-aware.
    pub const ANY: &'static str = "any";
    /// Bucket for usage whose AZ could not be determined.
    pub const UNKNOWN: &'static str = "unknown";

    #[must_use]
    pub fn any() -> Self {
        Self::new(Self::ANY)
    }

    #[must_use]
    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN)
    }

    #[must_use]
    pub fn is_any(&self) -> bool {
        self.0 == Self::ANY
    }

    /// Whether this is `any` or `unknown`.
    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.0 == Self::ANY || self.0 == Self::UNKNOWN
    }
}

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        #[cfg_attr(feature = "sqlx", derive(sqlx::Type), sqlx(transparent))]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(
    /// Internal (database) ID of a domain.
    DomainId
);
id_newtype!(
    /// Internal (database) ID of a project.
    ProjectId
);

/// How a resource relates to availability zones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    /// The resource is not AZ-aware; everything lives in the `any` bucket.
    #[default]
    Flat,
    /// Usage is reported per AZ, quota is shared.
    AzAware,
    /// Quota and usage are both managed per AZ.
    AzSeparated,
}

/// Who hands out quota for a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaDistributionModel {
    /// Quota is assigned by cloud admins to domains and by domain admins to
    /// projects.
    #[default]
    Hierarchical,
    /// Quota is assigned centrally; domain quota is the sum of project
    /// quotas.
    Centralized,
}

impl QuotaDistributionModel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hierarchical => "hierarchical",
            Self::Centralized => "centralized",
        }
    }
}

/// Metadata for a domain, as shown in reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Domain {
    #[serde(skip)]
    pub id: DomainId,
    #[serde(rename = "id")]
    pub uuid: String,
    pub name: String,
}

/// Metadata for a project, as shown in reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Project {
    #[serde(skip)]
    pub id: ProjectId,
    #[serde(skip)]
    pub domain_id: DomainId,
    #[serde(rename = "id")]
    pub uuid: String,
    pub name: String,
    #[serde(rename = "parent_id")]
    pub parent_uuid: String,
    #[serde(skip)]
    pub has_bursting: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn placeholders_are_recognized() {
        assert!(AvailabilityZone::any().is_placeholder());
        assert!(AvailabilityZone::unknown().is_placeholder());
        assert!(!AvailabilityZone::new("az-one").is_placeholder());
        assert!(AvailabilityZone::any().is_any());
    }

    #[test]
    fn newtypes_serialize_as_plain_strings_and_map_keys() {
        let mut map = BTreeMap::new();
        map.insert(AvailabilityZone::new("az-two"), 2);
        map.insert(AvailabilityZone::new("az-one"), 1);
        assert_eq!(
            serde_json::to_string(&map).unwrap(),
            r#"{"az-one":1,"az-two":2}"#
        );
    }

    #[test]
    fn string_lookup_via_borrow() {
        let mut map = BTreeMap::new();
        map.insert(ServiceType::new("compute"), 1);
        assert_eq!(map.get("compute"), Some(&1));
    }

    #[test]
    fn topology_uses_kebab_case() {
        let t: Topology = serde_json::from_str(r#""az-separated""#).unwrap();
        assert_eq!(t, Topology::AzSeparated);
    }
}
