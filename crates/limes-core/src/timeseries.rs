//! Compact time series as stored in the `historical_usage` column.
//!
//! The stored form is columnar, `{"t":[123,456],"v":[1,2]}`, which is much
//! shorter than a list of objects for the number of rows involved.

use serde::{Deserialize, Serialize};

/// Measurements ordered by timestamp, one value per unique timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSeries {
    #[serde(rename = "t", default)]
    timestamps: Vec<i64>,
    #[serde(rename = "v", default)]
    values: Vec<u64>,
}

/// Error from [`TimeSeries::parse`].
#[derive(Debug, thiserror::Error)]
pub enum TimeSeriesError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("cannot unmarshal TimeSeries with inconsistent length: len(t) = {0} != {1} = len(v)")]
    InconsistentLength(usize, usize),
    #[error("cannot unmarshal TimeSeries with unsorted timestamps")]
    Unsorted,
    #[error("cannot unmarshal TimeSeries with duplicate timestamps: {0} appears more than once")]
    Duplicate(i64),
}

impl TimeSeries {
    /// Parses the stored representation. The empty string is an empty series.
    ///
    /// # Errors
    ///
    /// Returns [`TimeSeriesError`] if the input is not valid JSON or breaks
    /// the ordering invariants.
    pub fn parse(input: &str) -> Result<Self, TimeSeriesError> {
        if input.is_empty() {
            return Ok(Self::default());
        }
        let series: Self = serde_json::from_str(input)?;
        if series.timestamps.len() != series.values.len() {
            return Err(TimeSeriesError::InconsistentLength(
                series.timestamps.len(),
                series.values.len(),
            ));
        }
        for pair in series.timestamps.windows(2) {
            match pair[0].cmp(&pair[1]) {
                std::cmp::Ordering::Less => {}
                std::cmp::Ordering::Equal => return Err(TimeSeriesError::Duplicate(pair[0])),
                std::cmp::Ordering::Greater => return Err(TimeSeriesError::Unsorted),
            }
        }
        Ok(series)
    }

    /// Builds a series from `(timestamp, value)` pairs in chronological order.
    #[must_use]
    pub fn from_points(points: &[(i64, u64)]) -> Self {
        Self {
            timestamps: points.iter().map(|(t, _)| *t).collect(),
            values: points.iter().map(|(_, v)| *v).collect(),
        }
    }

    #[must_use]
    pub fn min_or(&self, fallback: u64) -> u64 {
        self.values.iter().copied().min().unwrap_or(fallback)
    }

    #[must_use]
    pub fn max_or(&self, fallback: u64) -> u64 {
        self.values.iter().copied().max().unwrap_or(fallback)
    }
}
