//! Attribute values.
//!
//! `Variant` is the dynamically typed payload of an attribute; `DataValue`
//! adds the status and timestamps that travel with every read and every
//! sampled notification.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node_id::{LocalizedText, NodeId, QualifiedName};
use crate::status::StatusCode;

/// A dynamically typed attribute value.
///
/// # Examples
///
/// ```
/// use uacore::Variant;
///
/// let v = Variant::Double(21.5);
/// assert_eq!(v.as_f64(), Some(21.5));
/// assert!(v.same_type(&Variant::Double(0.0)));
/// ```
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Variant {
    #[default]
    Empty,
    Boolean(bool),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    Double(f64),
    String(String),
    DateTime(DateTime<Utc>),
    NodeId(NodeId),
    QualifiedName(QualifiedName),
    LocalizedText(LocalizedText),
    ByteString(Vec<u8>),
    StatusCode(StatusCode),
    /// Structured payloads (role permission lists, extension objects).
    Structured(serde_json::Value),
    Array(Vec<Variant>),
}

impl Variant {
    /// Returns true for `Variant::Empty`.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Numeric view of the value, used by deadband filters and where-clause
    /// comparisons.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int32(v) => Some(f64::from(*v)),
            Self::UInt32(v) => Some(f64::from(*v)),
            #[allow(clippy::cast_precision_loss)]
            Self::Int64(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns true for the numeric variants.
    #[must_use]
    pub fn is_numeric(&self) -> bool {
        self.as_f64().is_some()
    }

    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_u32(&self) -> Option<u32> {
        match self {
            Self::UInt32(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_node_id(&self) -> Option<&NodeId> {
        match self {
            Self::NodeId(v) => Some(v),
            _ => None,
        }
    }

    /// Returns true when both values carry the same variant kind.
    #[must_use]
    pub fn same_type(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Applies a one-dimensional index range to an array, string or byte string.
    pub fn apply_range(&self, range: &NumericRange) -> Result<Self, StatusCode> {
        match self {
            Self::Array(items) => {
                let (start, end) = range.bounds(items.len())?;
                Ok(Self::Array(items[start..=end].to_vec()))
            }
            Self::String(s) => {
                let chars: Vec<char> = s.chars().collect();
                let (start, end) = range.bounds(chars.len())?;
                Ok(Self::String(chars[start..=end].iter().collect()))
            }
            Self::ByteString(b) => {
                let (start, end) = range.bounds(b.len())?;
                Ok(Self::ByteString(b[start..=end].to_vec()))
            }
            Self::Empty => Err(StatusCode::BadIndexRangeNoData),
            _ => Err(StatusCode::BadIndexRangeInvalid),
        }
    }
}

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i32> for Variant {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<u32> for Variant {
    fn from(v: u32) -> Self {
        Self::UInt32(v)
    }
}

impl From<f64> for Variant {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<NodeId> for Variant {
    fn from(v: NodeId) -> Self {
        Self::NodeId(v)
    }
}

impl From<LocalizedText> for Variant {
    fn from(v: LocalizedText) -> Self {
        Self::LocalizedText(v)
    }
}

impl From<QualifiedName> for Variant {
    fn from(v: QualifiedName) -> Self {
        Self::QualifiedName(v)
    }
}

/// A value plus quality and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataValue {
    /// The value.
    pub value: Variant,
    /// Quality of the value.
    pub status: StatusCode,
    /// When the value was produced at its source.
    pub source_timestamp: Option<DateTime<Utc>>,
    /// When the server observed the value.
    pub server_timestamp: Option<DateTime<Utc>>,
}

impl DataValue {
    /// A good value stamped with the current time.
    #[must_use]
    pub fn new(value: impl Into<Variant>) -> Self {
        let now = Utc::now();
        Self {
            value: value.into(),
            status: StatusCode::Good,
            source_timestamp: Some(now),
            server_timestamp: Some(now),
        }
    }

    /// A good value with an explicit source timestamp.
    #[must_use]
    pub fn with_source_time(value: impl Into<Variant>, source_timestamp: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            status: StatusCode::Good,
            source_timestamp: Some(source_timestamp),
            server_timestamp: Some(Utc::now()),
        }
    }

    /// A value-less result carrying only a status.
    #[must_use]
    pub fn bad(status: StatusCode) -> Self {
        Self {
            value: Variant::Empty,
            status,
            source_timestamp: None,
            server_timestamp: Some(Utc::now()),
        }
    }

    /// Strips the timestamps the client did not ask for.
    #[must_use]
    pub fn filter_timestamps(mut self, timestamps: TimestampsToReturn) -> Self {
        match timestamps {
            TimestampsToReturn::Both => {}
            TimestampsToReturn::Source => self.server_timestamp = None,
            TimestampsToReturn::Server => self.source_timestamp = None,
            TimestampsToReturn::Neither => {
                self.source_timestamp = None;
                self.server_timestamp = None;
            }
        }
        self
    }
}

impl Default for DataValue {
    fn default() -> Self {
        Self {
            value: Variant::Empty,
            status: StatusCode::Good,
            source_timestamp: None,
            server_timestamp: None,
        }
    }
}

/// Which timestamps a read returns.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimestampsToReturn {
    Source,
    Server,
    #[default]
    Both,
    Neither,
}

/// A one-dimensional index range such as `"3"` or `"1:4"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumericRange {
    /// First index (inclusive).
    pub start: u32,
    /// Last index (inclusive); `None` for a single element.
    pub end: Option<u32>,
}

impl NumericRange {
    /// Parses the textual form. Multi-dimensional ranges are not supported.
    pub fn parse(text: &str) -> Result<Self, StatusCode> {
        let text = text.trim();
        if text.is_empty() || text.contains(',') {
            return Err(StatusCode::BadIndexRangeInvalid);
        }
        let parse_index = |s: &str| s.parse::<u32>().map_err(|_| StatusCode::BadIndexRangeInvalid);
        match text.split_once(':') {
            None => Ok(Self {
                start: parse_index(text)?,
                end: None,
            }),
            Some((lo, hi)) => {
                let start = parse_index(lo)?;
                let end = parse_index(hi)?;
                if end <= start {
                    return Err(StatusCode::BadIndexRangeInvalid);
                }
                Ok(Self { start, end: Some(end) })
            }
        }
    }

    /// Parses an optional range; an empty string means "no range".
    pub fn parse_optional(text: Option<&str>) -> Result<Option<Self>, StatusCode> {
        match text {
            None => Ok(None),
            Some(t) if t.trim().is_empty() => Ok(None),
            Some(t) => Self::parse(t).map(Some),
        }
    }

    /// Resolves the range against a collection length, clamping the end.
    fn bounds(&self, len: usize) -> Result<(usize, usize), StatusCode> {
        let start = self.start as usize;
        if start >= len {
            return Err(StatusCode::BadIndexRangeNoData);
        }
        let end = self.end.map_or(start, |e| (e as usize).min(len - 1));
        Ok((start, end))
    }
}

impl fmt::Display for NumericRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}:{end}", self.start),
            None => write!(f, "{}", self.start),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_range_parse() {
        assert_eq!(NumericRange::parse("2").unwrap(), NumericRange { start: 2, end: None });
        assert_eq!(
            NumericRange::parse("1:3").unwrap(),
            NumericRange { start: 1, end: Some(3) }
        );
        assert_eq!(NumericRange::parse("3:1"), Err(StatusCode::BadIndexRangeInvalid));
        assert_eq!(NumericRange::parse("1:1"), Err(StatusCode::BadIndexRangeInvalid));
        assert_eq!(NumericRange::parse("0:1,2:3"), Err(StatusCode::BadIndexRangeInvalid));
        assert_eq!(NumericRange::parse_optional(Some("")).unwrap(), None);
    }

    #[test]
    fn apply_range_to_array_clamps_end() {
        let v = Variant::Array(vec![1.into(), 2.into(), 3.into()]);
        let r = NumericRange::parse("1:9").unwrap();
        assert_eq!(v.apply_range(&r).unwrap(), Variant::Array(vec![2.into(), 3.into()]));
    }

    #[test]
    fn apply_range_out_of_bounds_has_no_data() {
        let v = Variant::String("abc".to_string());
        let r = NumericRange::parse("5").unwrap();
        assert_eq!(v.apply_range(&r), Err(StatusCode::BadIndexRangeNoData));
        assert_eq!(
            Variant::Double(1.0).apply_range(&NumericRange::parse("0").unwrap()),
            Err(StatusCode::BadIndexRangeInvalid)
        );
    }

    #[test]
    fn timestamp_filtering() {
        let dv = DataValue::new(1.5).filter_timestamps(TimestampsToReturn::Source);
        assert!(dv.source_timestamp.is_some());
        assert!(dv.server_timestamp.is_none());

        let dv = DataValue::new(1.5).filter_timestamps(TimestampsToReturn::Neither);
        assert!(dv.source_timestamp.is_none());
        assert!(dv.server_timestamp.is_none());
    }
}
