//! Metric queries and the raw rows they produce.

use serde::{Deserialize, Serialize};

use pollsight_common::Transform;

/// A named unit of work run against every endpoint that references it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricQuery {
    /// Query name (filled from the `queries` map key when loaded from config).
    #[serde(default)]
    pub name: String,

    /// What to fetch.
    pub source: QuerySource,

    /// Prepended to every metric name produced by this query.
    #[serde(default)]
    pub metric_prefix: String,

    /// Result field identifying the instance a row describes (database name,
    /// interface index). Endpoint include/exclude filters match against it.
    #[serde(default)]
    pub instance_field: Option<String>,

    /// Field to metric table.
    #[serde(default)]
    pub fields: Vec<FieldMapping>,
}

/// Where the raw values of a query come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuerySource {
    /// SNMP GET of scalar OIDs (one row, one field per OID) and/or a table walk
    /// (one row per table index, one field per column number).
    Snmp {
        #[serde(default)]
        oids: Vec<String>,
        #[serde(default)]
        walk: Option<String>,
    },

    /// SQL statement with positional parameters (one row per result row).
    Sql {
        statement: String,
        #[serde(default)]
        params: Vec<SqlParam>,
    },
}

impl QuerySource {
    /// Short name of the source kind, for logs and validation messages.
    pub fn kind(&self) -> &'static str {
        match self {
            QuerySource::Snmp { .. } => "snmp",
            QuerySource::Sql { .. } => "sql",
        }
    }
}

/// Positional SQL parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlParam {
    Int(i64),
    Float(f64),
    Text(String),
}

/// Maps one result field onto one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Result field (column name, OID, or table column number).
    pub field: String,

    /// Metric name template; `{field}` placeholders are filled from the row.
    /// Defaults to the field name.
    #[serde(default)]
    pub metric: Option<String>,

    /// Unit reported with the value.
    #[serde(default = "default_unit")]
    pub unit: String,

    /// How the value is interpreted upstream.
    #[serde(default)]
    pub transform: Transform,

    /// Numeric type the value is clamped into.
    #[serde(default)]
    pub target: Option<NumericType>,

    /// Multiplier applied to the raw value before clamping.
    #[serde(default = "default_scale")]
    pub scale: f64,
}

fn default_unit() -> String {
    "unit".to_string()
}

fn default_scale() -> f64 {
    1.0
}

impl FieldMapping {
    /// Create a mapping with default unit, scale and target.
    pub fn new(field: impl Into<String>, metric: impl Into<String>, transform: Transform) -> Self {
        Self {
            field: field.into(),
            metric: Some(metric.into()),
            unit: default_unit(),
            transform,
            target: None,
            scale: default_scale(),
        }
    }

    /// Set the unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Set the target numeric type.
    pub fn with_target(mut self, target: NumericType) -> Self {
        self.target = Some(target);
        self
    }

    /// Set the scale factor.
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Target type, defaulting by transform: counts are `i32`, everything else `f64`.
    pub fn effective_target(&self) -> NumericType {
        self.target.unwrap_or(match self.transform {
            Transform::Count => NumericType::I32,
            Transform::Value | Transform::Rate => NumericType::F64,
        })
    }
}

/// Numeric type a metric value is stored as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumericType {
    I32,
    I64,
    U32,
    U64,
    F32,
    F64,
}

impl NumericType {
    /// Whether values of this type are integral.
    pub fn is_integer(&self) -> bool {
        !matches!(self, NumericType::F32 | NumericType::F64)
    }

    /// Inclusive range of an integral type, `None` for floats.
    pub fn int_range(&self) -> Option<(i128, i128)> {
        match self {
            NumericType::I32 => Some((i32::MIN as i128, i32::MAX as i128)),
            NumericType::I64 => Some((i64::MIN as i128, i64::MAX as i128)),
            NumericType::U32 => Some((0, u32::MAX as i128)),
            NumericType::U64 => Some((0, u64::MAX as i128)),
            NumericType::F32 | NumericType::F64 => None,
        }
    }

    /// Largest finite float of this type.
    pub fn float_max(&self) -> f64 {
        match self {
            NumericType::F32 => f32::MAX as f64,
            _ => f64::MAX,
        }
    }
}

/// One raw value returned by a data source.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bool(bool),
    Null,
}

impl RawValue {
    /// Render the value for metric name templates and instance filters.
    pub fn render(&self) -> String {
        match self {
            RawValue::Int(v) => v.to_string(),
            RawValue::UInt(v) => v.to_string(),
            RawValue::Float(v) => v.to_string(),
            RawValue::Text(s) => s.clone(),
            RawValue::Bool(b) => b.to_string(),
            RawValue::Null => String::new(),
        }
    }
}

impl From<i64> for RawValue {
    fn from(v: i64) -> Self {
        RawValue::Int(v)
    }
}

impl From<u64> for RawValue {
    fn from(v: u64) -> Self {
        RawValue::UInt(v)
    }
}

impl From<f64> for RawValue {
    fn from(v: f64) -> Self {
        RawValue::Float(v)
    }
}

impl From<&str> for RawValue {
    fn from(v: &str) -> Self {
        RawValue::Text(v.to_string())
    }
}

impl From<String> for RawValue {
    fn from(v: String) -> Self {
        RawValue::Text(v)
    }
}

/// One row of raw values for one endpoint at one poll cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    fields: Vec<(String, RawValue)>,
}

impl QueryResult {
    /// Create an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<RawValue>) -> Self {
        self.insert(field, value);
        self
    }

    /// Insert or replace a field, keeping first-insertion order.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<RawValue>) {
        let field = field.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(name, _)| *name == field) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((field, value)),
        }
    }

    /// Look up a field.
    pub fn get(&self, field: &str) -> Option<&RawValue> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    /// Iterate fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RawValue)> {
        self.fields
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
