//! Raw query rows to metric records.
//!
//! A [`MetricMapper`] is compiled once per [`MetricQuery`] and then reused for
//! every row of every endpoint running that query. Compilation resolves name
//! templates and target types up front so that mapping a row only has to look
//! up fields and convert values.

use pollsight_common::{MetricRecord, MetricValue, Transform};

use crate::error::{AgentError, ConversionError};
use crate::query::{FieldMapping, MetricQuery, NumericType, QueryResult, RawValue};

/// Compiled field table of one query.
#[derive(Debug, Clone)]
pub struct MetricMapper {
    query: String,
    prefix: String,
    instance_field: Option<String>,
    fields: Vec<CompiledField>,
}

#[derive(Debug, Clone)]
struct CompiledField {
    field: String,
    name: NameTemplate,
    unit: String,
    transform: Transform,
    target: NumericType,
    scale: f64,
}

impl MetricMapper {
    /// Compile the field table of `query`.
    pub fn compile(query: &MetricQuery) -> Result<Self, AgentError> {
        let fields = query
            .fields
            .iter()
            .map(CompiledField::compile)
            .collect::<Result<Vec<_>, String>>()
            .map_err(|e| AgentError::validation(format!("query '{}': {}", query.name, e)))?;

        Ok(Self {
            query: query.name.clone(),
            prefix: query.metric_prefix.trim_matches('/').to_string(),
            instance_field: query.instance_field.clone(),
            fields,
        })
    }

    /// Name of the query this mapper was compiled from.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Number of mapped fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Instance a row describes, if the query declares an instance field.
    pub fn instance(&self, row: &QueryResult) -> Option<String> {
        let field = self.instance_field.as_ref()?;
        row.get(field).map(RawValue::render)
    }

    /// Map one row.
    ///
    /// Fields that cannot be converted are logged and skipped; the remaining
    /// fields of the row are still mapped.
    pub fn map(&self, row: &QueryResult) -> Vec<MetricRecord> {
        let mut records = Vec::with_capacity(self.fields.len());

        for compiled in &self.fields {
            match self.map_field(compiled, row) {
                Ok(record) => records.push(record),
                Err(e @ (ConversionError::Missing(_) | ConversionError::Null(_))) => {
                    tracing::debug!(query = %self.query, error = %e, "Skipping field");
                }
                Err(e) => {
                    tracing::warn!(query = %self.query, error = %e, "Skipping field");
                }
            }
        }

        records
    }

    fn map_field(
        &self,
        compiled: &CompiledField,
        row: &QueryResult,
    ) -> Result<MetricRecord, ConversionError> {
        let raw = row
            .get(&compiled.field)
            .ok_or_else(|| ConversionError::Missing(compiled.field.clone()))?;
        let value = convert(&compiled.field, raw, compiled.scale, compiled.target)?;
        let name = compiled.name.render(row)?;

        let full_name = if self.prefix.is_empty() {
            name
        } else if name.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}/{}", self.prefix, name)
        };

        Ok(MetricRecord::new(
            full_name,
            compiled.unit.clone(),
            value,
            compiled.transform,
        ))
    }
}

impl CompiledField {
    fn compile(mapping: &FieldMapping) -> Result<Self, String> {
        if mapping.field.is_empty() {
            return Err("field mapping with empty field name".to_string());
        }
        if !mapping.scale.is_finite() {
            return Err(format!("field '{}' has a non-finite scale", mapping.field));
        }

        let name = match &mapping.metric {
            Some(template) => NameTemplate::parse(template)
                .map_err(|e| format!("field '{}': {}", mapping.field, e))?,
            None => NameTemplate::literal(&mapping.field),
        };

        Ok(Self {
            field: mapping.field.clone(),
            name,
            unit: mapping.unit.clone(),
            transform: mapping.transform,
            target: mapping.effective_target(),
            scale: mapping.scale,
        })
    }
}

/// Metric name with `{field}` placeholders filled from the row.
#[derive(Debug, Clone, PartialEq)]
struct NameTemplate {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field(String),
}

impl NameTemplate {
    fn literal(name: &str) -> Self {
        Self {
            segments: vec![Segment::Literal(name.to_string())],
        }
    }

    fn parse(template: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars();

        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    let mut field = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') | None => {
                                return Err(format!("unclosed placeholder in '{}'", template));
                            }
                            Some(c) => field.push(c),
                        }
                    }
                    if field.is_empty() {
                        return Err(format!("empty placeholder in '{}'", template));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(field));
                }
                '}' => return Err(format!("unmatched '}}' in '{}'", template)),
                c => literal.push(c),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { segments })
    }

    fn render(&self, row: &QueryResult) -> Result<String, ConversionError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Field(field) => {
                    let value = row
                        .get(field)
                        .ok_or_else(|| ConversionError::Missing(field.clone()))?;
                    out.push_str(&value.render());
                }
            }
        }
        Ok(out)
    }
}

/// Intermediate numeric form before clamping.
#[derive(Debug, Clone, Copy)]
enum Number {
    Int(i128),
    Float(f64),
}

impl Number {
    fn as_f64(self) -> f64 {
        match self {
            Number::Int(v) => v as f64,
            Number::Float(v) => v,
        }
    }
}

/// Convert a raw value into a metric value of the target type.
///
/// Out-of-range values saturate at the bounds of `target`.
fn convert(
    field: &str,
    raw: &RawValue,
    scale: f64,
    target: NumericType,
) -> Result<MetricValue, ConversionError> {
    let mut number = match raw {
        RawValue::Int(v) => Number::Int(*v as i128),
        RawValue::UInt(v) => Number::Int(*v as i128),
        RawValue::Float(v) => Number::Float(*v),
        RawValue::Bool(b) => Number::Int(*b as i128),
        RawValue::Text(s) => parse_number(s.trim()).ok_or_else(|| ConversionError::NotNumeric {
            field: field.to_string(),
            value: s.clone(),
        })?,
        RawValue::Null => return Err(ConversionError::Null(field.to_string())),
    };

    if scale != 1.0 {
        number = Number::Float(number.as_f64() * scale);
    }

    if let Number::Float(f) = number
        && f.is_nan()
    {
        return Err(ConversionError::NotFinite(field.to_string()));
    }

    let Some((min, max)) = target.int_range() else {
        let bound = target.float_max();
        let mut v = number.as_f64().clamp(-bound, bound);
        if target == NumericType::F32 {
            v = v as f32 as f64;
        }
        return Ok(MetricValue::Float(v));
    };

    let clamped = match number {
        Number::Int(v) => v.clamp(min, max),
        Number::Float(f) if f >= max as f64 => max,
        Number::Float(f) if f <= min as f64 => min,
        Number::Float(f) => f.round() as i128,
    };

    Ok(match target {
        NumericType::U32 | NumericType::U64 => MetricValue::UInt(clamped as u64),
        _ => MetricValue::Int(clamped as i64),
    })
}

fn parse_number(s: &str) -> Option<Number> {
    if let Ok(v) = s.parse::<i128>() {
        return Some(Number::Int(v));
    }
    s.parse::<f64>().ok().map(Number::Float)
}
