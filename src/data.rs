//! # Entity Values
//!
//! The values stored under the keys of [`crate::types`]:
//!
//! - [`Feature`]: a procedure or feature of interest (one version of it)
//! - [`DataStreamInfo`]: one versioned output of a procedure, with its record
//!   schema and encoding
//! - [`ObsData`]: one observation, carrying its result record
//!
//! Result records are [`DataBlock`]s: flat, schema-less rows of
//! [`DataValue`]s. Their meaning comes from the [`RecordSchema`] of the data
//! stream they belong to.

use std::fmt;

use geo::Geometry;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::builder::Draft;
use crate::error::{Error, Result};
use crate::types::{DataStreamKey, FeatureId, TimeExtent, Timestamp, TIME_MIN};

// =============================================================================
// Records
// =============================================================================

/// One scalar in a result record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Time(Timestamp),
    Text(String),
    Null,
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataValue::Bool(v) => write!(f, "{}", v),
            DataValue::Int(v) => write!(f, "{}", v),
            DataValue::Double(v) => write!(f, "{}", v),
            DataValue::Time(v) => write!(f, "{}", v.to_rfc3339()),
            DataValue::Text(v) => write!(f, "{}", v),
            DataValue::Null => Ok(()),
        }
    }
}

impl From<f64> for DataValue {
    fn from(v: f64) -> Self {
        DataValue::Double(v)
    }
}

impl From<i64> for DataValue {
    fn from(v: i64) -> Self {
        DataValue::Int(v)
    }
}

impl From<bool> for DataValue {
    fn from(v: bool) -> Self {
        DataValue::Bool(v)
    }
}

impl From<&str> for DataValue {
    fn from(v: &str) -> Self {
        DataValue::Text(v.to_string())
    }
}

impl From<Timestamp> for DataValue {
    fn from(v: Timestamp) -> Self {
        DataValue::Time(v)
    }
}

/// An opaque result record: an ordered row of values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataBlock(Vec<DataValue>);

impl DataBlock {
    pub fn new(values: Vec<DataValue>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[DataValue] {
        &self.0
    }

    pub fn get(&self, index: usize) -> Option<&DataValue> {
        self.0.get(index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<DataValue> for DataBlock {
    fn from_iter<I: IntoIterator<Item = DataValue>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// =============================================================================
// Schemas and Encodings
// =============================================================================

/// Type of a record component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Integer,
    Double,
    Time,
    Text,
    /// Nested record.
    Record(Vec<RecordField>),
}

/// One named component of a record schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordField {
    pub name: String,
    /// Observed property URI, if the component measures one.
    pub definition: Option<String>,
    pub data_type: DataType,
    pub uom: Option<String>,
}

impl RecordField {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            definition: None,
            data_type,
            uom: None,
        }
    }

    pub fn with_definition(mut self, definition: impl Into<String>) -> Self {
        self.definition = Some(definition.into());
        self
    }

    pub fn with_uom(mut self, uom: impl Into<String>) -> Self {
        self.uom = Some(uom.into());
        self
    }
}

/// Named description of the records of a data stream.
///
/// The schema name doubles as the output name of the data stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordSchema {
    name: String,
    fields: Vec<RecordField>,
}

impl RecordSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: RecordField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[RecordField] {
        &self.fields
    }

    /// Whether any component (at any nesting depth) has this definition.
    pub fn has_observable(&self, definition: &str) -> bool {
        fn walk(fields: &[RecordField], definition: &str) -> bool {
            fields.iter().any(|f| {
                f.definition.as_deref() == Some(definition)
                    || matches!(&f.data_type, DataType::Record(inner) if walk(inner, definition))
            })
        }
        walk(&self.fields, definition)
    }

    /// All component definitions, depth first.
    pub fn observables(&self) -> Vec<&str> {
        fn walk<'a>(fields: &'a [RecordField], out: &mut Vec<&'a str>) {
            for f in fields {
                if let Some(def) = f.definition.as_deref() {
                    out.push(def);
                }
                if let DataType::Record(inner) = &f.data_type {
                    walk(inner, out);
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.fields, &mut out);
        out
    }

    /// Hash of the record structure: component names, types and definitions.
    ///
    /// Two schemas with equal hashes produce interchangeable records. Labels,
    /// units and the schema name are not part of the structure.
    pub fn structure_hash(&self) -> u64 {
        fn walk(fields: &[RecordField], buf: &mut Vec<u8>) {
            for f in fields {
                buf.extend_from_slice(f.name.as_bytes());
                buf.push(0);
                if let Some(def) = &f.definition {
                    buf.extend_from_slice(def.as_bytes());
                }
                buf.push(0);
                match &f.data_type {
                    DataType::Boolean => buf.push(1),
                    DataType::Integer => buf.push(2),
                    DataType::Double => buf.push(3),
                    DataType::Time => buf.push(4),
                    DataType::Text => buf.push(5),
                    DataType::Record(inner) => {
                        buf.push(6);
                        walk(inner, buf);
                        buf.push(7);
                    }
                }
            }
        }
        let mut buf = Vec::with_capacity(64);
        walk(&self.fields, &mut buf);
        xxh3_64(&buf)
    }

    pub fn is_compatible(&self, other: &RecordSchema) -> bool {
        self.structure_hash() == other.structure_hash()
    }
}

/// How records of a data stream are encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordEncoding {
    /// Delimited text.
    Text {
        token_separator: String,
        block_separator: String,
    },
    Json,
    Binary,
}

impl Default for RecordEncoding {
    fn default() -> Self {
        RecordEncoding::Text {
            token_separator: ",".to_string(),
            block_separator: "\n".to_string(),
        }
    }
}

// =============================================================================
// Features
// =============================================================================

/// One version of a feature: a procedure, a feature of interest, or a
/// sampling feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    unique_id: String,
    name: String,
    description: Option<String>,
    geometry: Option<Geometry<f64>>,
    valid_time: Option<TimeExtent>,
    /// Internal id of the parent group; 0 when top level.
    parent_id: u64,
    /// Internal id of the sampled feature; 0 when not a sampling feature.
    sampled_feature_id: u64,
}

impl Feature {
    pub fn new(unique_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            unique_id: unique_id.into(),
            name: name.into(),
            description: None,
            geometry: None,
            valid_time: None,
            parent_id: 0,
            sampled_feature_id: 0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_geometry(mut self, geometry: impl Into<Geometry<f64>>) -> Self {
        self.geometry = Some(geometry.into());
        self
    }

    pub fn with_valid_time(mut self, valid_time: TimeExtent) -> Self {
        self.valid_time = Some(valid_time);
        self
    }

    pub fn with_parent(mut self, parent_id: u64) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_sampled_feature(mut self, sampled_feature_id: u64) -> Self {
        self.sampled_feature_id = sampled_feature_id;
        self
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn geometry(&self) -> Option<&Geometry<f64>> {
        self.geometry.as_ref()
    }

    pub fn valid_time(&self) -> Option<&TimeExtent> {
        self.valid_time.as_ref()
    }

    pub fn parent_id(&self) -> u64 {
        self.parent_id
    }

    pub fn sampled_feature_id(&self) -> u64 {
        self.sampled_feature_id
    }

    /// Start of validity of this version; [`TIME_MIN`] when unspecified.
    pub fn valid_start_time(&self) -> Timestamp {
        self.valid_time.map(|t| t.begin()).unwrap_or(TIME_MIN)
    }

    /// Text searched by full-text filters.
    pub fn searchable_text(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.description.as_deref())
    }

    /// Drops fields not requested by a partial read.
    pub(crate) fn strip(&mut self, keep_description: bool, keep_geometry: bool) {
        if !keep_description {
            self.description = None;
        }
        if !keep_geometry {
            self.geometry = None;
        }
    }
}

// =============================================================================
// Data Streams
// =============================================================================

/// Description of one versioned output of a procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataStreamInfo {
    procedure_id: FeatureId,
    record_version: u32,
    record_schema: RecordSchema,
    record_encoding: RecordEncoding,
    valid_time: TimeExtent,
}

impl DataStreamInfo {
    pub fn builder() -> DataStreamInfoBuilder {
        DataStreamInfoBuilder {
            draft: Draft::new("DataStreamInfo", PartialDataStream::default()),
        }
    }

    pub fn procedure_id(&self) -> &FeatureId {
        &self.procedure_id
    }

    pub fn record_version(&self) -> u32 {
        self.record_version
    }

    pub fn record_schema(&self) -> &RecordSchema {
        &self.record_schema
    }

    pub fn record_encoding(&self) -> &RecordEncoding {
        &self.record_encoding
    }

    pub fn valid_time(&self) -> &TimeExtent {
        &self.valid_time
    }

    /// The output name (the record schema name).
    pub fn output_name(&self) -> &str {
        self.record_schema.name()
    }
}

#[derive(Debug, Default)]
struct PartialDataStream {
    procedure_id: Option<FeatureId>,
    record_version: u32,
    record_schema: Option<RecordSchema>,
    record_encoding: Option<RecordEncoding>,
    valid_time: Option<TimeExtent>,
}

/// Builder for [`DataStreamInfo`].
#[derive(Debug)]
pub struct DataStreamInfoBuilder {
    draft: Draft<PartialDataStream>,
}

impl DataStreamInfoBuilder {
    pub fn procedure(&mut self, procedure_id: FeatureId) -> &mut Self {
        self.draft.edit(|d| d.procedure_id = Some(procedure_id));
        self
    }

    pub fn record_version(&mut self, version: u32) -> &mut Self {
        self.draft.edit(|d| d.record_version = version);
        self
    }

    pub fn record_schema(&mut self, schema: RecordSchema) -> &mut Self {
        self.draft.edit(|d| d.record_schema = Some(schema));
        self
    }

    pub fn record_encoding(&mut self, encoding: RecordEncoding) -> &mut Self {
        self.draft.edit(|d| d.record_encoding = Some(encoding));
        self
    }

    pub fn valid_time(&mut self, valid_time: TimeExtent) -> &mut Self {
        self.draft.edit(|d| d.valid_time = Some(valid_time));
        self
    }

    pub fn build(&mut self) -> Result<DataStreamInfo> {
        let d = self.draft.take()?;
        let procedure_id = d
            .procedure_id
            .ok_or_else(|| Error::validation("data stream needs a procedure"))?;
        if procedure_id.internal_id() == 0 {
            return Err(Error::validation(
                "data stream procedure must have an internal id > 0",
            ));
        }
        let record_schema = d
            .record_schema
            .ok_or_else(|| Error::validation("data stream needs a record schema"))?;
        if record_schema.name().is_empty() {
            return Err(Error::validation("record schema needs a name"));
        }
        let record_encoding = d
            .record_encoding
            .ok_or_else(|| Error::validation("data stream needs a record encoding"))?;
        Ok(DataStreamInfo {
            procedure_id,
            record_version: d.record_version,
            record_schema,
            record_encoding,
            valid_time: d.valid_time.unwrap_or_else(|| TimeExtent::beginning_at(TIME_MIN)),
        })
    }
}

// =============================================================================
// Observations
// =============================================================================

/// Free-form observation parameters.
pub type ObsParameters = serde_json::Map<String, serde_json::Value>;

/// One observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObsData {
    datastream_id: DataStreamKey,
    foi_id: u64,
    phenomenon_time: Timestamp,
    result_time: Option<Timestamp>,
    parameters: Option<ObsParameters>,
    phenomenon_location: Option<Geometry<f64>>,
    result: DataBlock,
}

impl ObsData {
    pub fn builder() -> ObsDataBuilder {
        ObsDataBuilder {
            draft: Draft::new("ObsData", PartialObs::default()),
        }
    }

    pub fn datastream_id(&self) -> DataStreamKey {
        self.datastream_id
    }

    /// Internal id of the feature of interest; 0 when none.
    pub fn foi_id(&self) -> u64 {
        self.foi_id
    }

    pub fn has_foi(&self) -> bool {
        self.foi_id != 0
    }

    pub fn phenomenon_time(&self) -> Timestamp {
        self.phenomenon_time
    }

    /// Result time, falling back to the phenomenon time.
    pub fn result_time(&self) -> Timestamp {
        self.result_time.unwrap_or(self.phenomenon_time)
    }

    /// Result time, only if it was recorded apart from the phenomenon time.
    pub fn explicit_result_time(&self) -> Option<Timestamp> {
        self.result_time
    }

    pub fn parameters(&self) -> Option<&ObsParameters> {
        self.parameters.as_ref()
    }

    pub fn phenomenon_location(&self) -> Option<&Geometry<f64>> {
        self.phenomenon_location.as_ref()
    }

    pub fn result(&self) -> &DataBlock {
        &self.result
    }

    /// Drops fields not requested by a partial read. A dropped result is
    /// replaced by an empty block.
    pub(crate) fn strip(&mut self, keep_parameters: bool, keep_location: bool, keep_result: bool) {
        if !keep_parameters {
            self.parameters = None;
        }
        if !keep_location {
            self.phenomenon_location = None;
        }
        if !keep_result {
            self.result = DataBlock::default();
        }
    }
}

#[derive(Debug, Default)]
struct PartialObs {
    datastream_id: Option<DataStreamKey>,
    foi_id: u64,
    phenomenon_time: Option<Timestamp>,
    result_time: Option<Timestamp>,
    parameters: Option<ObsParameters>,
    phenomenon_location: Option<Geometry<f64>>,
    result: Option<DataBlock>,
}

/// Builder for [`ObsData`].
#[derive(Debug)]
pub struct ObsDataBuilder {
    draft: Draft<PartialObs>,
}

impl ObsDataBuilder {
    pub fn datastream(&mut self, id: DataStreamKey) -> &mut Self {
        self.draft.edit(|o| o.datastream_id = Some(id));
        self
    }

    pub fn foi(&mut self, foi_id: u64) -> &mut Self {
        self.draft.edit(|o| o.foi_id = foi_id);
        self
    }

    pub fn phenomenon_time(&mut self, t: Timestamp) -> &mut Self {
        self.draft.edit(|o| o.phenomenon_time = Some(t));
        self
    }

    pub fn result_time(&mut self, t: Timestamp) -> &mut Self {
        self.draft.edit(|o| o.result_time = Some(t));
        self
    }

    pub fn parameter(&mut self, name: impl Into<String>, value: serde_json::Value) -> &mut Self {
        let name = name.into();
        self.draft.edit(|o| {
            o.parameters.get_or_insert_with(ObsParameters::new).insert(name, value);
        });
        self
    }

    pub fn phenomenon_location(&mut self, location: impl Into<Geometry<f64>>) -> &mut Self {
        let location = location.into();
        self.draft.edit(|o| o.phenomenon_location = Some(location));
        self
    }

    pub fn result(&mut self, result: DataBlock) -> &mut Self {
        self.draft.edit(|o| o.result = Some(result));
        self
    }

    pub fn build(&mut self) -> Result<ObsData> {
        let o = self.draft.take()?;
        let datastream_id = o
            .datastream_id
            .ok_or_else(|| Error::validation("observation needs a data stream"))?;
        let phenomenon_time = o
            .phenomenon_time
            .ok_or_else(|| Error::validation("observation needs a phenomenon time"))?;
        let result = o
            .result
            .ok_or_else(|| Error::validation("observation needs a result"))?;
        Ok(ObsData {
            datastream_id,
            foi_id: o.foi_id,
            phenomenon_time,
            result_time: o.result_time,
            parameters: o.parameters,
            phenomenon_location: o.phenomenon_location,
            result,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use geo::point;

    fn weather_schema() -> RecordSchema {
        RecordSchema::new("weather")
            .with_field(RecordField::new("time", DataType::Time))
            .with_field(
                RecordField::new("temp", DataType::Double)
                    .with_definition("http://sensorml.com/ont/swe/property/AirTemperature")
                    .with_uom("Cel"),
            )
            .with_field(RecordField::new(
                "wind",
                DataType::Record(vec![RecordField::new("speed", DataType::Double)
                    .with_definition("http://sensorml.com/ont/swe/property/WindSpeed")]),
            ))
    }

    #[test]
    fn test_nested_observables() {
        let schema = weather_schema();
        assert!(schema.has_observable("http://sensorml.com/ont/swe/property/WindSpeed"));
        assert!(!schema.has_observable("http://sensorml.com/ont/swe/property/Rain"));
        assert_eq!(schema.observables().len(), 2);
    }

    #[test]
    fn test_structure_hash_ignores_units_and_name() {
        let a = weather_schema();
        let b = RecordSchema::new("weather_v2")
            .with_field(RecordField::new("time", DataType::Time))
            .with_field(
                RecordField::new("temp", DataType::Double)
                    .with_definition("http://sensorml.com/ont/swe/property/AirTemperature")
                    .with_uom("degF"),
            )
            .with_field(RecordField::new(
                "wind",
                DataType::Record(vec![RecordField::new("speed", DataType::Double)
                    .with_definition("http://sensorml.com/ont/swe/property/WindSpeed")]),
            ));
        assert!(a.is_compatible(&b));

        let c = RecordSchema::new("weather").with_field(RecordField::new("time", DataType::Text));
        assert!(!a.is_compatible(&c));
    }

    #[test]
    fn test_datastream_requires_fields() {
        let err = DataStreamInfo::builder()
            .procedure(FeatureId::from_internal(1))
            .record_schema(weather_schema())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("record encoding"));

        let err = DataStreamInfo::builder()
            .procedure(FeatureId::new(0, "urn:proc"))
            .record_schema(weather_schema())
            .record_encoding(RecordEncoding::Json)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("internal id"));

        let ds = DataStreamInfo::builder()
            .procedure(FeatureId::from_internal(1))
            .record_schema(weather_schema())
            .record_encoding(RecordEncoding::default())
            .build()
            .unwrap();
        assert_eq!(ds.output_name(), "weather");
    }

    #[test]
    fn test_obs_result_time_fallback_and_strip() {
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut obs = ObsData::builder()
            .datastream(DataStreamKey::from_raw(1))
            .phenomenon_time(t)
            .parameter("quality", serde_json::json!("good"))
            .phenomenon_location(point!(x: 1.0, y: 2.0))
            .result(DataBlock::new(vec![21.5.into()]))
            .build()
            .unwrap();
        assert_eq!(obs.result_time(), t);
        assert!(obs.parameters().is_some());

        obs.strip(false, true, false);
        assert!(obs.parameters().is_none());
        assert!(obs.phenomenon_location().is_some());
        assert!(obs.result().is_empty());
    }

    #[test]
    fn test_obs_requires_result() {
        let err = ObsData::builder()
            .datastream(DataStreamKey::from_raw(1))
            .phenomenon_time(Utc::now())
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
