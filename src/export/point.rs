use crate::error::{ImporterError, Result};
use std::collections::BTreeMap;
use std::fmt::Write;

pub const TAG_TOPIC: &str = "topic";
pub const TAG_CONSUMER_GROUP: &str = "consumer_group";
pub const TAG_CLUSTER: &str = "cluster";

// "offset" is reserved in InfluxQL
pub const FIELD_OFFSET: &str = "offsize";
pub const FIELD_LOG_SIZE: &str = "logsize";
pub const FIELD_LAG: &str = "lag";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Seconds,
}

impl Precision {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Seconds => "s",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Integer(i64),
}

/// One timestamped measurement in InfluxDB's data model.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    timestamp: i64,
}

impl Point {
    pub fn new(
        measurement: impl Into<String>,
        tags: BTreeMap<String, String>,
        fields: BTreeMap<String, FieldValue>,
        timestamp: i64,
    ) -> Result<Self> {
        let measurement = measurement.into();
        if measurement.is_empty() {
            return Err(ImporterError::InvalidPoint(
                "measurement name cannot be empty".to_string(),
            ));
        }
        if fields.is_empty() {
            return Err(ImporterError::InvalidPoint(format!(
                "point for '{measurement}' has no fields"
            )));
        }
        if tags.keys().any(String::is_empty) {
            return Err(ImporterError::InvalidPoint(format!(
                "point for '{measurement}' has an empty tag key"
            )));
        }
        if fields.keys().any(String::is_empty) {
            return Err(ImporterError::InvalidPoint(format!(
                "point for '{measurement}' has an empty field key"
            )));
        }

        Ok(Self {
            measurement,
            tags,
            fields,
            timestamp,
        })
    }

    #[cfg(test)]
    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    #[cfg(test)]
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    #[cfg(test)]
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    #[cfg(test)]
    pub const fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Append this point as one line of InfluxDB line protocol. Tags with
    /// empty values are omitted, as InfluxDB drops them anyway.
    pub fn write_line(&self, out: &mut String) {
        escape_into(out, &self.measurement, &[',', ' ']);

        for (key, value) in &self.tags {
            if value.is_empty() {
                continue;
            }
            out.push(',');
            escape_into(out, key, &[',', '=', ' ']);
            out.push('=');
            escape_into(out, value, &[',', '=', ' ']);
        }

        let mut first = true;
        for (key, value) in &self.fields {
            out.push(if first { ' ' } else { ',' });
            first = false;
            escape_into(out, key, &[',', '=', ' ']);
            out.push('=');
            // Writing into a String cannot fail
            let _ = match value {
                FieldValue::Integer(v) => write!(out, "{v}i"),
            };
        }

        let _ = write!(out, " {}", self.timestamp);
    }
}

fn escape_into(out: &mut String, raw: &str, special: &[char]) {
    for c in raw.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        if c == '\n' {
            out.push_str("\\n");
            continue;
        }
        out.push(c);
    }
}

/// Points bound for one database at one precision.
#[derive(Debug, Clone)]
pub struct BatchPoints {
    database: String,
    precision: Precision,
    points: Vec<Point>,
}

impl BatchPoints {
    pub fn new(database: impl Into<String>, precision: Precision) -> Self {
        Self {
            database: database.into(),
            precision,
            points: Vec::new(),
        }
    }

    pub fn add_point(&mut self, point: Point) {
        self.points.push(point);
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub const fn precision(&self) -> Precision {
        self.precision
    }

    #[cfg(test)]
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn to_line_protocol(&self) -> String {
        let mut out = String::with_capacity(self.points.len() * 128);
        for point in &self.points {
            point.write_line(&mut out);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_strategies::strategies::{arb_cluster_name, arb_group_id};
    use proptest::prelude::*;

    fn fields(lag: i64) -> BTreeMap<String, FieldValue> {
        BTreeMap::from([(FIELD_LAG.to_string(), FieldValue::Integer(lag))])
    }

    #[test]
    fn test_line_protocol_format() {
        let tags = BTreeMap::from([
            (TAG_TOPIC.to_string(), "orders".to_string()),
            (TAG_CLUSTER.to_string(), "local".to_string()),
            (TAG_CONSUMER_GROUP.to_string(), "billing".to_string()),
        ]);
        let fields = BTreeMap::from([
            (FIELD_OFFSET.to_string(), FieldValue::Integer(420)),
            (FIELD_LOG_SIZE.to_string(), FieldValue::Integer(500)),
            (FIELD_LAG.to_string(), FieldValue::Integer(80)),
        ]);
        let point = Point::new("consumer_metrics", tags, fields, 1_700_000_000).unwrap();

        let mut line = String::new();
        point.write_line(&mut line);
        assert_eq!(
            line,
            "consumer_metrics,cluster=local,consumer_group=billing,topic=orders \
             lag=80i,logsize=500i,offsize=420i 1700000000"
        );
    }

    #[test]
    fn test_line_protocol_escaping() {
        let tags = BTreeMap::from([("env name".to_string(), "a,b=c".to_string())]);
        let point = Point::new("my metric", tags, fields(-3), 7).unwrap();

        let mut line = String::new();
        point.write_line(&mut line);
        assert_eq!(line, r"my\ metric,env\ name=a\,b\=c lag=-3i 7");
    }

    #[test]
    fn test_empty_tag_values_are_omitted() {
        let tags = BTreeMap::from([
            ("cluster".to_string(), "local".to_string()),
            ("dc".to_string(), String::new()),
        ]);
        let point = Point::new("m", tags, fields(1), 1).unwrap();

        let mut line = String::new();
        point.write_line(&mut line);
        assert_eq!(line, "m,cluster=local lag=1i 1");
    }

    #[test]
    fn test_invalid_points_are_rejected() {
        assert!(Point::new("", BTreeMap::new(), fields(1), 1).is_err());
        assert!(Point::new("m", BTreeMap::new(), BTreeMap::new(), 1).is_err());

        let tags = BTreeMap::from([(String::new(), "x".to_string())]);
        assert!(Point::new("m", tags, fields(1), 1).is_err());

        let unnamed = BTreeMap::from([(String::new(), FieldValue::Integer(1))]);
        let err = Point::new("m", BTreeMap::new(), unnamed, 1).unwrap_err();
        assert!(matches!(err, ImporterError::InvalidPoint(_)));
    }

    #[test]
    fn test_batch_renders_one_line_per_point() {
        let mut batch = BatchPoints::new("lag", Precision::Seconds);
        assert!(batch.is_empty());
        batch.add_point(Point::new("m", BTreeMap::new(), fields(1), 1).unwrap());
        batch.add_point(Point::new("m", BTreeMap::new(), fields(2), 2).unwrap());

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.database(), "lag");
        assert_eq!(batch.precision().as_str(), "s");
        assert_eq!(batch.to_line_protocol(), "m lag=1i 1\nm lag=2i 2\n");
    }

    proptest! {
        /// Tag values never leak an unescaped separator into the line
        #[test]
        fn prop_tag_values_are_escaped(
            cluster in arb_cluster_name(),
            group in arb_group_id(),
            suffix in "[ ,=]{1,3}",
        ) {
            let value = format!("{group}{suffix}");
            let tags = BTreeMap::from([
                (TAG_CLUSTER.to_string(), cluster.clone()),
                (TAG_CONSUMER_GROUP.to_string(), value.clone()),
            ]);
            let point = Point::new("m", tags, fields(0), 0).unwrap();

            let mut line = String::new();
            point.write_line(&mut line);

            let mut expected = String::new();
            escape_into(&mut expected, &value, &[',', '=', ' ']);
            let prefix = format!("m,cluster={cluster},consumer_group={expected} ");
            prop_assert!(line.starts_with(&prefix), "{} does not start with {}", line, prefix);
        }
    }
}
