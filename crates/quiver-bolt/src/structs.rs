//! Typed structure catalog for PackStream values.
//!
//! Structures inside values are gated per protocol version: the catalog
//! lists every signature a client may legally send, with its field count.
//! Version 1 allows none; version 2 adds the spatial and temporal types.
//! Graph entities (nodes, relationships, paths) only ever travel from
//! server to client, so they are never in a catalog; this module still
//! provides their signatures and constructors for record encoding.

use crate::value::{Struct, Value, ValueMap};

/// 2D point: srid, x, y.
pub const POINT_2D: u8 = 0x58;
/// Date: days since the epoch.
pub const DATE: u8 = 0x44;
/// Time with UTC offset: nanoseconds of day, offset seconds.
pub const TIME: u8 = 0x54;
/// Local time: nanoseconds of day.
pub const LOCAL_TIME: u8 = 0x74;
/// Date-time with UTC offset: epoch seconds, nanoseconds, offset seconds.
pub const DATE_TIME: u8 = 0x46;
/// Date-time with a named zone: epoch seconds, nanoseconds, zone id.
pub const DATE_TIME_ZONE_ID: u8 = 0x66;
/// Local date-time: epoch seconds, nanoseconds.
pub const LOCAL_DATE_TIME: u8 = 0x64;
/// Duration: months, days, seconds, nanoseconds.
pub const DURATION: u8 = 0x45;

/// Node: id, labels, properties.
pub const NODE: u8 = 0x4E;
/// Relationship: id, start node, end node, type, properties.
pub const RELATIONSHIP: u8 = 0x52;
/// Relationship without endpoints, used inside paths.
pub const UNBOUND_RELATIONSHIP: u8 = 0x72;
/// Path: nodes, relationships, traversal indices.
pub const PATH: u8 = 0x50;

/// A structure kind a client is allowed to send: signature, display name,
/// and required field count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructDef {
    pub signature: u8,
    pub name: &'static str,
    pub arity: usize,
}

/// The set of value structures decodable under one protocol version.
#[derive(Debug, Clone, Default)]
pub struct StructCatalog {
    entries: Vec<StructDef>,
}

// Kept in a static so borrowers get the 'static lifetime.
static EMPTY_CATALOG: StructCatalog = StructCatalog {
    entries: Vec::new(),
};

impl StructCatalog {
    /// The catalog that rejects every structure.
    pub fn empty() -> &'static StructCatalog {
        &EMPTY_CATALOG
    }

    /// Build the catalog for a protocol version.
    pub fn for_version(version: u32) -> Self {
        if version < 2 {
            return Self::default();
        }
        Self {
            entries: vec![
                StructDef { signature: POINT_2D, name: "Point2D", arity: 3 },
                StructDef { signature: DATE, name: "Date", arity: 1 },
                StructDef { signature: TIME, name: "Time", arity: 2 },
                StructDef { signature: LOCAL_TIME, name: "LocalTime", arity: 1 },
                StructDef { signature: DATE_TIME, name: "DateTime", arity: 3 },
                StructDef { signature: DATE_TIME_ZONE_ID, name: "DateTimeZoneId", arity: 3 },
                StructDef { signature: LOCAL_DATE_TIME, name: "LocalDateTime", arity: 2 },
                StructDef { signature: DURATION, name: "Duration", arity: 4 },
            ],
        }
    }

    /// Look up a structure definition by signature.
    pub fn lookup(&self, signature: u8) -> Option<&StructDef> {
        self.entries.iter().find(|def| def.signature == signature)
    }

    /// Number of structure kinds in the catalog.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the catalog rejects every structure.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Build a 2D point value.
pub fn point_2d(srid: i64, x: f64, y: f64) -> Value {
    Value::Struct(Struct::new(
        POINT_2D,
        vec![Value::Int(srid), Value::Float(x), Value::Float(y)],
    ))
}

/// Build a date value from days since the epoch.
pub fn date(days: i64) -> Value {
    Value::Struct(Struct::new(DATE, vec![Value::Int(days)]))
}

/// Build a time value from nanoseconds of day and a UTC offset in seconds.
pub fn time(nanos_of_day: i64, offset_seconds: i64) -> Value {
    Value::Struct(Struct::new(
        TIME,
        vec![Value::Int(nanos_of_day), Value::Int(offset_seconds)],
    ))
}

/// Build a local time value from nanoseconds of day.
pub fn local_time(nanos_of_day: i64) -> Value {
    Value::Struct(Struct::new(LOCAL_TIME, vec![Value::Int(nanos_of_day)]))
}

/// Build an offset date-time value.
pub fn date_time(epoch_seconds: i64, nanos: i64, offset_seconds: i64) -> Value {
    Value::Struct(Struct::new(
        DATE_TIME,
        vec![
            Value::Int(epoch_seconds),
            Value::Int(nanos),
            Value::Int(offset_seconds),
        ],
    ))
}

/// Build a date-time value carrying a zone name.
pub fn date_time_zone_id(epoch_seconds: i64, nanos: i64, zone_id: &str) -> Value {
    Value::Struct(Struct::new(
        DATE_TIME_ZONE_ID,
        vec![
            Value::Int(epoch_seconds),
            Value::Int(nanos),
            Value::String(zone_id.to_string()),
        ],
    ))
}

/// Build a local date-time value.
pub fn local_date_time(epoch_seconds: i64, nanos: i64) -> Value {
    Value::Struct(Struct::new(
        LOCAL_DATE_TIME,
        vec![Value::Int(epoch_seconds), Value::Int(nanos)],
    ))
}

/// Build a duration value.
pub fn duration(months: i64, days: i64, seconds: i64, nanos: i64) -> Value {
    Value::Struct(Struct::new(
        DURATION,
        vec![
            Value::Int(months),
            Value::Int(days),
            Value::Int(seconds),
            Value::Int(nanos),
        ],
    ))
}

/// Build a node value for a record.
pub fn node(id: i64, labels: Vec<String>, properties: ValueMap) -> Value {
    let labels = labels.into_iter().map(Value::String).collect();
    Value::Struct(Struct::new(
        NODE,
        vec![Value::Int(id), Value::List(labels), Value::Map(properties)],
    ))
}

/// Build a relationship value for a record.
pub fn relationship(
    id: i64,
    start_node: i64,
    end_node: i64,
    type_name: &str,
    properties: ValueMap,
) -> Value {
    Value::Struct(Struct::new(
        RELATIONSHIP,
        vec![
            Value::Int(id),
            Value::Int(start_node),
            Value::Int(end_node),
            Value::String(type_name.to_string()),
            Value::Map(properties),
        ],
    ))
}
