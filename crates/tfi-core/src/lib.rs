//! Core feed model: table catalog, dependency graph and typed records for TFI.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tfi-core";

/// Entity kinds carried by a transit schedule feed, in catalog declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Agency,
    Stop,
    Route,
    Calendar,
    CalendarDate,
    Trip,
    StopTime,
    Shape,
}

impl EntityKind {
    pub const ALL: [EntityKind; 8] = [
        EntityKind::Agency,
        EntityKind::Stop,
        EntityKind::Route,
        EntityKind::Calendar,
        EntityKind::CalendarDate,
        EntityKind::Trip,
        EntityKind::StopTime,
        EntityKind::Shape,
    ];

    pub fn spec(self) -> &'static TableSpec {
        // CATALOG is indexed by declaration order.
        &CATALOG[self as usize]
    }

    /// Table name as it appears in the archive, without the `.txt` suffix.
    pub fn table_name(self) -> &'static str {
        self.spec().table
    }

    pub fn file_name(self) -> &'static str {
        self.spec().file_name
    }

    pub fn from_table_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.table_name() == name)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// Key spaces other tables can point into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Agency,
    Stop,
    Route,
    Trip,
    Service,
}

impl ReferenceKind {
    pub const ALL: [ReferenceKind; 5] = [
        ReferenceKind::Agency,
        ReferenceKind::Stop,
        ReferenceKind::Route,
        ReferenceKind::Trip,
        ReferenceKind::Service,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReferenceKind::Agency => "agency",
            ReferenceKind::Stop => "stop",
            ReferenceKind::Route => "route",
            ReferenceKind::Trip => "trip",
            ReferenceKind::Service => "service",
        }
    }

    /// Entity kinds whose accepted rows extend this key space.
    pub fn providers(self) -> Vec<EntityKind> {
        EntityKind::ALL
            .into_iter()
            .filter(|kind| kind.spec().provides.map(|p| p.kind) == Some(self))
            .collect()
    }
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Int,
    Float,
    /// Floating point that also accepts a comma as decimal separator.
    Coordinate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
}

const fn text(name: &'static str) -> Column {
    Column { name, ty: ColumnType::Text }
}

const fn int(name: &'static str) -> Column {
    Column { name, ty: ColumnType::Int }
}

const fn float(name: &'static str) -> Column {
    Column { name, ty: ColumnType::Float }
}

const fn coord(name: &'static str) -> Column {
    Column { name, ty: ColumnType::Coordinate }
}

/// A field whose value must already be known in a reference key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    pub field: &'static str,
    pub references: ReferenceKind,
}

/// The key space a table contributes to, and which field carries the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyProvision {
    pub kind: ReferenceKind,
    pub field: &'static str,
}

#[derive(Debug)]
pub struct TableSpec {
    pub kind: EntityKind,
    pub table: &'static str,
    pub file_name: &'static str,
    /// Relation name in the relational store.
    pub store_table: &'static str,
    pub required: bool,
    /// Field used for within-chunk deduplication; `None` skips deduplication.
    pub natural_key: Option<&'static str>,
    /// Columns forming the store's uniqueness constraint (within a project).
    pub unique_key: &'static [&'static str],
    pub provides: Option<KeyProvision>,
    pub foreign_keys: &'static [ForeignKey],
    /// Optional self reference resolved by hierarchy ordering, not filtering.
    pub parent_key: Option<&'static str>,
    pub columns: &'static [Column],
}

impl TableSpec {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

pub static CATALOG: [TableSpec; 8] = [
    TableSpec {
        kind: EntityKind::Agency,
        table: "agency",
        file_name: "agency.txt",
        store_table: "Agency",
        required: true,
        natural_key: Some("agency_id"),
        unique_key: &["agency_id"],
        provides: Some(KeyProvision { kind: ReferenceKind::Agency, field: "agency_id" }),
        foreign_keys: &[],
        parent_key: None,
        columns: &[
            text("agency_id"),
            text("agency_name"),
            text("agency_url"),
            text("agency_timezone"),
            text("agency_lang"),
            text("agency_phone"),
            text("agency_fare_url"),
            text("agency_email"),
        ],
    },
    TableSpec {
        kind: EntityKind::Stop,
        table: "stops",
        file_name: "stops.txt",
        store_table: "Stop",
        required: true,
        natural_key: Some("stop_id"),
        unique_key: &["stop_id"],
        provides: Some(KeyProvision { kind: ReferenceKind::Stop, field: "stop_id" }),
        foreign_keys: &[],
        parent_key: Some("parent_station"),
        columns: &[
            text("stop_id"),
            text("stop_code"),
            text("stop_name"),
            text("stop_desc"),
            coord("stop_lat"),
            coord("stop_lon"),
            text("zone_id"),
            text("stop_url"),
            int("location_type"),
            text("parent_station"),
            text("stop_timezone"),
            int("wheelchair_boarding"),
            text("level_id"),
            text("platform_code"),
        ],
    },
    TableSpec {
        kind: EntityKind::Route,
        table: "routes",
        file_name: "routes.txt",
        store_table: "Route",
        required: true,
        natural_key: Some("route_id"),
        unique_key: &["route_id"],
        provides: Some(KeyProvision { kind: ReferenceKind::Route, field: "route_id" }),
        foreign_keys: &[ForeignKey { field: "agency_id", references: ReferenceKind::Agency }],
        parent_key: None,
        columns: &[
            text("route_id"),
            text("agency_id"),
            text("route_short_name"),
            text("route_long_name"),
            text("route_desc"),
            int("route_type"),
            text("route_url"),
            text("route_color"),
            text("route_text_color"),
            int("route_sort_order"),
        ],
    },
    TableSpec {
        kind: EntityKind::Calendar,
        table: "calendar",
        file_name: "calendar.txt",
        store_table: "Calendar",
        required: false,
        natural_key: Some("service_id"),
        unique_key: &["service_id"],
        provides: Some(KeyProvision { kind: ReferenceKind::Service, field: "service_id" }),
        foreign_keys: &[],
        parent_key: None,
        columns: &[
            text("service_id"),
            int("monday"),
            int("tuesday"),
            int("wednesday"),
            int("thursday"),
            int("friday"),
            int("saturday"),
            int("sunday"),
            text("start_date"),
            text("end_date"),
        ],
    },
    TableSpec {
        kind: EntityKind::CalendarDate,
        table: "calendar_dates",
        file_name: "calendar_dates.txt",
        store_table: "CalendarDate",
        required: false,
        natural_key: None,
        unique_key: &["service_id", "date"],
        provides: Some(KeyProvision { kind: ReferenceKind::Service, field: "service_id" }),
        foreign_keys: &[],
        parent_key: None,
        columns: &[text("service_id"), text("date"), int("exception_type")],
    },
    TableSpec {
        kind: EntityKind::Trip,
        table: "trips",
        file_name: "trips.txt",
        store_table: "Trip",
        required: true,
        natural_key: Some("trip_id"),
        unique_key: &["trip_id"],
        provides: Some(KeyProvision { kind: ReferenceKind::Trip, field: "trip_id" }),
        foreign_keys: &[
            ForeignKey { field: "route_id", references: ReferenceKind::Route },
            ForeignKey { field: "service_id", references: ReferenceKind::Service },
        ],
        parent_key: None,
        columns: &[
            text("route_id"),
            text("service_id"),
            text("trip_id"),
            text("trip_headsign"),
            text("trip_short_name"),
            int("direction_id"),
            text("block_id"),
            text("shape_id"),
            int("wheelchair_accessible"),
            int("bikes_allowed"),
        ],
    },
    TableSpec {
        kind: EntityKind::StopTime,
        table: "stop_times",
        file_name: "stop_times.txt",
        store_table: "StopTime",
        required: true,
        natural_key: None,
        unique_key: &["trip_id", "stop_sequence"],
        provides: None,
        foreign_keys: &[
            ForeignKey { field: "trip_id", references: ReferenceKind::Trip },
            ForeignKey { field: "stop_id", references: ReferenceKind::Stop },
        ],
        parent_key: None,
        columns: &[
            text("trip_id"),
            text("arrival_time"),
            text("departure_time"),
            text("stop_id"),
            int("stop_sequence"),
            text("stop_headsign"),
            int("pickup_type"),
            int("drop_off_type"),
            float("shape_dist_traveled"),
            int("timepoint"),
        ],
    },
    TableSpec {
        kind: EntityKind::Shape,
        table: "shapes",
        file_name: "shapes.txt",
        store_table: "Shape",
        required: false,
        natural_key: None,
        unique_key: &["shape_id", "shape_pt_sequence"],
        provides: None,
        foreign_keys: &[],
        parent_key: None,
        columns: &[
            text("shape_id"),
            coord("shape_pt_lat"),
            coord("shape_pt_lon"),
            int("shape_pt_sequence"),
            float("shape_dist_traveled"),
        ],
    },
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("dependency cycle among tables: {0:?}")]
    Cycle(Vec<EntityKind>),
    #[error("{kind} depends on {dependency}, which is not part of the graph")]
    UnknownDependency {
        kind: EntityKind,
        dependency: EntityKind,
    },
}

/// Declared "entity kind → kinds it depends on" graph.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<EntityKind>,
    edges: BTreeMap<EntityKind, BTreeSet<EntityKind>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the graph from the catalog's foreign keys. Self references are
    /// ordering concerns inside a table and do not become edges.
    pub fn from_catalog() -> Self {
        let mut graph = Self::new();
        for spec in &CATALOG {
            let deps = spec
                .foreign_keys
                .iter()
                .flat_map(|fk| fk.references.providers())
                .filter(|provider| *provider != spec.kind);
            graph.add(spec.kind, deps);
        }
        graph
    }

    pub fn add(&mut self, kind: EntityKind, dependencies: impl IntoIterator<Item = EntityKind>) {
        if !self.nodes.contains(&kind) {
            self.nodes.push(kind);
        }
        self.edges.entry(kind).or_default().extend(dependencies);
    }

    pub fn dependencies_of(&self, kind: EntityKind) -> impl Iterator<Item = EntityKind> + '_ {
        self.edges.get(&kind).into_iter().flatten().copied()
    }

    /// Stable topological order: among ready kinds, declaration order wins.
    pub fn processing_order(&self) -> Result<Vec<EntityKind>, PlanError> {
        for (&kind, deps) in &self.edges {
            if let Some(&dependency) = deps.iter().find(|d| !self.nodes.contains(d)) {
                return Err(PlanError::UnknownDependency { kind, dependency });
            }
        }

        let mut placed: Vec<EntityKind> = Vec::with_capacity(self.nodes.len());
        while placed.len() < self.nodes.len() {
            let next = self.nodes.iter().copied().find(|kind| {
                !placed.contains(kind) && self.dependencies_of(*kind).all(|d| placed.contains(&d))
            });
            match next {
                Some(kind) => placed.push(kind),
                None => {
                    let remaining = self
                        .nodes
                        .iter()
                        .copied()
                        .filter(|kind| !placed.contains(kind))
                        .collect();
                    return Err(PlanError::Cycle(remaining));
                }
            }
        }
        Ok(placed)
    }
}

/// Ordered list of tables one run walks through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportPlan {
    order: Vec<EntityKind>,
}

impl ImportPlan {
    pub fn derive() -> Result<Self, PlanError> {
        Ok(Self {
            order: DependencyGraph::from_catalog().processing_order()?,
        })
    }

    /// Uses `order` as given, without checking it against the dependency graph.
    pub fn from_order(order: Vec<EntityKind>) -> Self {
        Self { order }
    }

    pub fn order(&self) -> &[EntityKind] {
        &self.order
    }
}

/// A normalized field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// String form used for key comparisons; empty text counts as absent.
    pub fn as_key(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Text(s) if s.is_empty() => None,
            Value::Text(s) => Some(s.clone()),
            Value::Int(v) => Some(v.to_string()),
            Value::Float(v) => Some(v.to_string()),
        }
    }
}

/// Identifiers attached to every record of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunScope {
    pub project_id: Uuid,
    pub actor_id: Uuid,
}

impl RunScope {
    pub fn new(project_id: Uuid, actor_id: Uuid) -> Self {
        Self { project_id, actor_id }
    }
}

/// One normalized row, scoped to a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedRecord {
    pub project_id: Uuid,
    pub created_by: Option<Uuid>,
    pub fields: BTreeMap<String, Value>,
}

static NULL: Value = Value::Null;

impl FeedRecord {
    pub fn new(scope: &RunScope) -> Self {
        Self {
            project_id: scope.project_id,
            created_by: Some(scope.actor_id),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Missing fields read as `Value::Null`.
    pub fn get(&self, field: &str) -> &Value {
        self.fields.get(field).unwrap_or(&NULL)
    }

    pub fn key(&self, field: &str) -> Option<String> {
        self.get(field).as_key()
    }

    /// Composite key over `fields`, `None` when any component is absent.
    pub fn composite_key(&self, fields: &[&str]) -> Option<Vec<String>> {
        fields.iter().map(|f| self.key(f)).collect()
    }
}
