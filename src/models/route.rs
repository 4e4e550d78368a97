use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Logic name → actual name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RouteMapper {
    pub logic_name: String,
    pub actual_name: String,
}

impl RouteMapper {
    pub fn new(logic_name: impl Into<String>, actual_name: impl Into<String>) -> Self {
        Self {
            logic_name: logic_name.into(),
            actual_name: actual_name.into(),
        }
    }
}

/// One execution target: a data source plus the physical table for each logic table
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RouteUnit {
    pub data_source: RouteMapper,
    pub table_mappers: Vec<RouteMapper>,
}

impl RouteUnit {
    pub fn new(data_source: impl Into<String>, table_mappers: Vec<RouteMapper>) -> Self {
        let data_source = data_source.into();
        Self {
            data_source: RouteMapper::new(data_source.clone(), data_source),
            table_mappers,
        }
    }

    pub fn data_source_name(&self) -> &str {
        &self.data_source.actual_name
    }

    pub fn actual_table(&self, logic_table: &str) -> Option<&str> {
        self.table_mappers
            .iter()
            .find(|m| m.logic_name == logic_table)
            .map(|m| m.actual_name.as_str())
    }
}

/// Route units selected for one statement, sorted and duplicate-free
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteContext {
    /// Unit → INSERT rows it owns
    units: BTreeMap<RouteUnit, BTreeSet<usize>>,
    /// Some sharded table was routed without a usable condition
    pub full_scan: bool,
}

impl RouteContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, unit: RouteUnit) {
        self.units.entry(unit).or_default();
    }

    pub fn add_insert_row(&mut self, unit: RouteUnit, row: usize) {
        self.units.entry(unit).or_default().insert(row);
    }

    pub fn units(&self) -> impl Iterator<Item = &RouteUnit> {
        self.units.keys()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn is_single_unit(&self) -> bool {
        self.units.len() == 1
    }

    /// INSERT rows owned by `unit`, ascending
    pub fn insert_rows(&self, unit: &RouteUnit) -> Vec<usize> {
        self.units
            .get(unit)
            .map(|rows| rows.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn data_source_names(&self) -> BTreeSet<&str> {
        self.units.keys().map(|u| u.data_source_name()).collect()
    }

    /// Number of units per data source
    pub fn units_per_data_source(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for unit in self.units.keys() {
            *counts.entry(unit.data_source_name()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_units_are_sorted_and_deduplicated() {
        let mut ctx = RouteContext::new();
        ctx.add(RouteUnit::new("ds_1", vec![RouteMapper::new("orders", "orders_1")]));
        ctx.add(RouteUnit::new("ds_0", vec![RouteMapper::new("orders", "orders_2")]));
        ctx.add(RouteUnit::new("ds_1", vec![RouteMapper::new("orders", "orders_1")]));
        let names: Vec<&str> = ctx.units().map(|u| u.data_source_name()).collect();
        assert_eq!(names, vec!["ds_0", "ds_1"]);
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn test_insert_rows_merge_on_same_unit() {
        let unit = RouteUnit::new("ds_0", vec![RouteMapper::new("orders", "orders_0")]);
        let mut ctx = RouteContext::new();
        ctx.add_insert_row(unit.clone(), 2);
        ctx.add_insert_row(unit.clone(), 0);
        assert_eq!(ctx.insert_rows(&unit), vec![0, 2]);
        assert_eq!(unit.actual_table("orders"), Some("orders_0"));
    }
}
