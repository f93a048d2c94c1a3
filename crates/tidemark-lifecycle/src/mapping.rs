//! Declared schema versus live index mapping.

use std::collections::BTreeSet;
use std::fmt;

use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::context::IndexLifecycle;
use crate::error::LifecycleResult;

/// Field keys compared between declaration and live mapping.
const COMPARED_KEYS: [&str; 5] = ["type", "include_in_all", "doc_values", "format", "analyzer"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingDrift {
    MissingLive,
    MissingField(String),
    AliasCount { declared: usize, live: usize },
    FieldConfig { field: String, key: &'static str },
    ObjectType(String),
    AliasPath(String),
}

impl fmt::Display for MappingDrift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingDrift::MissingLive => f.write_str("live mapping missing"),
            MappingDrift::MissingField(field) => write!(f, "field `{field}` missing from live mapping"),
            MappingDrift::AliasCount { declared, live } => {
                write!(f, "alias field count {declared} declared, {live} live")
            }
            MappingDrift::FieldConfig { field, key } => write!(f, "field `{field}` differs on `{key}`"),
            MappingDrift::ObjectType(field) => write!(f, "field `{field}` is an object on the live side"),
            MappingDrift::AliasPath(field) => write!(f, "alias field `{field}` points elsewhere"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingVerdict {
    Same,
    Drift(MappingDrift),
}

impl MappingVerdict {
    pub fn is_same(&self) -> bool {
        matches!(self, MappingVerdict::Same)
    }
}

fn is_alias(config: &Value) -> bool {
    config.get("type").and_then(Value::as_str) == Some("alias")
}

/// `properties` of the live `mappings` object, typed or untyped.
fn live_properties<'a>(mappings: &'a Value, doc_type: &str) -> Option<&'a Map<String, Value>> {
    mappings
        .get("properties")
        .or_else(|| mappings.get(doc_type).and_then(|m| m.get("properties")))
        .and_then(Value::as_object)
}

/// Compare declared field properties with a live `mappings` object.
pub fn compare_mapping(
    declared: &Map<String, Value>,
    live_mappings: Option<&Value>,
    doc_type: &str,
) -> MappingVerdict {
    let Some(live) = live_mappings.and_then(|m| live_properties(m, doc_type)) else {
        return MappingVerdict::Drift(MappingDrift::MissingLive);
    };

    let mut live_fields: BTreeSet<&str> = live.keys().map(String::as_str).collect();
    let mut live_alias_count = 0;
    for config in live.values().filter(|c| is_alias(c)) {
        live_alias_count += 1;
        if let Some(path) = config.get("path").and_then(Value::as_str) {
            live_fields.insert(path);
        }
    }

    if let Some(missing) = declared
        .keys()
        .find(|f| !f.contains('.') && !live_fields.contains(f.as_str()))
    {
        return MappingVerdict::Drift(MappingDrift::MissingField(missing.clone()));
    }

    let declared_alias_count = declared.values().filter(|c| is_alias(c)).count();
    if declared_alias_count != live_alias_count {
        return MappingVerdict::Drift(MappingDrift::AliasCount {
            declared: declared_alias_count,
            live: live_alias_count,
        });
    }

    for (field, want) in declared {
        if field.contains('.') {
            continue;
        }
        // Present only as an alias path.
        let Some(have) = live.get(field) else {
            continue;
        };

        if is_alias(want) {
            if want.get("path") != have.get("path") {
                return MappingVerdict::Drift(MappingDrift::AliasPath(field.clone()));
            }
            continue;
        }

        for key in COMPARED_KEYS {
            if key == "type" && have.get("type").is_none() {
                let declared_type = want.get("type").and_then(Value::as_str);
                if have.get("properties").is_some() && declared_type != Some("object") {
                    return MappingVerdict::Drift(MappingDrift::ObjectType(field.clone()));
                }
                continue;
            }
            if want.get(key) != have.get(key) {
                return MappingVerdict::Drift(MappingDrift::FieldConfig {
                    field: field.clone(),
                    key,
                });
            }
        }
    }

    MappingVerdict::Same
}

impl IndexLifecycle {
    /// Compare the table's declared properties with the mapping of `index`.
    pub async fn is_mapping_same(&self, index: &str) -> LifecycleResult<MappingVerdict> {
        let live = self.client.get_mapping(index).await?;
        let verdict = compare_mapping(
            &self.table.properties,
            live.as_ref(),
            &self.table.table_id,
        );
        if let MappingVerdict::Drift(drift) = &verdict {
            debug!(table_id = %self.table.table_id, %index, %drift, "mapping drift");
        }
        Ok(verdict)
    }

    /// Push declared alias fields to every index still receiving queries.
    ///
    /// Returns the indices updated. Per-index failures are logged.
    pub async fn sync_field_aliases(&self) -> LifecycleResult<Vec<String>> {
        let alias_props = self.table.alias_properties();
        if alias_props.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({ "properties": Value::Object(alias_props) });

        let mut updated = Vec::new();
        for (index, group) in self.retention_groups().await? {
            if !group.is_live() {
                continue;
            }
            match self.client.count(&index).await {
                Ok(0) => continue,
                Ok(_) => {}
                Err(e) => {
                    warn!(table_id = %self.table.table_id, %index, error = %e, "count failed, alias sync skipped");
                    continue;
                }
            }
            match self.client.put_mapping(std::slice::from_ref(&index), &body).await {
                Ok(()) => updated.push(index),
                Err(e) => {
                    warn!(table_id = %self.table.table_id, %index, error = %e, "field alias sync failed");
                }
            }
        }
        if !updated.is_empty() {
            info!(table_id = %self.table.table_id, count = updated.len(), "field aliases synced");
        }
        Ok(updated)
    }
}
