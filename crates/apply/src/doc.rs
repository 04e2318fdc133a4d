//! YAML parsing with size guards, and edit summaries.

use std::fmt;

use anyhow::{anyhow, Context, Result};
use resync_core::managed::strip_server_fields;
use resync_core::{str_at, Json};
use serde::{Deserialize, Serialize};

use crate::ApplyConfig;

/// Parse one YAML document into JSON, enforcing the configured byte and
/// node budgets and requiring `kind` and `metadata.name`.
pub fn parse_document(text: &str, config: &ApplyConfig) -> Result<Json> {
    if text.len() > config.max_yaml_bytes {
        return Err(anyhow!("YAML payload too large (>{} bytes)", config.max_yaml_bytes));
    }
    let val: serde_yaml::Value = serde_yaml::from_str(text).context("parsing YAML")?;
    let json = serde_json::to_value(val).context("converting YAML to JSON")?;
    if node_budget_exceeded(&json, config.max_yaml_nodes) {
        return Err(anyhow!("YAML document too complex (>{} nodes)", config.max_yaml_nodes));
    }
    if str_at(&json, &["kind"]).is_none() {
        return Err(anyhow!("YAML missing kind"));
    }
    if str_at(&json, &["metadata", "name"]).is_none() {
        return Err(anyhow!("YAML missing metadata.name"));
    }
    Ok(json)
}

pub fn render_document(doc: &Json) -> Result<String> {
    serde_yaml::to_string(doc).context("rendering YAML")
}

/// Whether `v` has at least `max` nodes. Stops counting at `max`.
pub fn node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Counts of field-level additions, updates and removals between two
/// documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn between(target: &Json, base: &Json) -> Self {
        fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
            match (a, b) {
                (Json::Object(ao), Json::Object(bo)) => {
                    for (k, av) in ao {
                        match bo.get(k) {
                            Some(bv) if av == bv => {}
                            Some(bv) => walk(av, bv, s),
                            None => s.adds += 1,
                        }
                    }
                    s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
                }
                (Json::Array(aa), Json::Array(bb)) => {
                    s.updates += aa.iter().zip(bb).filter(|(x, y)| x != y).count();
                    s.adds += aa.len().saturating_sub(bb.len());
                    s.removes += bb.len().saturating_sub(aa.len());
                }
                (av, bv) => {
                    if av != bv {
                        s.updates += 1;
                    }
                }
            }
        }
        let mut s = DiffSummary::default();
        walk(target, base, &mut s);
        s
    }

    /// Like [`between`](Self::between), ignoring server-managed fields on both sides.
    pub fn of_edit(target: &Json, base: &Json) -> Self {
        let (mut t, mut b) = (target.clone(), base.clone());
        strip_server_fields(&mut t);
        strip_server_fields(&mut b);
        Self::between(&t, &b)
    }

    pub fn is_empty(&self) -> bool {
        self.adds == 0 && self.updates == 0 && self.removes == 0
    }
}

impl fmt::Display for DiffSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{} ~{} -{}", self.adds, self.updates, self.removes)
    }
}
