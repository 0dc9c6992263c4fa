//! Editable rule list with persistence and engine sync
//!
//! [`RuleStore`] owns the user-facing, ordered list of rules (including
//! disabled ones). Every successful mutation republishes the list to the
//! attached [`RuleSet`] with the matching [`ChangeKind`]. Persistence is an
//! explicit `save`/`load`; `import_from` is all-or-nothing with respect to
//! I/O and JSON errors.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::RuleError;
use crate::events::ChangeKind;
use crate::rules::engine::{DroppedRecord, RuleSet};
use crate::rules::source::parse_record_array;
use crate::rules::types::{Rule, RuleRecord};

/// Editable rule list bound to a matching engine
pub struct RuleStore {
    rules: RwLock<Vec<Rule>>,
    engine: Arc<RuleSet>,
    path: Option<PathBuf>,
}

impl RuleStore {
    /// Create an empty store. `path` is where `save`/`load` persist.
    pub fn new(engine: Arc<RuleSet>, path: Option<PathBuf>) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            engine,
            path,
        }
    }

    /// Persistence path, if any
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The engine this store publishes to
    #[must_use]
    pub fn engine(&self) -> &Arc<RuleSet> {
        &self.engine
    }

    /// All rules in list order
    #[must_use]
    pub fn rules(&self) -> Vec<Rule> {
        self.rules.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    /// Append a rule
    ///
    /// # Errors
    ///
    /// `RuleError::DuplicateId` if the id is already present.
    pub fn add(&self, rule: Rule) -> Result<(), RuleError> {
        self.mutate(ChangeKind::Add, |rules| {
            ensure_unique(rules, rule.id())?;
            rules.push(rule);
            Ok(())
        })
    }

    /// Insert a rule at `index` (`index == len` appends)
    ///
    /// # Errors
    ///
    /// `DuplicateId` or `IndexOutOfRange`.
    pub fn insert(&self, rule: Rule, index: usize) -> Result<(), RuleError> {
        self.mutate(ChangeKind::Add, |rules| {
            ensure_unique(rules, rule.id())?;
            if index > rules.len() {
                return Err(RuleError::IndexOutOfRange {
                    index,
                    len: rules.len(),
                });
            }
            rules.insert(index, rule);
            Ok(())
        })
    }

    /// Remove the rule with `id`
    ///
    /// # Errors
    ///
    /// `RuleError::NotFound` if no rule has that id.
    pub fn remove(&self, id: &str) -> Result<Rule, RuleError> {
        self.mutate(ChangeKind::Remove, |rules| {
            let index = position(rules, id)?;
            Ok(rules.remove(index))
        })
    }

    /// Remove the rule at `index`
    ///
    /// # Errors
    ///
    /// `RuleError::IndexOutOfRange`.
    pub fn remove_at(&self, index: usize) -> Result<Rule, RuleError> {
        self.mutate(ChangeKind::Remove, |rules| {
            check_index(rules, index)?;
            Ok(rules.remove(index))
        })
    }

    /// Replace the rule that has the same id, keeping its position
    ///
    /// # Errors
    ///
    /// `RuleError::NotFound` if no rule has that id.
    pub fn update(&self, rule: Rule) -> Result<(), RuleError> {
        self.mutate(ChangeKind::Update, |rules| {
            let index = position(rules, rule.id())?;
            rules[index] = rule;
            Ok(())
        })
    }

    /// Move a rule from one position to another
    ///
    /// # Errors
    ///
    /// `RuleError::IndexOutOfRange` for either index.
    pub fn move_rule(&self, from: usize, to: usize) -> Result<(), RuleError> {
        self.mutate(ChangeKind::Move, |rules| {
            check_index(rules, from)?;
            check_index(rules, to)?;
            let rule = rules.remove(from);
            rules.insert(to, rule);
            Ok(())
        })
    }

    /// Replace the whole list
    ///
    /// # Errors
    ///
    /// `RuleError::DuplicateId` if two rules share an id; the current list
    /// is kept.
    pub fn set_rules(&self, new_rules: Vec<Rule>) -> Result<(), RuleError> {
        let mut seen = std::collections::HashSet::with_capacity(new_rules.len());
        for rule in &new_rules {
            if !seen.insert(rule.id()) {
                return Err(RuleError::DuplicateId(rule.id().to_string()));
            }
        }
        self.mutate(ChangeKind::Reload, |rules| {
            *rules = new_rules;
            Ok(())
        })
    }

    /// Replace the list with raw interchange records, dropping the invalid
    /// ones and later duplicates.
    pub fn replace_with_values(&self, values: Vec<Value>) -> Vec<DroppedRecord> {
        let (rules, dropped) = decode_rules(values);
        let count = rules.len();
        let _ = self.mutate(ChangeKind::Reload, |current| {
            *current = rules;
            Ok(())
        });
        info!(rules = count, skipped = dropped.len(), "Replaced rules from records");
        dropped
    }

    /// Remove every rule
    pub fn remove_all(&self) {
        // Clearing cannot fail.
        let _ = self.mutate(ChangeKind::Reload, |rules| {
            rules.clear();
            Ok(())
        });
    }

    /// Look up a rule by id
    #[must_use]
    pub fn rule_with_id(&self, id: &str) -> Option<Rule> {
        self.rules.read().iter().find(|r| r.id() == id).cloned()
    }

    /// Enabled rules in list order
    #[must_use]
    pub fn enabled_rules(&self) -> Vec<Rule> {
        self.rules.read().iter().filter(|r| r.enabled()).cloned().collect()
    }

    /// Rules targeting `interface_name`
    #[must_use]
    pub fn rules_for_interface(&self, interface_name: &str) -> Vec<Rule> {
        self.rules
            .read()
            .iter()
            .filter(|r| r.interface_name() == interface_name)
            .cloned()
            .collect()
    }

    /// Republish the current list to the engine
    pub fn sync(&self) -> u64 {
        let rules = self.rules.read().clone();
        self.engine.publish(rules, ChangeKind::Reload)
    }

    /// Write the list to the store path
    ///
    /// # Errors
    ///
    /// `RuleError::Storage` when no path is configured or the write fails.
    pub fn save(&self) -> Result<(), RuleError> {
        let path = self.require_path()?;
        self.export_to(path)
    }

    /// Replace the list with the store file's contents.
    ///
    /// A missing file is treated as an empty list.
    ///
    /// # Errors
    ///
    /// `Storage` or `Parse` errors leave the current list unchanged.
    pub fn load(&self) -> Result<Vec<DroppedRecord>, RuleError> {
        let path = self.require_path()?.to_path_buf();
        if !path.exists() {
            info!(path = %path.display(), "Rule store file does not exist yet");
            self.set_rules(Vec::new())?;
            return Ok(Vec::new());
        }
        self.import_from(&path)
    }

    /// Write all rules as a JSON array of records.
    ///
    /// The file is written to a sibling temp file and renamed into place.
    ///
    /// # Errors
    ///
    /// `RuleError::Storage` on any I/O failure.
    pub fn export_to(&self, path: &Path) -> Result<(), RuleError> {
        let records: Vec<RuleRecord> = self.rules.read().iter().map(Rule::to_record).collect();
        let json = serde_json::to_string_pretty(&records)
            .map_err(|e| RuleError::Parse(e.to_string()))?;

        let storage = |e: std::io::Error| RuleError::storage(path.display().to_string(), e.to_string());
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(storage)?;
            file.write_all(json.as_bytes()).map_err(storage)?;
            file.sync_all().map_err(storage)?;
        }
        fs::rename(&tmp, path).map_err(storage)?;

        debug!(path = %path.display(), rules = records.len(), "Exported rules");
        Ok(())
    }

    /// Replace the list with the rules in `path`.
    ///
    /// The file is read and fully validated before anything changes.
    /// Invalid records inside a well-formed file are dropped and returned.
    ///
    /// # Errors
    ///
    /// `Storage` (unreadable) or `Parse` (not a JSON array); in both cases
    /// the current rules are untouched.
    pub fn import_from(&self, path: &Path) -> Result<Vec<DroppedRecord>, RuleError> {
        let content = fs::read_to_string(path)
            .map_err(|e| RuleError::storage(path.display().to_string(), e.to_string()))?;
        let values = parse_record_array(&content)?;
        let (rules, dropped) = decode_rules(values);

        for d in &dropped {
            warn!(
                path = %path.display(),
                index = d.index,
                rule_id = d.rule_id.as_deref().unwrap_or("-"),
                reason = %d.reason,
                "Skipping invalid rule during import"
            );
        }

        let count = rules.len();
        self.mutate(ChangeKind::Reload, |current| {
            *current = rules;
            Ok(())
        })?;
        info!(path = %path.display(), rules = count, skipped = dropped.len(), "Imported rules");
        Ok(dropped)
    }

    fn require_path(&self) -> Result<&Path, RuleError> {
        self.path
            .as_deref()
            .ok_or_else(|| RuleError::storage("<none>", "no rule store path configured"))
    }

    /// Apply `f` under the write lock; on success publish to the engine
    fn mutate<T>(
        &self,
        kind: ChangeKind,
        f: impl FnOnce(&mut Vec<Rule>) -> Result<T, RuleError>,
    ) -> Result<T, RuleError> {
        let mut rules = self.rules.write();
        let result = f(&mut *rules)?;
        let snapshot = rules.clone();
        // Publishing under the lock keeps engine order equal to edit order.
        self.engine.publish(snapshot, kind);
        drop(rules);
        Ok(result)
    }
}

impl std::fmt::Debug for RuleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleStore")
            .field("rules", &self.len())
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Decode records independently, dropping invalid ones and later duplicates
fn decode_rules(values: Vec<Value>) -> (Vec<Rule>, Vec<DroppedRecord>) {
    let mut rules: Vec<Rule> = Vec::with_capacity(values.len());
    let mut dropped = Vec::new();

    for (index, value) in values.into_iter().enumerate() {
        let rule_id = value
            .get("ruleId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let decoded = serde_json::from_value::<RuleRecord>(value)
            .map_err(|e| e.to_string())
            .and_then(|record| Rule::try_from(record).map_err(|e| e.to_string()));

        match decoded {
            Ok(rule) if rules.iter().any(|r| r.id() == rule.id()) => dropped.push(DroppedRecord {
                index,
                rule_id,
                reason: RuleError::DuplicateId(rule.id().to_string()).to_string(),
            }),
            Ok(rule) => rules.push(rule),
            Err(reason) => dropped.push(DroppedRecord {
                index,
                rule_id,
                reason,
            }),
        }
    }
    (rules, dropped)
}

fn ensure_unique(rules: &[Rule], id: &str) -> Result<(), RuleError> {
    if rules.iter().any(|r| r.id() == id) {
        Err(RuleError::DuplicateId(id.to_string()))
    } else {
        Ok(())
    }
}

fn position(rules: &[Rule], id: &str) -> Result<usize, RuleError> {
    rules
        .iter()
        .position(|r| r.id() == id)
        .ok_or_else(|| RuleError::NotFound(id.to_string()))
}

fn check_index(rules: &[Rule], index: usize) -> Result<(), RuleError> {
    if index < rules.len() {
        Ok(())
    } else {
        Err(RuleError::IndexOutOfRange {
            index,
            len: rules.len(),
        })
    }
}
