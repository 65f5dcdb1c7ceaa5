//! YAML rule loading. Loading is fail-fast with aggregate diagnostics: a
//! partial rule set would silently change matching order, so any error
//! (unparseable file, bad regex, duplicate id) aborts the whole load and the
//! report names every offending file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::RegexBuilder;
use serde_yaml::Value;

use crate::error::{FinchError, Result};
use crate::models::normalize_label;
use crate::rules::{LabelOp, Precondition, Rule, Transform};

#[derive(Debug, Clone)]
pub struct LoadIssue {
    pub file: PathBuf,
    pub rule_id: Option<i64>,
    pub message: String,
}

impl std::fmt::Display for LoadIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.rule_id {
            Some(id) => write!(f, "{}: rule {}: {}", self.file.display(), id, self.message),
            None => write!(f, "{}: {}", self.file.display(), self.message),
        }
    }
}

/// Load every rule under `path` (a YAML file or a directory of them),
/// sorted by id ascending. Disabled rules are skipped unless
/// `include_disabled`.
pub fn load_rules(path: &Path, include_disabled: bool) -> Result<Vec<Rule>> {
    let mut files = Vec::new();
    if path.is_file() {
        files.push(path.to_path_buf());
    } else if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let entry_path = entry?.path();
            let ext = entry_path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("");
            if entry_path.is_file() && (ext == "yaml" || ext == "yml") {
                files.push(entry_path);
            }
        }
        files.sort();
        if files.is_empty() {
            return Err(FinchError::Validation(format!(
                "no rule files (*.yaml, *.yml) in {}",
                path.display()
            )));
        }
    } else {
        return Err(FinchError::UserInput(format!(
            "rules path does not exist: {}",
            path.display()
        )));
    }

    let mut rules = Vec::new();
    let mut issues = Vec::new();
    // id → every file that defines it, for the duplicate report.
    let mut defined_in: BTreeMap<i64, Vec<PathBuf>> = BTreeMap::new();

    for file in &files {
        load_file(file, include_disabled, &mut rules, &mut issues, &mut defined_in);
    }

    for (id, holders) in &defined_in {
        if holders.len() > 1 {
            let names: Vec<String> = holders.iter().map(|p| p.display().to_string()).collect();
            issues.push(LoadIssue {
                file: holders[0].clone(),
                rule_id: Some(*id),
                message: format!("duplicate rule id {id} defined in: {}", names.join(", ")),
            });
        }
    }

    if !issues.is_empty() {
        let report: Vec<String> = issues.iter().map(|i| i.to_string()).collect();
        return Err(FinchError::Validation(format!(
            "rule loading failed:\n  {}",
            report.join("\n  ")
        )));
    }

    rules.sort_by_key(|r| r.id);
    Ok(rules)
}

fn load_file(
    file: &Path,
    include_disabled: bool,
    rules: &mut Vec<Rule>,
    issues: &mut Vec<LoadIssue>,
    defined_in: &mut BTreeMap<i64, Vec<PathBuf>>,
) {
    let text = match std::fs::read_to_string(file) {
        Ok(t) => t,
        Err(e) => {
            issues.push(LoadIssue {
                file: file.to_path_buf(),
                rule_id: None,
                message: format!("cannot read file: {e}"),
            });
            return;
        }
    };
    if text.trim().is_empty() {
        issues.push(LoadIssue {
            file: file.to_path_buf(),
            rule_id: None,
            message: "file is empty".to_string(),
        });
        return;
    }

    let doc: Value = match serde_yaml::from_str(&text) {
        Ok(v) => v,
        Err(e) => {
            issues.push(LoadIssue {
                file: file.to_path_buf(),
                rule_id: None,
                message: format!("YAML parse error: {e}"),
            });
            return;
        }
    };

    let Value::Sequence(entries) = doc else {
        issues.push(LoadIssue {
            file: file.to_path_buf(),
            rule_id: None,
            message: "file must contain a list of rules".to_string(),
        });
        return;
    };

    for entry in entries {
        match parse_rule(&entry, file) {
            Ok(rule) => {
                defined_in.entry(rule.id).or_default().push(file.to_path_buf());
                if rule.disabled && !include_disabled {
                    continue;
                }
                rules.push(rule);
            }
            Err(issue) => issues.push(issue),
        }
    }
}

fn issue(file: &Path, rule_id: Option<i64>, message: String) -> LoadIssue {
    LoadIssue {
        file: file.to_path_buf(),
        rule_id,
        message,
    }
}

fn parse_rule(entry: &Value, file: &Path) -> std::result::Result<Rule, LoadIssue> {
    let Value::Mapping(map) = entry else {
        return Err(issue(file, None, "rule must be a mapping".to_string()));
    };

    let id = match map.get("id") {
        Some(Value::Number(n)) if n.as_i64().is_some_and(|v| v > 0) => n.as_i64().unwrap(),
        other => {
            return Err(issue(
                file,
                None,
                format!("rule id must be a positive integer, got: {other:?}"),
            ))
        }
    };

    let disabled = matches!(map.get("disabled"), Some(Value::Bool(true)));

    let Some(if_value) = map.get("if") else {
        return Err(issue(file, Some(id), "missing required key: if".to_string()));
    };
    let Some(then_value) = map.get("then") else {
        return Err(issue(file, Some(id), "missing required key: then".to_string()));
    };

    let precondition = parse_precondition(if_value, file, id)?;
    if precondition.is_empty() {
        return Err(issue(file, Some(id), "'if' has no conditions".to_string()));
    }
    let transforms = parse_transforms(then_value, file, id)?;
    if transforms.is_empty() {
        return Err(issue(file, Some(id), "'then' has no transforms".to_string()));
    }

    Ok(Rule {
        id,
        precondition,
        transforms,
        disabled,
        source: file.to_path_buf(),
    })
}

/// `if`/`then` accept a mapping or a list of single-key mappings.
fn mapping_entries(value: &Value) -> Option<Vec<(String, Value)>> {
    let mut out = Vec::new();
    match value {
        Value::Mapping(map) => {
            for (k, v) in map {
                out.push((k.as_str()?.to_string(), v.clone()));
            }
        }
        Value::Sequence(items) => {
            for item in items {
                let Value::Mapping(map) = item else {
                    return None;
                };
                for (k, v) in map {
                    out.push((k.as_str()?.to_string(), v.clone()));
                }
            }
        }
        _ => return None,
    }
    Some(out)
}

fn compile(pattern: &str) -> std::result::Result<regex::Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

fn parse_precondition(
    value: &Value,
    file: &Path,
    id: i64,
) -> std::result::Result<Precondition, LoadIssue> {
    let Some(entries) = mapping_entries(value) else {
        return Err(issue(
            file,
            Some(id),
            "'if' must be a mapping or a list of mappings".to_string(),
        ));
    };

    let mut precondition = Precondition::default();
    for (key, value) in entries {
        match key.as_str() {
            "merchant" | "account" | "category" => {
                let Value::String(pattern) = &value else {
                    return Err(issue(
                        file,
                        Some(id),
                        format!("condition '{key}' must be a string pattern"),
                    ));
                };
                let regex = compile(pattern).map_err(|e| {
                    issue(file, Some(id), format!("invalid regex in '{key}': {e}"))
                })?;
                match key.as_str() {
                    "merchant" => precondition.merchant = Some(regex),
                    "account" => precondition.account = Some(regex),
                    _ => precondition.category = Some(regex),
                }
            }
            "metadata" => {
                let Value::Mapping(map) = &value else {
                    return Err(issue(
                        file,
                        Some(id),
                        "condition 'metadata' must be a mapping of key → pattern".to_string(),
                    ));
                };
                for (meta_key, meta_value) in map {
                    let (Some(meta_key), Some(pattern)) = (meta_key.as_str(), meta_value.as_str())
                    else {
                        return Err(issue(
                            file,
                            Some(id),
                            "metadata conditions must map string keys to string patterns"
                                .to_string(),
                        ));
                    };
                    let regex = compile(pattern).map_err(|e| {
                        issue(
                            file,
                            Some(id),
                            format!("invalid regex in 'metadata.{meta_key}': {e}"),
                        )
                    })?;
                    precondition.metadata.insert(meta_key.to_string(), regex);
                }
            }
            other => {
                return Err(issue(
                    file,
                    Some(id),
                    format!(
                        "unknown condition key '{other}' (expected merchant, account, category, metadata)"
                    ),
                ));
            }
        }
    }
    Ok(precondition)
}

fn parse_transforms(
    value: &Value,
    file: &Path,
    id: i64,
) -> std::result::Result<Vec<Transform>, LoadIssue> {
    let Some(entries) = mapping_entries(value) else {
        return Err(issue(
            file,
            Some(id),
            "'then' must be a mapping or a list of mappings".to_string(),
        ));
    };

    let mut transforms = Vec::new();
    for (key, value) in entries {
        match key.as_str() {
            "category" => {
                let Value::String(name) = &value else {
                    return Err(issue(file, Some(id), "category must be a string".to_string()));
                };
                transforms.push(Transform::Category(name.clone()));
            }
            "labels" | "tags" => {
                transforms.push(Transform::Labels(parse_label_ops(&value, file, id)?));
            }
            "memo" | "narration" => {
                let Value::String(text) = &value else {
                    return Err(issue(file, Some(id), "memo must be a string".to_string()));
                };
                transforms.push(Transform::Memo(text.clone()));
            }
            "metadata" => {
                let Value::Mapping(map) = &value else {
                    return Err(issue(
                        file,
                        Some(id),
                        "metadata transform must be a mapping".to_string(),
                    ));
                };
                let mut out = std::collections::BTreeMap::new();
                for (meta_key, meta_value) in map {
                    let Some(meta_key) = meta_key.as_str() else {
                        return Err(issue(
                            file,
                            Some(id),
                            "metadata keys must be strings".to_string(),
                        ));
                    };
                    let rendered = match meta_value {
                        Value::String(s) => s.clone(),
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        other => {
                            return Err(issue(
                                file,
                                Some(id),
                                format!(
                                    "metadata value for '{meta_key}' must be scalar, got: {other:?}"
                                ),
                            ));
                        }
                    };
                    out.insert(meta_key.to_string(), rendered);
                }
                transforms.push(Transform::Metadata(out));
            }
            other => {
                return Err(issue(
                    file,
                    Some(id),
                    format!(
                        "unknown transform key '{other}' (expected category, labels, memo, metadata)"
                    ),
                ));
            }
        }
    }
    Ok(transforms)
}

/// Labels accept a scalar (`"+coffee -uncategorized"` or comma-separated)
/// or a list. `+` adds (the default), `-` removes; tokens are normalized.
fn parse_label_ops(
    value: &Value,
    file: &Path,
    id: i64,
) -> std::result::Result<Vec<LabelOp>, LoadIssue> {
    let raw_tokens: Vec<String> = match value {
        Value::String(s) => {
            if s.contains(',') {
                s.split(',').map(|t| t.trim().to_string()).collect()
            } else {
                s.split_whitespace().map(str::to_string).collect()
            }
        }
        Value::Sequence(items) => {
            let mut out = Vec::new();
            for item in items {
                let Some(s) = item.as_str() else {
                    return Err(issue(
                        file,
                        Some(id),
                        "label items must be strings".to_string(),
                    ));
                };
                out.push(s.to_string());
            }
            out
        }
        _ => {
            return Err(issue(
                file,
                Some(id),
                "labels must be a string or a list of strings".to_string(),
            ));
        }
    };

    let mut ops = Vec::new();
    for token in raw_tokens {
        let (remove, body) = match token.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, token.strip_prefix('+').unwrap_or(&token)),
        };
        let Some(normalized) = normalize_label(body) else {
            return Err(issue(
                file,
                Some(id),
                format!("invalid label token '{token}'"),
            ));
        };
        ops.push(if remove {
            LabelOp::Remove(normalized)
        } else {
            LabelOp::Add(normalized)
        });
    }
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_rules(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_mapping_form() {
        let dir = tempfile::tempdir().unwrap();
        write_rules(
            dir.path(),
            "rules.yaml",
            r#"
- id: 17
  if:
    merchant: "^starbucks"
    metadata:
      needs_reimburse: "true"
  then:
    category: "Expenses:Food:Coffee"
    labels: ["+coffee", "-uncategorized"]
    metadata:
      vendor_type: coffee_shop
"#,
        );
        let rules = load_rules(dir.path(), false).unwrap();
        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert_eq!(rule.id, 17);
        assert!(rule.precondition.merchant.is_some());
        assert_eq!(rule.precondition.metadata.len(), 1);
        assert_eq!(rule.transforms.len(), 3);
        assert_eq!(
            rule.transforms[1],
            Transform::Labels(vec![
                LabelOp::Add("coffee".to_string()),
                LabelOp::Remove("uncategorized".to_string()),
            ])
        );
    }

    #[test]
    fn test_load_list_form() {
        let dir = tempfile::tempdir().unwrap();
        write_rules(
            dir.path(),
            "rules.yaml",
            r#"
- id: 1
  if:
    - merchant: "^uber"
  then:
    - category: "Transport"
    - labels: "rideshare"
"#,
        );
        let rules = load_rules(dir.path(), false).unwrap();
        assert_eq!(rules[0].transforms.len(), 2);
    }

    #[test]
    fn test_rules_sorted_by_id_across_files() {
        let dir = tempfile::tempdir().unwrap();
        write_rules(
            dir.path(),
            "b.yaml",
            "- id: 5\n  if: {merchant: a}\n  then: {labels: x}\n",
        );
        write_rules(
            dir.path(),
            "a.yaml",
            "- id: 9\n  if: {merchant: b}\n  then: {labels: y}\n- id: 2\n  if: {merchant: c}\n  then: {labels: z}\n",
        );
        let rules = load_rules(dir.path(), false).unwrap();
        let ids: Vec<i64> = rules.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 5, 9]);
    }

    #[test]
    fn test_duplicate_ids_abort_and_name_all_files() {
        let dir = tempfile::tempdir().unwrap();
        write_rules(
            dir.path(),
            "a.yaml",
            "- id: 3\n  if: {merchant: a}\n  then: {labels: x}\n",
        );
        write_rules(
            dir.path(),
            "b.yaml",
            "- id: 3\n  if: {merchant: b}\n  then: {labels: y}\n",
        );
        let err = load_rules(dir.path(), false).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("duplicate rule id 3"), "{message}");
        assert!(message.contains("a.yaml") && message.contains("b.yaml"), "{message}");
    }

    #[test]
    fn test_bad_regex_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        write_rules(
            dir.path(),
            "rules.yaml",
            "- id: 1\n  if: {merchant: \"([unclosed\"}\n  then: {labels: x}\n",
        );
        let err = load_rules(dir.path(), false).unwrap_err();
        assert!(err.to_string().contains("invalid regex"), "{err}");
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_rules(
            dir.path(),
            "rules.yaml",
            "- id: 1\n  if: {payee: x}\n  then: {labels: y}\n",
        );
        assert!(load_rules(dir.path(), false).is_err());

        write_rules(
            dir.path(),
            "rules.yaml",
            "- id: 1\n  if: {merchant: x}\n  then: {flag: y}\n",
        );
        assert!(load_rules(dir.path(), false).is_err());
    }

    #[test]
    fn test_disabled_rules_skipped_unless_requested() {
        let dir = tempfile::tempdir().unwrap();
        write_rules(
            dir.path(),
            "rules.yaml",
            "- id: 1\n  disabled: true\n  if: {merchant: a}\n  then: {labels: x}\n- id: 2\n  if: {merchant: b}\n  then: {labels: y}\n",
        );
        let active = load_rules(dir.path(), false).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, 2);
        let all = load_rules(dir.path(), true).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_empty_dir_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_rules(dir.path(), false).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_patterns_are_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        write_rules(
            dir.path(),
            "rules.yaml",
            "- id: 1\n  if: {merchant: \"^starbucks\"}\n  then: {labels: coffee}\n",
        );
        let rules = load_rules(dir.path(), false).unwrap();
        let regex = rules[0].precondition.merchant.as_ref().unwrap();
        assert!(regex.is_match("Starbucks #42"));
    }
}
