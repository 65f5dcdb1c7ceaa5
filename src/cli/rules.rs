use std::path::{Path, PathBuf};

use colored::Colorize;
use comfy_table::{Cell, Table};
use serde_yaml::{Mapping, Value};

use crate::changelog::Changelog;
use crate::cli::{resolve_archive, resolve_rules_path, CommonOpts, WindowOpts};
use crate::config::Config;
use crate::error::{FinchError, Result};
use crate::rules::matcher;
use crate::rules::transformer::run_apply;
use crate::rules::{loader, ApplyStatus, Rule, Transform};
use crate::sync::CancelFlag;

// ---------------------------------------------------------------------------
// apply
// ---------------------------------------------------------------------------

pub fn apply(
    common: &CommonOpts,
    window: &WindowOpts,
    id: Option<i64>,
    rules_path: &Option<PathBuf>,
    config: &Config,
    cancel: &CancelFlag,
) -> Result<()> {
    let archive = resolve_archive(&common.destination, config)?;
    let window = window.resolve()?;
    let rules = loader::load_rules(&resolve_rules_path(rules_path, &archive), false)?;
    if cancel.is_cancelled() {
        return Err(FinchError::Interrupted);
    }

    let _lock = archive.lock()?;
    let mut data = archive.read()?;
    let outcome = run_apply(&rules, &data, &window, id);

    for application in &outcome.applications {
        match application.status {
            ApplyStatus::Invalid => eprintln!(
                "{} rule {} on {}: {}",
                "invalid:".red(),
                application.rule_id,
                application.txn_id,
                application.message.as_deref().unwrap_or("target unresolved")
            ),
            ApplyStatus::Conflict => eprintln!(
                "{} rule {} on {}: {}",
                "warning:".yellow(),
                application.rule_id,
                application.txn_id,
                application.message.as_deref().unwrap_or("overwrote value")
            ),
            _ => {}
        }
        if common.verbose && application.status == ApplyStatus::Applied {
            println!(
                "APPLY {} RULE {} {} {} → {}",
                application.txn_id,
                application.rule_id,
                application.field,
                application.old,
                application.new
            );
        }
    }

    if common.dry_run {
        if !common.quiet {
            println!(
                "{} transaction(s) matched; {} would change (dry run)",
                outcome.matched,
                outcome.changed.len()
            );
        }
        return Ok(());
    }

    archive.upsert_transactions(&mut data, &outcome.changed)?;
    Changelog::new(archive.changelog_path()).append_records(&outcome.log_entries)?;

    if !common.quiet {
        println!(
            "{} {} transaction(s); {} matched, {} unmatched",
            "Updated".green(),
            outcome.changed.len(),
            outcome.matched,
            outcome.unmatched
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// list / lookup
// ---------------------------------------------------------------------------

fn describe_conditions(rule: &Rule) -> String {
    let mut parts = Vec::new();
    if let Some(regex) = &rule.precondition.merchant {
        parts.push(format!("merchant~{}", regex.as_str()));
    }
    if let Some(regex) = &rule.precondition.account {
        parts.push(format!("account~{}", regex.as_str()));
    }
    if let Some(regex) = &rule.precondition.category {
        parts.push(format!("category~{}", regex.as_str()));
    }
    for (key, regex) in &rule.precondition.metadata {
        parts.push(format!("{key}~{}", regex.as_str()));
    }
    parts.join(" & ")
}

fn describe_transforms(rule: &Rule) -> String {
    rule.transforms
        .iter()
        .map(|t| match t {
            Transform::Category(name) => format!("category={name}"),
            Transform::Labels(ops) => {
                let rendered: Vec<String> = ops
                    .iter()
                    .map(|op| match op {
                        crate::rules::LabelOp::Add(l) => format!("+{l}"),
                        crate::rules::LabelOp::Remove(l) => format!("-{l}"),
                    })
                    .collect();
                format!("labels={}", rendered.join(","))
            }
            Transform::Memo(text) => format!("memo={text}"),
            Transform::Metadata(map) => {
                let rendered: Vec<String> =
                    map.iter().map(|(k, v)| format!("{k}:{v}")).collect();
                format!("metadata={{{}}}", rendered.join(","))
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

pub fn list(
    rules_path: &Option<PathBuf>,
    include_disabled: bool,
    destination: &Option<PathBuf>,
    config: &Config,
) -> Result<()> {
    let archive = resolve_archive(destination, config)?;
    let rules = loader::load_rules(&resolve_rules_path(rules_path, &archive), include_disabled)?;

    let mut table = Table::new();
    table.set_header(vec!["ID", "If", "Then", "File", "State"]);
    for rule in &rules {
        table.add_row(vec![
            Cell::new(rule.id),
            Cell::new(describe_conditions(rule)),
            Cell::new(describe_transforms(rule)),
            Cell::new(
                rule.source
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
            ),
            Cell::new(if rule.disabled { "disabled" } else { "active" }),
        ]);
    }
    println!("Rules\n{table}");
    Ok(())
}

pub fn lookup(
    txn_id: i64,
    rules_path: &Option<PathBuf>,
    destination: &Option<PathBuf>,
    config: &Config,
) -> Result<()> {
    let archive = resolve_archive(destination, config)?;
    let rules = loader::load_rules(&resolve_rules_path(rules_path, &archive), false)?;
    let data = archive.read()?;
    let Some(txn) = data.transaction(txn_id) else {
        return Err(FinchError::UserInput(format!(
            "transaction {txn_id} not found in the archive"
        )));
    };

    match matcher::find_matching_rule(&rules, txn, &data) {
        Some((rule, _)) => {
            println!(
                "Rule {} ({}) matches transaction {txn_id}",
                rule.id,
                rule.source.display()
            );
            println!("  if:   {}", describe_conditions(rule));
            println!("  then: {}", describe_transforms(rule));
        }
        None => {
            let fields = matcher::extract_fields(txn, &data);
            println!("No rule matches transaction {txn_id}");
            println!("  merchant: {}", fields.merchant);
            println!("  account:  {}", fields.account);
            println!("  category: {}", fields.category);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// add / rm
// ---------------------------------------------------------------------------

const LOCAL_RULES_FILE: &str = "local.yaml";

fn rules_file_for_append(rules_path: &Path) -> PathBuf {
    if rules_path.extension().is_some() {
        rules_path.to_path_buf()
    } else {
        rules_path.join(LOCAL_RULES_FILE)
    }
}

#[allow(clippy::too_many_arguments)]
pub fn add(
    id: Option<i64>,
    merchant: Option<&str>,
    account: Option<&str>,
    category: Option<&str>,
    set_category: Option<&str>,
    labels: &[String],
    memo: Option<&str>,
    rules_path: &Option<PathBuf>,
    destination: &Option<PathBuf>,
    config: &Config,
) -> Result<()> {
    if merchant.is_none() && account.is_none() && category.is_none() {
        return Err(FinchError::UserInput(
            "rule add needs at least one condition (--merchant, --account, --category)"
                .to_string(),
        ));
    }
    if set_category.is_none() && labels.is_empty() && memo.is_none() {
        return Err(FinchError::UserInput(
            "rule add needs at least one action (--set-category, --label, --memo)".to_string(),
        ));
    }
    for pattern in [merchant, account, category].into_iter().flatten() {
        regex::RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| FinchError::Validation(format!("invalid regex '{pattern}': {e}")))?;
    }

    let archive = resolve_archive(destination, config)?;
    let rules_root = resolve_rules_path(rules_path, &archive);

    // Existing ids, if any rules load; a brand new rules dir is fine.
    let existing = match loader::load_rules(&rules_root, true) {
        Ok(rules) => rules,
        Err(FinchError::Validation(_)) | Err(FinchError::UserInput(_)) => Vec::new(),
        Err(e) => return Err(e),
    };
    let rule_id = match id {
        Some(explicit) => {
            if existing.iter().any(|r| r.id == explicit) {
                return Err(FinchError::Validation(format!(
                    "rule id {explicit} already exists"
                )));
            }
            explicit
        }
        None => existing.iter().map(|r| r.id).max().unwrap_or(0) + 1,
    };

    let mut if_map = Mapping::new();
    if let Some(pattern) = merchant {
        if_map.insert("merchant".into(), pattern.into());
    }
    if let Some(pattern) = account {
        if_map.insert("account".into(), pattern.into());
    }
    if let Some(pattern) = category {
        if_map.insert("category".into(), pattern.into());
    }

    let mut then_map = Mapping::new();
    if let Some(name) = set_category {
        then_map.insert("category".into(), name.into());
    }
    if !labels.is_empty() {
        let items: Vec<Value> = labels.iter().map(|l| Value::from(l.as_str())).collect();
        then_map.insert("labels".into(), Value::Sequence(items));
    }
    if let Some(text) = memo {
        then_map.insert("memo".into(), text.into());
    }

    let mut rule_map = Mapping::new();
    rule_map.insert("id".into(), rule_id.into());
    rule_map.insert("if".into(), Value::Mapping(if_map));
    rule_map.insert("then".into(), Value::Mapping(then_map));
    let fragment = serde_yaml::to_string(&vec![Value::Mapping(rule_map)])
        .map_err(|e| FinchError::Validation(format!("cannot render rule: {e}")))?;

    let file = rules_file_for_append(&rules_root);
    if let Some(parent) = file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut content = std::fs::read_to_string(&file).unwrap_or_default();
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(&fragment);
    std::fs::write(&file, content)?;

    // Reload to prove the new set is valid as a whole.
    loader::load_rules(&rules_root, true)?;
    println!("{} rule {rule_id} to {}", "Added".green(), file.display());
    Ok(())
}

pub fn rm(
    rule_id: i64,
    rules_path: &Option<PathBuf>,
    destination: &Option<PathBuf>,
    config: &Config,
) -> Result<()> {
    let archive = resolve_archive(destination, config)?;
    let rules_root = resolve_rules_path(rules_path, &archive);
    let rules = loader::load_rules(&rules_root, true)?;
    let Some(rule) = rules.iter().find(|r| r.id == rule_id) else {
        return Err(FinchError::UserInput(format!("no rule with id {rule_id}")));
    };

    let text = std::fs::read_to_string(&rule.source)?;
    let doc: Vec<Value> = serde_yaml::from_str(&text)
        .map_err(|e| FinchError::Validation(format!("{}: {e}", rule.source.display())))?;
    let kept: Vec<Value> = doc
        .into_iter()
        .filter(|entry| {
            entry
                .get("id")
                .and_then(Value::as_i64)
                .map_or(true, |id| id != rule_id)
        })
        .collect();

    if kept.is_empty() {
        std::fs::remove_file(&rule.source)?;
        println!(
            "Removed rule {rule_id}; deleted now-empty {}",
            rule.source.display()
        );
    } else {
        let rendered = serde_yaml::to_string(&kept)
            .map_err(|e| FinchError::Validation(format!("cannot render rules: {e}")))?;
        std::fs::write(&rule.source, rendered)?;
        println!("Removed rule {rule_id} from {}", rule.source.display());
    }
    Ok(())
}
