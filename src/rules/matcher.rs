//! Precondition matching. Rules are tried in ascending id order and the
//! first match wins.

use std::collections::BTreeMap;

use regex::Regex;

use crate::models::Transaction;
use crate::rules::Rule;
use crate::store::LedgerData;

/// Captured groups per predicate, for `{field.N}` substitution in
/// transform text.
pub type CaptureMap = BTreeMap<String, Vec<String>>;

/// The matchable view of a transaction.
#[derive(Debug, Clone, Default)]
pub struct MatchFields {
    pub merchant: String,
    pub account: String,
    pub category: String,
    pub metadata: BTreeMap<String, String>,
}

/// Extract the fields preconditions run against. Account names are scoped
/// to asset/liability accounts (all archive accounts qualify); category
/// titles to income/expense categories, which excludes the transfer bucket.
pub fn extract_fields(txn: &Transaction, data: &LedgerData) -> MatchFields {
    let mut fields = MatchFields {
        merchant: txn.payee.clone(),
        ..Default::default()
    };

    if let Some(account) = data.account(txn.account_id) {
        fields.account = account.display_name.clone();
    }
    if let Some(category) = txn.category_id.and_then(|id| data.category(id)) {
        if !category.title.eq_ignore_ascii_case("transfer") {
            fields.category = category.title.clone();
        }
    }

    for (key, value) in &txn.metadata {
        fields.metadata.insert(key.clone(), value.clone());
    }
    fields
        .metadata
        .insert("needs_review".to_string(), txn.needs_review.to_string());
    if !txn.labels.is_empty() {
        let joined: Vec<&str> = txn.labels.iter().map(String::as_str).collect();
        fields.metadata.insert("labels".to_string(), joined.join(" "));
    }

    fields
}

fn capture_groups(regex: &Regex, haystack: &str) -> Option<Vec<String>> {
    let captures = regex.captures(haystack)?;
    Some(
        (1..captures.len())
            .map(|i| captures.get(i).map(|m| m.as_str().to_string()).unwrap_or_default())
            .collect(),
    )
}

/// Test one rule. Every present predicate must match a non-empty field.
pub fn match_rule(rule: &Rule, fields: &MatchFields) -> Option<CaptureMap> {
    let mut captures = CaptureMap::new();

    let mut check = |name: &str, pattern: &Option<Regex>, value: &str| -> bool {
        let Some(regex) = pattern else {
            return true; // missing condition matches anything
        };
        if value.is_empty() {
            return false;
        }
        match capture_groups(regex, value) {
            Some(groups) => {
                captures.insert(name.to_string(), groups);
                true
            }
            None => false,
        }
    };

    if !check("merchant", &rule.precondition.merchant, &fields.merchant) {
        return None;
    }
    if !check("account", &rule.precondition.account, &fields.account) {
        return None;
    }
    if !check("category", &rule.precondition.category, &fields.category) {
        return None;
    }

    for (key, regex) in &rule.precondition.metadata {
        let Some(value) = fields.metadata.get(key).filter(|v| !v.is_empty()) else {
            return None;
        };
        match capture_groups(regex, value) {
            Some(groups) => {
                captures.insert(format!("metadata.{key}"), groups);
            }
            None => return None,
        }
    }

    Some(captures)
}

/// First-match-wins over rules already sorted by id.
pub fn find_matching_rule<'r>(
    rules: &'r [Rule],
    txn: &Transaction,
    data: &LedgerData,
) -> Option<(&'r Rule, CaptureMap)> {
    let fields = extract_fields(txn, data);
    for rule in rules {
        if let Some(captures) = match_rule(rule, &fields) {
            return Some((rule, captures));
        }
    }
    None
}

/// Substitute `{field.N}` references with captured groups. Unresolved
/// references stay verbatim.
pub fn substitute_groups(text: &str, captures: &CaptureMap) -> String {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\{([A-Za-z_.][A-Za-z0-9_.]*)\.(\d+)\}").unwrap());

    re.replace_all(text, |caps: &regex::Captures<'_>| {
        let field = &caps[1];
        let index: usize = caps[2].parse().unwrap_or(0);
        captures
            .get(field)
            .and_then(|groups| index.checked_sub(1).and_then(|i| groups.get(i)))
            .cloned()
            .unwrap_or_else(|| caps[0].to_string())
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_support::sample_txn;
    use crate::models::{Account, AccountType, Category};
    use crate::rules::{Precondition, Transform};
    use regex::RegexBuilder;

    fn rule_with(id: i64, precondition: Precondition) -> Rule {
        Rule {
            id,
            precondition,
            transforms: vec![Transform::Memo("x".to_string())],
            disabled: false,
            source: std::path::PathBuf::from("test.yaml"),
        }
    }

    fn ci(pattern: &str) -> Regex {
        RegexBuilder::new(pattern).case_insensitive(true).build().unwrap()
    }

    fn data_with_account() -> LedgerData {
        let mut data = LedgerData::default();
        data.accounts.push(Account {
            id: 1,
            display_name: "BofA Checking".to_string(),
            account_type: AccountType::Asset,
            currency: "AUD".to_string(),
            opening_date: None,
            opening_balance: None,
        });
        data.categories.push(Category {
            id: 3,
            title: "Coffee".to_string(),
            parent_id: None,
        });
        data.categories.push(Category {
            id: 4,
            title: "Transfer".to_string(),
            parent_id: None,
        });
        data
    }

    #[test]
    fn test_merchant_match_case_insensitive() {
        let data = data_with_account();
        let txn = sample_txn(1); // payee "Starbucks #42"
        let rule = rule_with(
            1,
            Precondition {
                merchant: Some(ci("^starbucks")),
                ..Default::default()
            },
        );
        assert!(find_matching_rule(&[rule], &txn, &data).is_some());
    }

    #[test]
    fn test_first_match_wins_by_id_order() {
        let data = data_with_account();
        let txn = sample_txn(1);
        let rules = vec![
            rule_with(
                1,
                Precondition {
                    merchant: Some(ci("starbucks")),
                    ..Default::default()
                },
            ),
            rule_with(
                2,
                Precondition {
                    merchant: Some(ci(".*")),
                    ..Default::default()
                },
            ),
        ];
        let (matched, _) = find_matching_rule(&rules, &txn, &data).unwrap();
        assert_eq!(matched.id, 1);
    }

    #[test]
    fn test_conjunction_all_conditions_required() {
        let data = data_with_account();
        let mut txn = sample_txn(1);
        txn.category_id = Some(3);

        let both = rule_with(
            1,
            Precondition {
                merchant: Some(ci("starbucks")),
                category: Some(ci("coffee")),
                ..Default::default()
            },
        );
        assert!(match_rule(&both, &extract_fields(&txn, &data)).is_some());

        let mismatched = rule_with(
            2,
            Precondition {
                merchant: Some(ci("starbucks")),
                category: Some(ci("groceries")),
                ..Default::default()
            },
        );
        assert!(match_rule(&mismatched, &extract_fields(&txn, &data)).is_none());
    }

    #[test]
    fn test_transfer_category_not_matchable() {
        let data = data_with_account();
        let mut txn = sample_txn(1);
        txn.category_id = Some(4); // Transfer
        let rule = rule_with(
            1,
            Precondition {
                category: Some(ci("transfer")),
                ..Default::default()
            },
        );
        assert!(match_rule(&rule, &extract_fields(&txn, &data)).is_none());
    }

    #[test]
    fn test_metadata_conditions() {
        let data = data_with_account();
        let mut txn = sample_txn(1);
        txn.metadata
            .insert("needs_reimburse".to_string(), "true".to_string());

        let mut metadata = BTreeMap::new();
        metadata.insert("needs_reimburse".to_string(), ci("^true$"));
        let rule = rule_with(
            1,
            Precondition {
                metadata,
                ..Default::default()
            },
        );
        assert!(match_rule(&rule, &extract_fields(&txn, &data)).is_some());

        // needs_review is exposed as metadata too.
        let mut metadata = BTreeMap::new();
        metadata.insert("needs_review".to_string(), ci("^false$"));
        let rule = rule_with(
            2,
            Precondition {
                metadata,
                ..Default::default()
            },
        );
        assert!(match_rule(&rule, &extract_fields(&txn, &data)).is_some());
    }

    #[test]
    fn test_missing_field_fails_match() {
        let data = LedgerData::default(); // no accounts
        let txn = sample_txn(1);
        let rule = rule_with(
            1,
            Precondition {
                account: Some(ci(".*")),
                ..Default::default()
            },
        );
        assert!(find_matching_rule(&[rule], &txn, &data).is_none());
    }

    #[test]
    fn test_substitute_groups() {
        let mut captures = CaptureMap::new();
        captures.insert("merchant".to_string(), vec!["42".to_string()]);
        assert_eq!(
            substitute_groups("store-{merchant.1}", &captures),
            "store-42"
        );
        // Unresolved references stay verbatim.
        assert_eq!(
            substitute_groups("{merchant.2} {account.1}", &captures),
            "{merchant.2} {account.1}"
        );
    }

    #[test]
    fn test_capture_groups_flow_from_match() {
        let data = data_with_account();
        let txn = sample_txn(1);
        let rule = rule_with(
            1,
            Precondition {
                merchant: Some(ci(r"starbucks #(\d+)")),
                ..Default::default()
            },
        );
        let (_, captures) = find_matching_rule(&[rule], &txn, &data).unwrap();
        assert_eq!(captures["merchant"], vec!["42".to_string()]);
    }
}
