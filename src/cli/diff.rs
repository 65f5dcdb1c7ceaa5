use comfy_table::{Cell, Table};

use crate::changelog::render_diff_line;
use crate::cli::{build_remote, resolve_archive, CommonOpts, DiffFormat, WindowOpts};
use crate::comparator::Comparison;
use crate::config::Config;
use crate::error::Result;
use crate::models::Field;
use crate::store::LedgerData;
use crate::sync::{self, CancelFlag};

pub fn run(
    common: &CommonOpts,
    window: &WindowOpts,
    id: Option<i64>,
    format: DiffFormat,
    config: &Config,
    cancel: &CancelFlag,
) -> Result<()> {
    let archive = resolve_archive(&common.destination, config)?;
    let window = window.resolve()?;
    let remote = build_remote(config)?;

    let (comparison, data) = sync::diff(&remote, &archive, window, id, cancel)?;

    match format {
        DiffFormat::Summary => print_summary(&comparison),
        DiffFormat::Ids => print_ids(&comparison),
        DiffFormat::Changelog => print_changelog(&comparison, &data),
        DiffFormat::Diff => print_table(&comparison, &data),
    }
    Ok(())
}

fn print_summary(comparison: &Comparison) {
    let summary = comparison.summary;
    println!("identical:    {}", summary.identical);
    println!("differs:      {}", summary.differs);
    println!("only-local:   {}", summary.only_local);
    println!("only-remote:  {}", summary.only_remote);
}

fn print_ids(comparison: &Comparison) {
    for id in comparison.differing_ids() {
        println!("{id}");
    }
}

fn field_display(field: Field, value: &crate::models::Value, data: &LedgerData) -> String {
    match (field, value) {
        (Field::CategoryId, crate::models::Value::Int(id)) => data
            .category(*id)
            .map(|c| c.ledger_name())
            .unwrap_or_else(|| id.to_string()),
        _ => value.to_string(),
    }
}

/// `DIFF` lines share the changelog grammar but only ever go to stdout.
fn print_changelog(comparison: &Comparison, data: &LedgerData) {
    for diff in comparison.field_diffs() {
        println!(
            "{}",
            render_diff_line(
                diff.txn_id,
                diff.field.name(),
                &field_display(diff.field, &diff.local, data),
                &field_display(diff.field, &diff.remote, data),
            )
        );
    }
}

fn print_table(comparison: &Comparison, data: &LedgerData) {
    let diffs = comparison.field_diffs();
    if diffs.is_empty() {
        println!("No differences.");
        return;
    }
    let mut table = Table::new();
    table.set_header(vec!["id", "field", "local", "remote"]);
    for diff in diffs {
        table.add_row(vec![
            Cell::new(diff.txn_id),
            Cell::new(diff.field.name()),
            Cell::new(field_display(diff.field, &diff.local, data)),
            Cell::new(field_display(diff.field, &diff.remote, data)),
        ]);
    }
    println!("{table}");
}
