use comfy_table::{presets, CellAlignment, Table};
use serde::Serialize;

use crate::app::GlobalOptions;

/// Emit `report` as pretty JSON under `--json`, otherwise through `render`.
pub fn emit<T: Serialize>(
    report: &T,
    opts: &GlobalOptions,
    render: impl FnOnce(&T),
) -> anyhow::Result<()> {
    if !opts.json {
        render(report);
        return Ok(());
    }
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

/// Borderless listing of addresses, steps or triggers.
///
/// The first `numeric` columns hold numbers and are right-aligned.
pub struct Listing {
    table: Table,
}

impl Listing {
    pub fn new(columns: &[&str], numeric: usize) -> Self {
        let mut table = Table::new();
        table.load_preset(presets::NOTHING).set_header(columns.to_vec());
        for (i, column) in table.column_iter_mut().enumerate() {
            if i < numeric {
                column.set_cell_alignment(CellAlignment::Right);
            }
            column.set_padding((u16::from(i > 0), 1));
        }
        Self { table }
    }

    pub fn push(&mut self, cells: Vec<String>) {
        self.table.add_row(cells);
    }

    /// Print every line behind `margin`.
    pub fn print(&self, margin: &str) {
        for line in self.table.to_string().lines() {
            println!("{margin}{}", line.trim_end());
        }
    }
}

pub fn hex(value: u64) -> String {
    format!("{value:#x}")
}
