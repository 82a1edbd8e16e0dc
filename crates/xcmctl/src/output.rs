use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use xcm::AttrValue;

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// Render an attribute value for table/pretty output.
pub fn render_value(value: &AttrValue) -> String {
    match value {
        AttrValue::Bool(v) => v.to_string(),
        AttrValue::Int64(v) => v.to_string(),
        AttrValue::Str(v) => v.clone(),
        AttrValue::Bin(v) => v.iter().map(|b| format!("{b:02x}")).collect(),
    }
}

/// Convert an attribute value into its JSON form.
pub fn json_value(value: &AttrValue) -> serde_json::Value {
    match value {
        AttrValue::Bool(v) => serde_json::Value::Bool(*v),
        AttrValue::Int64(v) => serde_json::Value::from(*v),
        AttrValue::Str(v) => serde_json::Value::String(v.clone()),
        AttrValue::Bin(v) => serde_json::Value::String(render_value(&AttrValue::Bin(v.clone()))),
    }
}

pub fn print_table(header: Vec<&str>, rows: Vec<Vec<String>>) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    for row in rows {
        table.add_row(row);
    }
    println!("{table}");
}

pub fn print_json(value: &impl serde::Serialize) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}
