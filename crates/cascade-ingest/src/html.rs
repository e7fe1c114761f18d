//! Tabular HTML reports. The first table whose header row names a known
//! column is used; without one, the first table in the document.

use crate::columns::{classify_headers, Column, PassDraft};
use crate::ParsedTable;
use scraper::{ElementRef, Html, Selector};

fn selector(css: &str) -> Result<Selector, String> {
    Selector::parse(css).map_err(|e| format!("bad selector {}: {:?}", css, e))
}

fn cell_text(cell: ElementRef) -> String {
    cell.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn table_rows(table: ElementRef, rows: &Selector, cells: &Selector) -> Vec<Vec<String>> {
    table
        .select(rows)
        .map(|row| row.select(cells).map(cell_text).collect::<Vec<_>>())
        .filter(|cells| !cells.is_empty())
        .collect()
}

pub(crate) fn parse_html(text: &str) -> Result<ParsedTable, String> {
    let document = Html::parse_document(text);
    let table_sel = selector("table")?;
    let row_sel = selector("tr")?;
    let cell_sel = selector("th, td")?;
    let summary_sel = selector("div.summary p")?;

    let tables: Vec<Vec<Vec<String>>> = document
        .select(&table_sel)
        .map(|t| table_rows(t, &row_sel, &cell_sel))
        .filter(|rows| !rows.is_empty())
        .collect();
    if tables.is_empty() {
        return Err("no table found in document".to_string());
    }

    let chosen = tables
        .iter()
        .position(|rows| classify_headers(&rows[0]).iter().any(Column::is_known))
        .unwrap_or(0);
    let rows = &tables[chosen];

    let mut table = ParsedTable::default();
    let columns = classify_headers(&rows[0]);
    for cells in &rows[1..] {
        if cells.len() != columns.len() {
            table.skipped_rows += 1;
            continue;
        }
        let mut draft = PassDraft::default();
        for (column, value) in columns.iter().zip(cells) {
            draft.apply(column, value);
        }
        table.rows.push(draft);
    }

    for p in document.select(&summary_sel) {
        let line = cell_text(p);
        if let Some((key, value)) = line.split_once(':') {
            table
                .summary
                .insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_the_table_with_known_headers() {
        let html = r#"<html><body>
<table><tr><td>Strategy Tester Report</td></tr></table>
<div class="summary"><p>Expert: Grid</p><p>Period: H1 (2023.01.01 - 2023.06.30)</p></div>
<table>
  <tr><th>Pass</th><th>Profit</th><th>Profit Factor</th><th>Trades</th><th>Lots</th></tr>
  <tr><td>3</td><td>1 250.00</td><td>1.42</td><td>55</td><td>0.2</td></tr>
  <tr><td>4</td><td>-80.5</td><td></td><td>12</td><td>0.1</td></tr>
  <tr><td>5</td><td>broken row</td></tr>
</table>
</body></html>"#;
        let table = parse_html(html).expect("table present");
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.skipped_rows, 1);
        assert_eq!(table.rows[0].pass, Some(3));
        assert_eq!(table.rows[0].metrics.profit, Some(1250.0));
        assert_eq!(table.rows[1].metrics.profit_factor, None);
        assert_eq!(
            table.rows[1].parameters.get("Lots").map(String::as_str),
            Some("0.1")
        );
        assert_eq!(table.summary.get("Expert").map(String::as_str), Some("Grid"));
        assert_eq!(
            table.summary.get("Period").map(String::as_str),
            Some("H1 (2023.01.01 - 2023.06.30)")
        );
    }

    #[test]
    fn document_without_table_is_rejected() {
        let err = parse_html("<html><body><p>nothing here</p></body></html>")
            .expect_err("no table");
        assert!(err.contains("no table"));
    }
}
