//! Structured report parsing. Two layouts are understood: `<Pass>` elements
//! carrying metrics as attributes/leaf children with nested `<Param>`
//! elements, and the spreadsheet XML export (`Row`/`Cell`/`Data`) where the
//! first row is the header.

use crate::columns::{classify_headers, PassDraft};
use crate::ParsedTable;
use roxmltree::{Document, Node, ParsingOptions};

pub(crate) fn parse_xml(text: &str) -> Result<ParsedTable, String> {
    let options = ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    };
    let doc = Document::parse_with_options(text, options).map_err(|e| e.to_string())?;

    let mut table = ParsedTable::default();
    if let Some(summary) = doc.descendants().find(|n| n.has_tag_name("Summary")) {
        for attr in summary.attributes() {
            table
                .summary
                .insert(attr.name().to_string(), attr.value().to_string());
        }
    }

    let passes: Vec<Node> = doc
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "Pass")
        .collect();
    if !passes.is_empty() {
        for pass in passes {
            table.rows.push(parse_pass_element(pass));
        }
        return Ok(table);
    }

    parse_spreadsheet_rows(&doc, &mut table);
    Ok(table)
}

fn parse_pass_element(pass: Node) -> PassDraft {
    let mut names = Vec::new();
    let mut values = Vec::new();
    for attr in pass.attributes() {
        names.push(attr.name().to_string());
        values.push(attr.value().to_string());
    }
    for child in pass.children().filter(|c| c.is_element()) {
        let tag = child.tag_name().name();
        if tag == "Param" || tag == "Parameters" {
            continue;
        }
        if child.children().any(|c| c.is_element()) {
            continue;
        }
        names.push(tag.to_string());
        values.push(child.text().unwrap_or("").trim().to_string());
    }

    let mut draft = PassDraft::default();
    for (column, value) in classify_headers(&names).iter().zip(&values) {
        draft.apply(column, value);
    }
    for param in pass
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "Param")
    {
        let name = param.attribute("name").unwrap_or("unknown").to_string();
        let value = param
            .attribute("value")
            .or_else(|| param.text())
            .unwrap_or("")
            .trim()
            .to_string();
        draft.parameters.insert(name, value);
    }
    draft
}

fn row_cells(row: Node) -> Vec<String> {
    row.children()
        .filter(|c| c.is_element() && c.tag_name().name() == "Cell")
        .map(|cell| {
            cell.descendants()
                .filter(|n| n.is_text())
                .filter_map(|n| n.text())
                .collect::<String>()
                .trim()
                .to_string()
        })
        .collect()
}

fn parse_spreadsheet_rows(doc: &Document, table: &mut ParsedTable) {
    let mut rows = doc
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "Row")
        .map(row_cells)
        .filter(|cells| !cells.is_empty());
    let Some(headers) = rows.next() else {
        return;
    };
    let columns = classify_headers(&headers);
    for cells in rows {
        if cells.len() != columns.len() {
            table.skipped_rows += 1;
            continue;
        }
        let mut draft = PassDraft::default();
        for (column, value) in columns.iter().zip(&cells) {
            draft.apply(column, value);
        }
        table.rows.push(draft);
    }
}
