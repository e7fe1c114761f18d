use crate::columns::{classify_headers, PassDraft};
use crate::ParsedTable;
use csv::{ReaderBuilder, Trim};

/// Picks the most frequent of `,` `;` and tab on the header line.
pub(crate) fn sniff_delimiter(text: &str) -> u8 {
    let header = text.lines().next().unwrap_or("");
    [b',', b';', b'\t']
        .into_iter()
        .max_by_key(|d| header.bytes().filter(|b| b == d).count())
        .filter(|d| header.as_bytes().contains(d))
        .unwrap_or(b',')
}

pub(crate) fn parse_delimited(text: &str) -> Result<ParsedTable, String> {
    let mut reader = ReaderBuilder::new()
        .delimiter(sniff_delimiter(text))
        .flexible(true)
        .trim(Trim::All)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| e.to_string())?
        .iter()
        .map(str::to_string)
        .collect();
    if headers.iter().all(|h| h.is_empty()) {
        return Err("missing header row".to_string());
    }
    let columns = classify_headers(&headers);

    let mut table = ParsedTable::default();
    for record in reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(_) => {
                table.skipped_rows += 1;
                continue;
            }
        };
        if record.iter().all(str::is_empty) {
            continue;
        }
        if record.len() != columns.len() {
            table.skipped_rows += 1;
            continue;
        }
        let mut draft = PassDraft::default();
        for (column, value) in columns.iter().zip(record.iter()) {
            draft.apply(column, value);
        }
        table.rows.push(draft);
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_semicolon_and_tab() {
        assert_eq!(sniff_delimiter("Pass;Profit;Lots\n1;2;3"), b';');
        assert_eq!(sniff_delimiter("Pass\tProfit\n"), b'\t');
        assert_eq!(sniff_delimiter("Pass,Profit\n"), b',');
        assert_eq!(sniff_delimiter("Pass\n"), b',');
    }

    #[test]
    fn rows_with_wrong_width_are_counted_not_fatal() {
        let text = "Pass;Profit;Trades;StopLoss\n1;100,5;10;20\n2;oops\n\n3;-5;0;30\n";
        let table = parse_delimited(text).expect("parse");
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.skipped_rows, 1);
        assert_eq!(table.rows[0].metrics.profit, Some(100.5));
        assert_eq!(table.rows[1].metrics.total_trades, Some(0));
        assert_eq!(
            table.rows[1].parameters.get("StopLoss").map(String::as_str),
            Some("30")
        );
    }

    #[test]
    fn empty_input_has_no_header() {
        assert!(parse_delimited("").is_err());
    }
}
