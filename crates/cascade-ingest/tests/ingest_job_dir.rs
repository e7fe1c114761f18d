use cascade_core::{JobKey, PeriodKind, SourceFormat};
use cascade_ingest::{ingest_dir, read_passes_csv, read_passes_json, write_passes_csv, write_passes_json};
use chrono::Utc;
use std::fs;
use std::path::PathBuf;

fn temp_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "cascade_ingest_it_{}_{}_{}",
        label,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn key() -> JobKey {
    JobKey {
        robot: "Experts\\Grid.ex5".to_string(),
        symbol: "EURUSD".to_string(),
        timeframe: "M15".to_string(),
        period: "fw_2023".to_string(),
        kind: PeriodKind::Forwardtest,
    }
}

fn utf16le_with_bom(text: &str) -> Vec<u8> {
    let mut out = vec![0xFF, 0xFE];
    for unit in text.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

#[test]
fn corrupt_xml_does_not_hide_a_good_csv() {
    let dir = temp_dir("partial");
    fs::write(
        dir.join("a_report.xml"),
        "<Optimization><Pass Profit=\"10\"><Param name=\"x\"",
    )
    .expect("write xml");
    fs::write(
        dir.join("b_report.csv"),
        "Pass,Profit,Profit Factor,Trades,Profit Trades,TakeProfit\n\
         1,120.5,1.6,40,25,50\n\
         2,-15,,0,0,60\n",
    )
    .expect("write csv");

    let report = ingest_dir(&dir, &key()).expect("directory ingests");
    assert_eq!(report.files.len(), 2);
    assert_eq!(report.ingested_files(), 1);
    let failed: Vec<_> = report.failed_files().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].format, SourceFormat::Xml);

    assert_eq!(report.passes.len(), 2);
    let second = &report.passes[1];
    assert_eq!(second.pass, Some(2));
    assert_eq!(second.metrics.profit, Some(-15.0));
    assert_eq!(second.metrics.profit_factor, None);
    assert_eq!(second.metrics.total_trades, Some(0));
    assert_eq!(second.provenance.source_file, "b_report.csv");
    assert_eq!(second.provenance.period_kind, PeriodKind::Forwardtest);
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn utf16_html_report_is_decoded_and_parsed() {
    let dir = temp_dir("utf16");
    let html = "<html><body><table>\
        <tr><th>Pass</th><th>Result</th><th>Equity DD %</th><th>Lots</th></tr>\
        <tr><td>9</td><td>410.25</td><td>7.5%</td><td>0.3</td></tr>\
        </table></body></html>";
    fs::write(dir.join("report.htm"), utf16le_with_bom(html)).expect("write html");

    let report = ingest_dir(&dir, &key()).expect("ingest");
    assert_eq!(report.files[0].encoding.as_deref(), Some("UTF-16LE"));
    assert_eq!(report.passes.len(), 1);
    let pass = &report.passes[0];
    assert_eq!(pass.metrics.profit, Some(410.25));
    assert_eq!(pass.metrics.drawdown_pct, Some(7.5));
    assert_eq!(pass.parameters.get("Lots").map(String::as_str), Some("0.3"));
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn ingested_passes_survive_json_and_csv_export() {
    let dir = temp_dir("export");
    fs::write(
        dir.join("passes.csv"),
        "Pass;Profit;Sharpe Ratio;Drawdown;Comment\n\
         1;1 000,25;;300 (3.1%);\"a, b\"\n\
         2;n/a;0,75;;\n",
    )
    .expect("write csv");
    let report = ingest_dir(&dir, &key()).expect("ingest");
    assert_eq!(report.passes.len(), 2);

    let out = dir.join("out");
    write_passes_json(&out.join("passes.json"), &report.passes).expect("json");
    write_passes_csv(&out.join("passes.csv"), &report.passes).expect("csv");
    assert_eq!(
        read_passes_json(&out.join("passes.json")).expect("read json"),
        report.passes
    );
    assert_eq!(
        read_passes_csv(&out.join("passes.csv")).expect("read csv"),
        report.passes
    );
    let _ = fs::remove_dir_all(dir);
}
