use std::fs::File;
use std::io::Write;

use aps_config::{BasalRow, load_basal_csv};
use rstest::rstest;
use tempfile::tempdir;

#[rstest]
fn loads_well_formed_schedule() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("basal.csv");
    let mut f = File::create(&path).unwrap();
    writeln!(f, "start,rate").unwrap();
    writeln!(f, "00:00,0.8").unwrap();
    writeln!(f, "06:30,1.05").unwrap();
    writeln!(f, "22:00:00, 0.7").unwrap();

    let rows = load_basal_csv(&path).unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(
        rows[1],
        BasalRow {
            start: "06:30".into(),
            rate: 1.05
        }
    );
    assert_eq!(rows[2].minutes().unwrap(), 22 * 60);
}

#[rstest]
#[case("time,rate")]
#[case("start,units")]
#[case("rate,start")]
fn rejects_wrong_headers(#[case] header: &str) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("basal.csv");
    let mut f = File::create(&path).unwrap();
    writeln!(f, "{header}").unwrap();
    writeln!(f, "00:00,0.8").unwrap();

    let err = load_basal_csv(&path).unwrap_err();
    assert!(format!("{err}").contains("must have headers 'start,rate'"));
}

#[rstest]
#[case("00:00,abc", 2)]
#[case("25:00,0.5", 2)]
fn reports_row_number_for_bad_rows(#[case] line: &str, #[case] row: usize) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("basal.csv");
    let mut f = File::create(&path).unwrap();
    writeln!(f, "start,rate").unwrap();
    writeln!(f, "{line}").unwrap();

    let err = load_basal_csv(&path).unwrap_err();
    assert!(format!("{err}").contains(&format!("invalid CSV row {row}")), "got: {err}");
}

#[rstest]
fn rejects_empty_schedule() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("basal.csv");
    let mut f = File::create(&path).unwrap();
    writeln!(f, "start,rate").unwrap();
    let err = load_basal_csv(&path).unwrap_err();
    assert!(format!("{err}").contains("has no rows"));
}
