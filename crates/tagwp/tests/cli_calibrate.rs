use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};
use tagwp_core::data::io::write_parquet_table;
use tagwp_core::{Column, EventSchema, TaggerVariant};

fn bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_tagwp"))
}

fn tmp_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let mut p = std::env::temp_dir();
    p.push(format!("tagwp_cli_{}_{}_{}", std::process::id(), nanos, name));
    std::fs::create_dir_all(&p).unwrap();
    p
}

fn run(args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {:?} {:?}: {}", bin_path(), args, e))
}

fn schema() -> EventSchema {
    EventSchema::default().ctau_labels(["1", "10"]).n_stages(3)
}

/// `n` events with all jet-multiplicity bands populated on both sides of HT = 900. Tagger
/// scores rise with the entry index; odd entries are a second signal mass point.
fn write_events(path: &Path, n: usize) {
    let column = |f: &dyn Fn(usize) -> f64| Column::Scalar((0..n).map(f).collect());
    let mut columns = IndexMap::from([
        (
            "nominal_ht".to_string(),
            column(&|i| if (i / 4) % 2 == 0 { 1000.0 } else { 800.0 }),
        ),
        (
            "selectedJets_nominal_pt".to_string(),
            Column::List((0..n).map(|i| vec![150.0 + i as f64, 60.0]).collect()),
        ),
        ("nselectedJets_nominal".to_string(), column(&|i| (3 + i % 4) as f64)),
        ("nominal_mht".to_string(), column(&|_| 350.0)),
        ("genweight".to_string(), column(&|_| 1.0)),
        (
            "llp".to_string(),
            column(&|i| if i % 2 == 0 { 2000.0 } else { 1600.0 }),
        ),
        (
            "lsp".to_string(),
            column(&|i| if i % 2 == 0 { 200.0 } else { 1400.0 }),
        ),
    ]);
    for field in schema().tagger_fields(TaggerVariant::Nominal) {
        columns.insert(
            field.name().to_string(),
            column(&|i| (i + 1) as f64 / (n + 1) as f64),
        );
    }
    write_parquet_table(path, &columns).unwrap();
}

/// A complete run directory; returns the path of its config.
fn write_run(dir: &Path) -> PathBuf {
    for (folder, n) in [
        ("TT", 120),
        ("SMS-T1qqqq_ctau-1", 20),
        ("SMS-T1qqqq_ctau-10", 20),
    ] {
        let folder = dir.join("events").join(folder);
        std::fs::create_dir_all(&folder).unwrap();
        write_events(&folder.join("nano_1.parquet"), n);
    }
    std::fs::write(dir.join("events/TT/notes.txt"), "not an event file").unwrap();
    let genweights = r#"{
  "TT": {"sum": 120, "weighted": 120.0},
  "SMS-T1qqqq_ctau-1": {"2000": {"200": {"weighted": 10.0}}},
  "SMS-T1qqqq_ctau-10": {"2000": {"200": {"weighted": 10.0}}}
}"#;
    std::fs::write(dir.join("eventyields.json"), genweights).unwrap();
    let config = r#"input_dir: events
genweights: eventyields.json
cache_dir: cache
preselection: pass
cross_sections: {TT: 1.0}
background: {cache: background_noda, processes: [TT]}
signals:
  - name: uncompressed
    cache: "ll{ctau}_uncompressed"
    processes: ["SMS-T1qqqq_ctau-{ctau}"]
    llp: 2000
    lsp: 200
    cross_section: 0.5
signal_ctau: ["1", "10"]
ctau_titles: ["ctau = 1 mm", "ctau = 10 mm"]
calibration: {luminosity: 100.0}
schema: {ctau_labels: ["1", "10"], n_stages: 3}
"#;
    let path = dir.join("run.yaml");
    std::fs::write(&path, config).unwrap();
    path
}

#[test]
fn inspect_prints_counts_and_fields() {
    let dir = tmp_dir("inspect");
    let a = dir.join("a.parquet");
    let b = dir.join("b.parquet");
    write_events(&a, 7);
    write_events(&b, 5);

    let out = run(&[
        "inspect",
        a.to_string_lossy().as_ref(),
        b.to_string_lossy().as_ref(),
        "--field",
        "nominal_ht",
        "--field",
        "selectedJets_nominal_pt[1]",
        "--head",
        "2",
    ]);
    assert!(
        out.status.success(),
        "inspect should succeed, stderr={}",
        String::from_utf8_lossy(&out.stderr)
    );
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("12  total"), "stdout={stdout}");
    assert!(stdout.contains("selectedJets_nominal_pt[1]"));
    assert!(stdout.contains("60.000000"));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn inspect_rejects_unknown_extensions() {
    let dir = tmp_dir("inspect_bad");
    let path = dir.join("events.csv");
    std::fs::write(&path, "ht\n1\n").unwrap();

    let out = run(&["inspect", path.to_string_lossy().as_ref()]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("events.csv"), "stderr={stderr}");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn registry_lists_discovered_processes() {
    let dir = tmp_dir("registry");
    let config = write_run(&dir);

    let out = run(&["registry", "--config", config.to_string_lossy().as_ref()]);
    assert!(
        out.status.success(),
        "registry should succeed, stderr={}",
        String::from_utf8_lossy(&out.stderr)
    );
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("TT"));
    assert!(stdout.contains("SMS-T1qqqq_ctau-10"));
    assert!(stdout.contains("mass point"));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn calibrate_writes_reports_and_caches() {
    let dir = tmp_dir("calibrate");
    let config = write_run(&dir);
    let json_path = dir.join("reports.json");

    let out = run(&[
        "calibrate",
        "--config",
        config.to_string_lossy().as_ref(),
        "--output",
        json_path.to_string_lossy().as_ref(),
    ]);
    assert!(
        out.status.success(),
        "calibrate should succeed, stderr={}",
        String::from_utf8_lossy(&out.stderr)
    );
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("var 0 ctau = 1 mm"), "stdout={stdout}");
    assert!(stdout.contains("var 1 ctau = 10 mm"));
    assert_eq!(stdout.lines().filter(|l| l.starts_with("uncompressed")).count(), 6);

    assert!(dir.join("cache/background_noda.parquet").is_file());
    assert!(dir.join("cache/ll1_uncompressed.parquet").is_file());
    assert!(dir.join("cache/ll10_uncompressed.parquet").is_file());

    let bytes = std::fs::read(&json_path).unwrap();
    let reports: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let reports = reports.as_array().unwrap();
    assert_eq!(reports.len(), 2);
    let strata = reports[0]["thresholds"]["strata"].as_array().unwrap();
    assert_eq!(strata.len(), 6);
    let working_point = reports[0]["thresholds"]["working_point"].as_f64().unwrap();
    assert!(working_point > 0.0 && working_point < 1.0);
    let sections = reports[0]["sections"].as_array().unwrap();
    assert_eq!(sections.len(), 3);

    let signal = &sections[0]["rows"][1];
    assert_eq!(signal[0], "uncompressed");
    let selected: u64 = signal[1]["categories"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["count"].as_u64().unwrap())
        .sum();
    // only the 10 events at the requested mass point were extracted
    assert!(selected <= 10);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn extract_reuses_cache_without_inputs() {
    let dir = tmp_dir("extract");
    let config = write_run(&dir);

    let first = run(&["extract", "--config", config.to_string_lossy().as_ref()]);
    assert!(
        first.status.success(),
        "extract should succeed, stderr={}",
        String::from_utf8_lossy(&first.stderr)
    );
    let first = String::from_utf8_lossy(&first.stdout).to_string();
    assert!(first.contains("ll1_uncompressed"));

    for folder in ["TT", "SMS-T1qqqq_ctau-1", "SMS-T1qqqq_ctau-10"] {
        std::fs::remove_file(dir.join("events").join(folder).join("nano_1.parquet")).unwrap();
    }
    let second = run(&["extract", "--config", config.to_string_lossy().as_ref()]);
    assert!(
        second.status.success(),
        "cached extract should succeed, stderr={}",
        String::from_utf8_lossy(&second.stderr)
    );
    assert_eq!(first, String::from_utf8_lossy(&second.stdout));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn calibrate_rejects_unknown_ctau_index() {
    let dir = tmp_dir("bad_ctau");
    let config = write_run(&dir);

    let out = run(&["calibrate", "--config", config.to_string_lossy().as_ref(), "--ctau", "5"]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("ctau index 5"), "stderr={stderr}");

    let _ = std::fs::remove_dir_all(&dir);
}
