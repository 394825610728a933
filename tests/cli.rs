//! CLI test cases.
//!
//! These run the real binary against generated page images, using the
//! sidecar OCR engine and the echo translator so that no OCR install or API
//! key is needed.

use std::{fs, io::Cursor, path::Path, process::Command};

use assert_cmd::prelude::*;
use image::{ImageFormat, Rgba, RgbaImage};
use predicates::prelude::*;
use tempfile::TempDir;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    let mut cmd = Command::cargo_bin("manga-scaler").unwrap();
    // Never talk to a real API by accident.
    cmd.env_remove("OPENAI_API_KEY").env_remove("OPENAI_API_BASE");
    cmd
}

/// Write a small white PNG to `path`.
fn write_page(path: &Path) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let img = RgbaImage::from_pixel(64, 64, Rgba([255, 255, 255, 255]));
    let mut out = Cursor::new(vec![]);
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    fs::write(path, out.into_inner()).unwrap();
}

/// Write precomputed OCR detections next to `page`.
fn write_sidecar(page: &Path, json: &str) {
    let mut name = page.as_os_str().to_owned();
    name.push(".ocr.json");
    fs::write(name, json).unwrap();
}

/// The translate command line we use for most tests.
fn translate_cmd(input: &Path) -> Command {
    let mut cmd = cmd();
    cmd.arg("translate")
        .arg(input)
        .args(["--ocr", "sidecar", "--translator", "echo", "--no-cache"]);
    cmd
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_validate_chapter() {
    let dir = TempDir::new().unwrap();
    let chapter = dir.path().join("chapter-1");
    write_page(&chapter.join("01.png"));

    cmd()
        .arg("validate")
        .arg(&chapter)
        .assert()
        .success()
        .stderr(predicate::str::contains("single chapter"))
        .stderr(predicate::str::contains("chapter-1-translated"));
}

#[test]
fn test_validate_series() {
    let dir = TempDir::new().unwrap();
    let series = dir.path().join("series");
    write_page(&series.join("ch1").join("01.png"));
    write_page(&series.join("ch2").join("01.png"));

    cmd()
        .arg("validate")
        .arg(&series)
        .assert()
        .success()
        .stderr(predicate::str::contains("series"));
}

#[test]
fn test_validate_rejects_invalid_structure() {
    let dir = TempDir::new().unwrap();
    let junk = dir.path().join("junk");
    fs::create_dir_all(&junk).unwrap();
    fs::write(junk.join("notes.txt"), "not a page").unwrap();

    cmd()
        .arg("validate")
        .arg(&junk)
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid folder structure"));
}

#[test]
fn test_validate_rejects_missing_input() {
    let dir = TempDir::new().unwrap();

    cmd()
        .arg("validate")
        .arg(dir.path().join("nope"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn test_translate_chapter_with_report() {
    let dir = TempDir::new().unwrap();
    let chapter = dir.path().join("chapter-1");
    let first = chapter.join("1.png");
    write_page(&first);
    write_page(&chapter.join("2.png"));
    write_page(&chapter.join("10.png"));
    write_sidecar(&first, r#"[{"text": "hello", "bbox": [4, 4, 40, 20]}]"#);
    let report = dir.path().join("report.jsonl");

    translate_cmd(&chapter)
        .arg("--report")
        .arg(&report)
        .assert()
        .success()
        .stderr(predicate::str::contains("3 succeeded"));

    let output = dir.path().join("chapter-1-translated");
    for name in ["1.png", "2.png", "10.png"] {
        assert!(output.join(name).is_file(), "missing {name}");
    }

    let report = fs::read_to_string(&report).unwrap();
    let lines = report.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 3);
    let results = lines
        .iter()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
        .collect::<Vec<_>>();
    assert!(results.iter().all(|r| r["status"] == "ok"));
    let translated = results
        .iter()
        .find(|r| r["image"]["relative_path"] == "1.png")
        .unwrap();
    assert_eq!(translated["blocks"][0]["translation"], "[en] hello");
}

#[test]
fn test_translate_series_mirrors_chapters() {
    let dir = TempDir::new().unwrap();
    let series = dir.path().join("series");
    write_page(&series.join("ch1").join("01.png"));
    write_page(&series.join("ch2").join("01.png"));
    write_page(&series.join("ch2").join("02.png"));

    translate_cmd(&series).assert().success();

    let output = dir.path().join("series-translated");
    assert!(output.join("ch1").join("01.png").is_file());
    assert!(output.join("ch2").join("01.png").is_file());
    assert!(output.join("ch2").join("02.png").is_file());
}

#[test]
fn test_translate_rejects_non_empty_output() {
    let dir = TempDir::new().unwrap();
    let chapter = dir.path().join("chapter-1");
    write_page(&chapter.join("01.png"));
    let output = dir.path().join("chapter-1-translated");
    fs::create_dir_all(&output).unwrap();
    fs::write(output.join("keep.txt"), "old").unwrap();

    translate_cmd(&chapter)
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists and is not empty"));

    assert_eq!(fs::read_to_string(output.join("keep.txt")).unwrap(), "old");
    assert!(!output.join("01.png").exists());
}

#[test]
fn test_translate_bad_ocr_counts_as_failure() {
    let dir = TempDir::new().unwrap();
    let chapter = dir.path().join("chapter-1");
    let first = chapter.join("01.png");
    write_page(&first);
    write_page(&chapter.join("02.png"));
    write_sidecar(&first, "[{");

    // One of two pages had an OCR error, which is more than we allow.
    translate_cmd(&chapter)
        .args(["--allowed-failure-rate", "0.1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("1/2"));

    // ...but it was still written, just without any translated text.
    let output = dir.path().join("chapter-1-translated");
    assert!(output.join("01.png").is_file());
    assert!(output.join("02.png").is_file());
}

#[test]
fn test_cache_stats_and_clear() {
    let dir = TempDir::new().unwrap();
    let cache_dir = dir.path().join("cache");
    let chapter = dir.path().join("chapter-1");
    let page = chapter.join("01.png");
    write_page(&page);
    write_sidecar(&page, r#"[{"text": "hello", "bbox": [4, 4, 40, 20]}]"#);

    cmd()
        .arg("translate")
        .arg(&chapter)
        .args(["--ocr", "sidecar", "--translator", "echo", "--cache-dir"])
        .arg(&cache_dir)
        .assert()
        .success();

    cmd()
        .args(["cache", "--cache-dir"])
        .arg(&cache_dir)
        .arg("stats")
        .assert()
        .success()
        .stderr(predicate::str::contains("1 entries"));

    cmd()
        .args(["cache", "--cache-dir"])
        .arg(&cache_dir)
        .arg("clear")
        .assert()
        .success()
        .stderr(predicate::str::contains("Removed 1 translations"));
}
