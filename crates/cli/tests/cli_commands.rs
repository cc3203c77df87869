use std::fs;
use std::path::PathBuf;

use predicates::prelude::*;
use tempfile::tempdir;

const HEADER_LEN: usize = 28;

/// Minimal MZ file: `mov ax, 0x1234; ret` entered at 0000:0000.
fn mz_fixture() -> Vec<u8> {
    let image = [0xB8u8, 0x34, 0x12, 0xC3];
    let header_size = 32;
    let file_size = header_size + image.len();

    let mut bytes = vec![0u8; header_size];
    let mut word = |at: usize, v: u16| bytes[at..at + 2].copy_from_slice(&v.to_le_bytes());
    word(0, u16::from_le_bytes(*b"MZ"));
    word(2, (file_size % 512) as u16);
    word(4, file_size.div_ceil(512) as u16);
    word(8, (header_size / 16) as u16);
    word(24, HEADER_LEN as u16);
    bytes.extend_from_slice(&image);
    bytes
}

fn rec(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![kind];
    out.extend_from_slice(&((payload.len() as u16 + 1).to_le_bytes()));
    out.extend_from_slice(payload);
    out.push(0);
    out
}

fn cstr(s: &str) -> Vec<u8> {
    let mut out = vec![s.len() as u8];
    out.extend_from_slice(s.as_bytes());
    out
}

/// Bare .obj module "hello": public `_main` over a one-byte CODE segment,
/// importing `_missing`.
fn obj_fixture() -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend(rec(0x80, &cstr("hello"))); // THEADR
    let mut lnames = cstr("");
    lnames.extend(cstr("CODE"));
    lnames.extend(cstr("_TEXT"));
    bytes.extend(rec(0x96, &lnames)); // LNAMES
    bytes.extend(rec(0x98, &[0x48, 0x01, 0x00, 3, 2, 1])); // SEGDEF
    let mut pubdef = vec![0, 1];
    pubdef.extend(cstr("_main"));
    pubdef.extend_from_slice(&[0x00, 0x00, 0x00]);
    bytes.extend(rec(0x90, &pubdef)); // PUBDEF
    let mut extdef = cstr("_missing");
    extdef.push(0);
    bytes.extend(rec(0x8C, &extdef)); // EXTDEF
    bytes.extend(rec(0xA0, &[1, 0x00, 0x00, 0xC3])); // LEDATA: ret
    bytes.extend(rec(0x8A, &[0x00])); // MODEND
    bytes
}

fn write_fixture(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, bytes).expect("write fixture");
    path
}

/// `info` on an executable reports the container format and entry point
/// without running any analysis.
#[test]
fn info_reports_executable_container() {
    let dir = tempdir().expect("tempdir");
    let exe = write_fixture(&dir, "demo.exe", &mz_fixture());

    assert_cmd::cargo::cargo_bin_cmd!("dosdis")
        .arg("info")
        .arg(&exe)
        .assert()
        .success()
        .stdout(predicate::str::contains("MZ executable"))
        .stdout(predicate::str::contains("Entry: 0000:0000"));
}

/// `info --json` must emit a parseable object with the format marker.
#[test]
fn info_json_is_machine_readable() {
    let dir = tempdir().expect("tempdir");
    let exe = write_fixture(&dir, "demo.exe", &mz_fixture());

    let output = assert_cmd::cargo::cargo_bin_cmd!("dosdis")
        .arg("info")
        .arg(&exe)
        .arg("--json")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report: serde_json::Value = serde_json::from_slice(&output).expect("valid JSON");
    assert_eq!(report["format"], "mz");
    assert_eq!(report["relocations"], 0);
}

/// `analyze` finds the entry procedure and reports it as `start`.
#[test]
fn analyze_names_the_entry_procedure() {
    let dir = tempdir().expect("tempdir");
    let exe = write_fixture(&dir, "demo.exe", &mz_fixture());

    assert_cmd::cargo::cargo_bin_cmd!("dosdis")
        .arg("analyze")
        .arg(&exe)
        .assert()
        .success()
        .stdout(predicate::str::contains("start"));
}

/// `analyze --json` carries the procedure list and instruction count.
#[test]
fn analyze_json_reports_procedures() {
    let dir = tempdir().expect("tempdir");
    let exe = write_fixture(&dir, "demo.exe", &mz_fixture());

    let output = assert_cmd::cargo::cargo_bin_cmd!("dosdis")
        .arg("analyze")
        .arg(&exe)
        .arg("--json")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report: serde_json::Value = serde_json::from_slice(&output).expect("valid JSON");
    assert_eq!(report["instructions"], 2);
    assert_eq!(report["procedures"][0]["name"], "start");
}

/// `analyze --listing` prints one line per decoded instruction.
#[test]
fn analyze_listing_prints_instructions() {
    let dir = tempdir().expect("tempdir");
    let exe = write_fixture(&dir, "demo.exe", &mz_fixture());

    assert_cmd::cargo::cargo_bin_cmd!("dosdis")
        .arg("analyze")
        .arg(&exe)
        .arg("--listing")
        .assert()
        .success()
        .stdout(predicate::str::contains("mov"))
        .stdout(predicate::str::contains("ret"));
}

/// `symbols` lists publics and flags externals nothing defines.
#[test]
fn symbols_lists_publics_and_unresolved_externals() {
    let dir = tempdir().expect("tempdir");
    let obj = write_fixture(&dir, "hello.obj", &obj_fixture());

    assert_cmd::cargo::cargo_bin_cmd!("dosdis")
        .arg("symbols")
        .arg(&obj)
        .assert()
        .success()
        .stdout(predicate::str::contains("pub _main"))
        .stdout(predicate::str::contains("ext _missing (unresolved)"));
}

/// Symbol tables only exist for object libraries; asking an executable for
/// them is an error.
#[test]
fn symbols_on_an_executable_fails() {
    let dir = tempdir().expect("tempdir");
    let exe = write_fixture(&dir, "demo.exe", &mz_fixture());

    assert_cmd::cargo::cargo_bin_cmd!("dosdis")
        .arg("symbols")
        .arg(&exe)
        .assert()
        .failure()
        .stderr(predicate::str::contains("OMF object libraries"));
}

/// A file in neither format is rejected with a load error.
#[test]
fn unknown_format_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let junk = write_fixture(&dir, "junk.bin", b"\x7fELF not our format");

    assert_cmd::cargo::cargo_bin_cmd!("dosdis")
        .arg("info")
        .arg(&junk)
        .assert()
        .failure();
}

/// A missing input path fails with a readable message.
#[test]
fn missing_file_is_reported() {
    assert_cmd::cargo::cargo_bin_cmd!("dosdis")
        .arg("info")
        .arg("no-such-file.exe")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read"));
}
