use assert_cmd::Command;
use evolv::store::{KvStore, SqliteStore};

#[test]
fn help_lists_flags() {
    let output = Command::cargo_bin("evolv")
        .unwrap()
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for flag in ["--api", "--origin", "--state-db", "--time-unit-ms", "--reset"] {
        assert!(stdout.contains(flag), "missing {flag} in help:\n{stdout}");
    }
}

#[test]
fn reset_wipes_the_state_db_without_a_tty() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("state").join("state.db");
    {
        let mut store = SqliteStore::open(&db).unwrap();
        store.set("current_image", "https://img.test/a.png").unwrap();
        store.set("history", "[\"red\"]").unwrap();
    }

    let output = Command::cargo_bin("evolv")
        .unwrap()
        .env("HOME", dir.path())
        .arg("--state-db")
        .arg(&db)
        .arg("--reset")
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    assert!(String::from_utf8_lossy(&output.stdout).contains("wiped"));

    let store = SqliteStore::open(&db).unwrap();
    assert_eq!(store.get("current_image").unwrap(), None);
    assert_eq!(store.get("history").unwrap(), None);
}

#[test]
fn refuses_to_start_without_a_tty() {
    let dir = tempfile::tempdir().unwrap();
    let output = Command::cargo_bin("evolv")
        .unwrap()
        .env("HOME", dir.path())
        .arg("--state-db")
        .arg(dir.path().join("state.db"))
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("stdin must be a tty"));
}
