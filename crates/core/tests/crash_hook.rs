use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use tempfile::tempdir;
use upscaler_core::logging::{
    install_panic_hook, PanicHookStatus, DEFAULT_CRASH_DIR_NAME, DEFAULT_LOG_DIR_NAME,
};

const CHILD_MODE_ENV: &str = "UPSCALER_PANIC_CHILD_MODE";
const CHILD_DATA_DIR_ENV: &str = "UPSCALER_PANIC_CHILD_DATA_DIR";

fn crash_dir(data_dir: &Path) -> PathBuf {
    data_dir
        .join(DEFAULT_LOG_DIR_NAME)
        .join(DEFAULT_CRASH_DIR_NAME)
}

fn run_panic_child(mode: &str, data_dir: &Path) -> std::process::Output {
    Command::new(std::env::current_exe().expect("test executable path"))
        .arg("panic_hook_child_entrypoint")
        .arg("--exact")
        .arg("--nocapture")
        .env(CHILD_MODE_ENV, mode)
        .env(CHILD_DATA_DIR_ENV, data_dir)
        .output()
        .expect("run panic hook child")
}

#[test]
fn panic_hook_child_entrypoint() {
    let Ok(mode) = std::env::var(CHILD_MODE_ENV) else {
        return;
    };
    let data_dir = PathBuf::from(std::env::var(CHILD_DATA_DIR_ENV).expect("child data dir"));

    assert!(matches!(
        install_panic_hook(Some(&data_dir)),
        PanicHookStatus::Installed { .. } | PanicHookStatus::AlreadyInstalled { .. }
    ));
    assert!(matches!(
        install_panic_hook(Some(&data_dir)),
        PanicHookStatus::AlreadyInstalled { .. }
    ));

    match mode.as_str() {
        "write_success" => panic!("tile worker exploded token=hf_abc123"),
        "write_failure" => {
            let dir = crash_dir(&data_dir);
            fs::remove_dir_all(&dir).expect("remove crash directory");
            fs::write(&dir, b"not-a-directory").expect("replace crash directory with file");
            panic!("tile worker exploded with unwritable crash dir");
        }
        other => panic!("unknown child mode: {other}"),
    }
}

#[test]
fn crash_report_is_written_and_redacted() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("write_success", data_dir.path());
    assert!(!output.status.success(), "child process should panic");

    let mut reports: Vec<PathBuf> = fs::read_dir(crash_dir(data_dir.path()))
        .expect("read crash directory")
        .map(|entry| entry.expect("crash dir entry").path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("log"))
        .collect();
    reports.sort();
    let newest = reports.last().expect("crash report written");
    let contents = fs::read_to_string(newest).expect("read crash report");

    assert!(contents.contains("timestamp_utc="));
    assert!(contents.contains("version="));
    assert!(contents.contains("location="));
    assert!(contents.contains("payload=tile worker exploded token=***REDACTED***"));
    assert!(!contents.contains("hf_abc123"));
    assert!(contents.contains("backtrace:"));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("panicked while panicking"));
}

#[test]
fn unwritable_crash_dir_warns_without_repanicking() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("write_failure", data_dir.path());
    assert!(!output.status.success(), "child process should panic");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("tile worker exploded with unwritable crash dir"));
    assert!(stderr.contains("Warning: failed to write crash report under"));
    assert!(!stderr.contains("panicked while panicking"));
}
