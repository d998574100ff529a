use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn lapse_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("lapse");
    path
}

fn setup_test_env(extra: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("remote")).unwrap();

    let config_content = format!(
        r#"[camera]
id = "CAM1"
image_dir = "{root}/images"
backend = "fake"

[schedule]
capture_interval_secs = 1
archive_interval_secs = 1
upload_interval_secs = 1
control_interval_secs = 1
shutdown_grace_secs = 5

[upload]
enabled = true
store = "dir"
dir = "{root}/remote"
log_path = "{root}/upload_log.jsonl"
{extra}
"#,
        root = root.display(),
        extra = extra,
    );

    let config_path = config_dir.join("lapse.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_lapse(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = lapse_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("NOTIFY_SOCKET")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run lapse binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn count_files(dir: &Path, ext: &str) -> usize {
    if !dir.exists() {
        return 0;
    }
    walk(dir)
        .into_iter()
        .filter(|p| p.extension().is_some_and(|e| e == ext))
        .count()
}

fn walk(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            out.extend(walk(&path));
        } else {
            out.push(path);
        }
    }
    out
}

#[test]
fn test_check_prints_topology() {
    let (_tmp, config_path) = setup_test_env("");

    let (stdout, stderr, success) = run_lapse(&config_path, &["check"]);
    assert!(success, "check failed: {}", stderr);
    assert!(stdout.contains("Device: CAM1"));
    assert!(stdout.contains("capture"));
    assert!(stdout.contains("archive"));
    assert!(stdout.contains("upload"));
    assert!(stdout.contains("store=dir"));
    assert!(stdout.contains("control"));
    assert!(stdout.contains("Capture periods: all day"));
}

#[test]
fn test_check_rejects_invalid_config() {
    let (_tmp, config_path) = setup_test_env("");
    let text = fs::read_to_string(&config_path)
        .unwrap()
        .replace("backend = \"fake\"", "backend = \"picamera\"");
    fs::write(&config_path, text).unwrap();

    let (_stdout, stderr, success) = run_lapse(&config_path, &["check"]);
    assert!(!success);
    assert!(stderr.contains("Unknown camera backend"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_stdout, stderr, success) = run_lapse(&tmp.path().join("nope.toml"), &["check"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_dark_off_mode() {
    let (_tmp, config_path) = setup_test_env("");

    let (stdout, stderr, success) = run_lapse(&config_path, &["dark"]);
    assert!(success, "dark failed: {}", stderr);
    assert!(stdout.contains("Dark: no"));
    assert!(stdout.contains("none expected"));
}

#[test]
fn test_dark_fixed_window_covering_the_day() {
    let (_tmp, config_path) = setup_test_env("\n[dark]\nmode = \"fixed\"\nstart = \"00:00:00\"\nstop = \"23:59:59\"\n");

    let (stdout, stderr, success) = run_lapse(&config_path, &["dark"]);
    assert!(success, "dark failed: {}", stderr);
    assert!(stdout.contains("Mode: fixed"));
    assert!(stdout.contains("Next transition:"));
}

#[test]
fn test_capture_writes_one_image() {
    let (tmp, config_path) = setup_test_env("");

    let (stdout, stderr, success) = run_lapse(&config_path, &["capture"]);
    assert!(success, "capture failed: {}", stderr);
    let path = PathBuf::from(stdout.trim());
    assert!(path.exists(), "no image at {}", path.display());
    assert!(path.starts_with(tmp.path().join("images")));
    assert!(path.file_name().unwrap().to_string_lossy().ends_with("-CAM1.jpg"));
    assert_eq!(fs::read(&path).unwrap(), vec![0xFF, 0xD8, 0xFF, 0xD9]);
}

#[cfg(unix)]
#[test]
fn test_run_stops_cleanly_on_sigterm() {
    let (tmp, config_path) = setup_test_env("");
    let root = tmp.path();

    let mut child = Command::new(lapse_binary())
        .arg("--config")
        .arg(&config_path)
        .arg("run")
        .env_remove("NOTIFY_SOCKET")
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    std::thread::sleep(Duration::from_secs(3));
    let rc = unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) };
    assert_eq!(rc, 0);

    let deadline = Instant::now() + Duration::from_secs(15);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        if Instant::now() > deadline {
            child.kill().unwrap();
            panic!("lapse run did not exit after SIGTERM");
        }
        std::thread::sleep(Duration::from_millis(50));
    };
    assert!(status.success(), "lapse run exited with {}", status);

    assert!(count_files(&root.join("images"), "jpg") >= 2);
    assert!(count_files(&root.join("remote"), "jpg") >= 1);
    let log = fs::read_to_string(root.join("upload_log.jsonl")).unwrap();
    assert!(log.lines().count() >= 1);
    assert!(log.contains("-CAM1.jpg"));
}
