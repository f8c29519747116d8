use arbor_config::{init_tracing, LoggingConfig};
use tempfile::tempdir;

// The only test in this binary that installs the global subscriber.
#[test]
fn init_tracing_installs_once_and_writes_to_the_file_sink() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("arbor.log");
    let config = LoggingConfig {
        level: "info".to_owned(),
        json: true,
        stderr: false,
        file: Some(path.clone()),
    };

    assert!(init_tracing(&config));
    assert!(!init_tracing(&config));

    tracing::error!(target: "arbor.test", marker = "file-sink-check", "logging works");
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("file-sink-check"), "{text}");
    assert!(text.lines().all(|line| line.starts_with('{')), "{text}");
}
