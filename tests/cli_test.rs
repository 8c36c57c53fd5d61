// Integration tests for the xzibit-bus binary
// Run with: cargo test --test cli_test

use std::process::Command;
use tempfile::TempDir;

const BIN: &str = env!("CARGO_BIN_EXE_xzibit-bus");

/// A socket path too long to bind exits with status 2 and explains why
#[test]
fn test_serve_unbindable_socket_exits_with_status_2() {
    let temp_dir = TempDir::new().unwrap();
    let socket = temp_dir.path().join("s".repeat(200));

    let output = Command::new(BIN)
        .args(["serve", "--socket", socket.to_str().unwrap()])
        .env_remove("XZIBIT_BUS_CONFIG")
        .env_remove("XZIBIT_BUS_SOCKET")
        .env_remove("XZIBIT_BUS_LOG_FILE")
        .output()
        .expect("Failed to execute serve command");

    assert_eq!(output.status.code(), Some(2), "Bind failure should exit with 2");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("xzibit-bus:"), "Should report the error: {stderr}");
    assert!(!socket.exists(), "No socket file should be left behind");
}

/// Same exit status when `serve` is implied
#[test]
fn test_default_command_unbindable_socket_exits_with_status_2() {
    let temp_dir = TempDir::new().unwrap();
    let socket = temp_dir.path().join("s".repeat(200));

    let output = Command::new(BIN)
        .args(["--socket", socket.to_str().unwrap()])
        .env_remove("XZIBIT_BUS_CONFIG")
        .env_remove("XZIBIT_BUS_SOCKET")
        .env_remove("XZIBIT_BUS_LOG_FILE")
        .output()
        .expect("Failed to execute default command");

    assert_eq!(output.status.code(), Some(2));
}

/// Clients report a missing bus as an ordinary error, not a bind failure
#[test]
fn test_announce_without_bus_fails() {
    let temp_dir = TempDir::new().unwrap();
    let socket = temp_dir.path().join("absent.sock");

    let output = Command::new(BIN)
        .args(["announce", "--socket", socket.to_str().unwrap()])
        .env_remove("XZIBIT_BUS_CONFIG")
        .env_remove("XZIBIT_BUS_SOCKET")
        .env_remove("XZIBIT_BUS_LOG_FILE")
        .output()
        .expect("Failed to execute announce command");

    assert!(!output.status.success());
    assert_ne!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to connect to bus"), "{stderr}");
}
