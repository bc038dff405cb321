/// Runs the non-interactive demo end to end.
///
/// The echo server starts a reactor, round-trips one message through it and
/// stops it again, so a hang or panic anywhere in the lifecycle fails here.
use std::process::{Command, Stdio};

fn run_example(name: &str) {
    let status = Command::new(env!("CARGO"))
        .args(["run", "--example", name, "--quiet"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap_or_else(|e| panic!("Failed to run example {}: {}", name, e));

    assert!(
        status.success(),
        "Example '{}' failed with exit code: {:?}",
        name,
        status.code()
    );
}

#[test]
fn echo_server_example() {
    run_example("echo_server");
}
