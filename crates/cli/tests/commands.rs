//! End-to-end tests of the `particles` binary on the CPU backend.

use std::path::PathBuf;
use std::process::{Command, Output};

fn particles(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_particles"))
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .expect("failed to launch particles binary")
}

fn shipped_config() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../orchestrator/configs/particles.json")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

#[test]
fn devices_lists_cpu_platform() {
    let out = particles(&["devices", "--backend", "cpu"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let text = stdout(&out);
    assert!(text.contains("Platform:"), "{text}");
    assert!(text.contains("interop:"), "{text}");
}

#[test]
fn validate_accepts_shipped_config() {
    let config = shipped_config();
    let out = particles(&["validate", "--config", config.to_str().unwrap()]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let text = stdout(&out);
    assert!(text.contains("update_particles"), "{text}");
    assert!(text.contains("slot 5"), "{text}");
    assert!(text.starts_with("Kernel") && text.contains("OK:"), "{text}");
}

#[test]
fn validate_rejects_kernel_without_entry_point() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("other.wgsl"),
        "@group(0) @binding(0) var<storage, read_write> data: array<vec4<f32>>;\n\
         @compute @workgroup_size(64)\n\
         fn other(@builtin(global_invocation_id) id: vec3<u32>) { data[id.x] = vec4<f32>(0.0); }\n",
    )
    .unwrap();
    let config = dir.path().join("run.json");
    std::fs::write(&config, r#"{ "name": "other", "kernel_file": "other.wgsl" }"#).unwrap();

    let out = particles(&["validate", "--config", config.to_str().unwrap()]);
    assert!(!out.status.success());
    let err = String::from_utf8_lossy(&out.stderr);
    assert!(err.contains("update_particles"), "{err}");
}

#[test]
fn run_prints_json_summary() {
    let config = shipped_config();
    let out = particles(&[
        "run",
        "--backend",
        "cpu",
        "--config",
        config.to_str().unwrap(),
        "--frames",
        "5",
        "--json",
    ]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let summary: serde_json::Value = serde_json::from_str(&stdout(&out)).unwrap();
    assert_eq!(summary["frames"], 5);
    assert_eq!(summary["completed"], 5);
    assert_eq!(summary["draws"], 5);
}

#[test]
fn unknown_subcommand_fails() {
    let out = particles(&["explode"]);
    assert!(!out.status.success());
}
