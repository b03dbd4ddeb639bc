use assert_cmd::Command;

mod common;
use common::write_sample_dataset;

fn availai() -> Command {
    let mut cmd = Command::cargo_bin("availai").unwrap();
    cmd.env_remove("WANDB_API_KEY")
        .env_remove("ROBOFLOW_API_KEY")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn runs() {
    let mut cmd = availai();
    cmd.assert().success();
}

#[test]
fn outputs_tool_name() {
    let mut cmd = availai();
    cmd.arg("-V");
    cmd.assert()
        .success()
        .stdout(format!("availai {}\n", env!("CARGO_PKG_VERSION")));
}

#[test]
fn upload_then_download_round_trips() {
    let source = tempfile::tempdir().expect("source");
    let root = tempfile::tempdir().expect("registry root");
    let target = tempfile::tempdir().expect("target");
    write_sample_dataset(source.path());

    let mut upload = availai();
    upload
        .arg("upload")
        .arg(source.path())
        .args(["--name", "football-player", "--project", "football"])
        .args(["--api-key", "test-key"])
        .args(["--metadata", r#"{"split":"train"}"#])
        .arg("--registry-root")
        .arg(root.path());
    upload
        .assert()
        .success()
        .stdout("football-player:v0\n")
        .stderr(predicates::str::contains("artifact uploaded"));

    let destination = target.path().join("pulled");
    let mut download = availai();
    download
        .arg("download")
        .arg(&destination)
        .args(["--name", "football-player", "--project", "football"])
        .args(["--api-key", "test-key"])
        .arg("--registry-root")
        .arg(root.path());
    download
        .assert()
        .success()
        .stdout(predicates::str::contains("pulled"));

    assert!(destination.join("labels/train/frame_001.txt").is_file());
}

#[test]
fn api_key_can_come_from_environment() {
    let source = tempfile::tempdir().expect("source");
    let root = tempfile::tempdir().expect("registry root");
    write_sample_dataset(source.path());

    let mut cmd = availai();
    cmd.env("WANDB_API_KEY", "env-key")
        .arg("upload")
        .arg(source.path())
        .args(["--name", "cats"])
        .arg("--registry-root")
        .arg(root.path());
    cmd.assert().success().stdout("cats:v0\n");
}

#[test]
fn upload_without_key_fails() {
    let source = tempfile::tempdir().expect("source");
    let root = tempfile::tempdir().expect("registry root");

    let mut cmd = availai();
    cmd.arg("upload")
        .arg(source.path())
        .arg("--registry-root")
        .arg(root.path());
    cmd.assert()
        .failure()
        .stderr(predicates::str::contains("Credential error"));
}

#[test]
fn upload_missing_directory_fails() {
    let root = tempfile::tempdir().expect("registry root");

    let mut cmd = availai();
    cmd.args(["upload", "definitely/not/a/dir", "--api-key", "k"])
        .arg("--registry-root")
        .arg(root.path());
    cmd.assert()
        .failure()
        .stderr(predicates::str::contains("Invalid dataset path"));
}

#[test]
fn upload_rejects_non_object_metadata() {
    let source = tempfile::tempdir().expect("source");
    let root = tempfile::tempdir().expect("registry root");

    let mut cmd = availai();
    cmd.arg("upload")
        .arg(source.path())
        .args(["--api-key", "k", "--metadata", "[1,2]"])
        .arg("--registry-root")
        .arg(root.path());
    cmd.assert()
        .failure()
        .stderr(predicates::str::contains("metadata must be a JSON object"));
}

#[test]
fn preprocess_then_list() {
    let source = tempfile::tempdir().expect("source");
    let root = tempfile::tempdir().expect("registry root");
    write_sample_dataset(source.path());

    for _ in 0..2 {
        let mut cmd = availai();
        cmd.arg("preprocess")
            .arg(source.path())
            .args(["--name", "cats", "--api-key", "k"])
            .args(["--target", "resize", "--steps", r#"{"w":224}"#])
            .arg("--registry-root")
            .arg(root.path());
        cmd.assert().success();
    }

    let manifest = std::fs::read_to_string(root.path().join("cats/artifacts/cats/v1/manifest.json"))
        .expect("manifest");
    assert!(manifest.contains("preprocessing_steps"), "{manifest}");

    let mut list = availai();
    list.arg("list")
        .arg(source.path())
        .args(["--name", "cats", "--api-key", "k"])
        .arg("--registry-root")
        .arg(root.path());
    list.assert().success().stdout("cats:v0\ncats:v1\n");
}

#[test]
fn log_table_prints_label() {
    let target = tempfile::tempdir().expect("target");
    let root = tempfile::tempdir().expect("registry root");

    let mut cmd = availai();
    cmd.arg("log-table")
        .arg(target.path().join("players"))
        .args(["--api-key", "k"])
        .arg("--registry-root")
        .arg(root.path());
    cmd.assert()
        .success()
        .stdout("Football player dataset\n");
}

#[test]
fn roboflow_requires_workspace_value() {
    let target = tempfile::tempdir().expect("target");

    let mut cmd = availai();
    cmd.arg("roboflow")
        .arg(target.path().join("players"))
        .args(["--format", "yolov8", "--workspace", "", "--roboflow-api-key", "k"]);
    cmd.assert()
        .failure()
        .stderr(predicates::str::contains("workspace is required"));
}

#[test]
fn config_file_sets_registry_root() {
    let source = tempfile::tempdir().expect("source");
    let root = tempfile::tempdir().expect("registry root");
    write_sample_dataset(source.path());
    let config_path = root.path().join("availai.yaml");
    std::fs::write(
        &config_path,
        format!("registry:\n  root: {}\n", root.path().join("store").display()),
    )
    .expect("write config");

    let mut cmd = availai();
    cmd.arg("upload")
        .arg(source.path())
        .args(["--name", "cats", "--api-key", "k"])
        .arg("--config")
        .arg(&config_path);
    cmd.assert().success();

    assert!(root
        .path()
        .join("store/cats/artifacts/cats/v0/manifest.json")
        .is_file());
}

#[test]
fn upload_from_inside_dataset_skips_default_registry() {
    let source = tempfile::tempdir().expect("source");
    write_sample_dataset(source.path());

    for expected in ["cats:v0\n", "cats:v1\n"] {
        let mut cmd = availai();
        cmd.current_dir(source.path())
            .args(["upload", ".", "--name", "cats", "--api-key", "k"]);
        cmd.assert().success().stdout(expected);
    }

    let manifest = std::fs::read_to_string(
        source
            .path()
            .join("availai-registry/cats/artifacts/cats/v1/manifest.json"),
    )
    .expect("manifest");
    assert!(!manifest.contains("availai-registry"), "{manifest}");
    assert!(!manifest.contains("run.json"), "{manifest}");
}
