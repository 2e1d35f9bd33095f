//! Integration tests for the certgen commands

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command as AssertCommand;
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Test Helpers
// =============================================================================

/// Isolated working directory with its own config file
struct TestEnv {
    temp_dir: TempDir,
    config_path: PathBuf,
}

impl TestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        Self {
            temp_dir,
            config_path,
        }
    }

    fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Write a file into the working directory and return its path
    fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    /// Run certgen inside this env with its config
    fn certgen(&self) -> AssertCommand {
        let mut cmd = AssertCommand::cargo_bin("certgen").unwrap();
        cmd.current_dir(self.path())
            .env_remove("RUST_LOG")
            .args(["--config", self.config_path.to_str().unwrap()]);
        cmd
    }
}

// =============================================================================
// list
// =============================================================================

#[test]
fn test_list_text_file_normalizes_and_flags() {
    let env = TestEnv::new();
    let list = env.write(
        "users.txt",
        "zoë  smith zoe@x.com\nAmy amy@x.com\nzoe smith other@x.com\nNo Mail\n",
    );

    env.certgen()
        .args(["list", list.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("AMY"))
        .stdout(predicate::str::contains("ZOE SMITH"))
        .stdout(predicate::str::contains("E0"))
        .stdout(predicate::str::contains("3 record(s), 2 flagged"));
}

#[test]
fn test_list_email_check_flags_shared_addresses() {
    let env = TestEnv::new();
    let list = env.write("users.txt", "Ann shared@x.com\nBob shared@x.com\nCid cid@x.com\n");

    env.certgen()
        .args(["list", list.to_str().unwrap(), "--check", "email"])
        .assert()
        .success()
        .stdout(predicate::str::contains("N0"))
        .stdout(predicate::str::contains("3 record(s), 2 flagged"));
}

#[test]
fn test_list_csv_with_name_and_email_columns() {
    let env = TestEnv::new();
    let list = env.write(
        "users.csv",
        "Name,Email,Score\nJane Doe,jane@x.com,10\nJohn Roe,john@x.com,7\n",
    );

    env.certgen()
        .args(["list", list.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("JANE DOE"))
        .stdout(predicate::str::contains("john@x.com"))
        .stdout(predicate::str::contains("2 record(s), 0 flagged"));
}

#[test]
fn test_list_csv_without_columns_fails() {
    let env = TestEnv::new();
    let list = env.write("users.csv", "First,Last\nJane,Doe\n");

    env.certgen()
        .args(["list", list.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("users.csv"));
}

#[test]
fn test_list_missing_file_is_empty() {
    let env = TestEnv::new();

    env.certgen()
        .args(["list", "does-not-exist.txt"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No records."));
}

#[test]
fn test_list_writes_listing_file() {
    let env = TestEnv::new();
    let list = env.write("users.txt", "Amy amy@x.com\nAmy amy2@x.com\n");
    let listing = env.path().join("listing.txt");

    env.certgen()
        .args([
            "list",
            list.to_str().unwrap(),
            "--listing",
            listing.to_str().unwrap(),
        ])
        .assert()
        .success();

    let content = fs::read_to_string(&listing).unwrap();
    assert!(content.contains("E0 | AMY amy@x.com"), "{content}");
    assert!(content.contains("E0 | AMY amy2@x.com"), "{content}");
}

#[test]
fn test_list_remembers_userlist_in_config() {
    let env = TestEnv::new();
    let list = env.write("users.txt", "Amy amy@x.com\n");

    env.certgen()
        .args(["list", list.to_str().unwrap(), "--check", "email"])
        .assert()
        .success();

    let config = fs::read_to_string(&env.config_path).unwrap();
    assert!(config.contains("users.txt"), "{config}");
    assert!(config.contains("duplicate_check = \"email\""), "{config}");

    // Without a path the remembered list is used
    env.certgen()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("AMY"));
}

#[test]
fn test_list_without_any_path_fails() {
    let env = TestEnv::new();

    env.certgen()
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no user list configured"));
}

// =============================================================================
// render
// =============================================================================

#[test]
fn test_render_requires_template() {
    let env = TestEnv::new();

    env.certgen()
        .args(["render", "--test-mode"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no template image configured"));
}

#[test]
fn test_render_fails_on_missing_font() {
    let env = TestEnv::new();

    env.certgen()
        .args([
            "render",
            "--test-mode",
            "--template",
            "template.png",
            "--font",
            "NoSuchFont",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("font `NoSuchFont` not found"));
}

/// Path to the bundled test font
fn fixture_font() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/DejaVuSans.ttf")
}

/// Write a plain white template image into the env
fn write_template(env: &TestEnv) -> PathBuf {
    let path = env.path().join("template.png");
    image::RgbaImage::from_pixel(600, 200, image::Rgba([255, 255, 255, 255]))
        .save(&path)
        .unwrap();
    path
}

/// Sorted file names inside a directory
fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

#[test]
fn test_render_writes_one_certificate_per_recipient() {
    let env = TestEnv::new();
    let template = write_template(&env);
    let list = env.write(
        "users.txt",
        "Jane Doe jane@x.com\nMary-Ann Smith mary@x.com\nLi Wei li@x.com\n",
    );

    env.certgen()
        .args([
            "render",
            "--template",
            template.to_str().unwrap(),
            "--userlist",
            list.to_str().unwrap(),
            "--font",
            fixture_font().to_str().unwrap(),
            "--font-size",
            "40",
            "--x",
            "300",
            "--y",
            "120",
            "--output",
            "out",
            "--jobs",
            "2",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Rendered 3 certificate(s)"));

    assert_eq!(
        file_names(&env.path().join("out")),
        vec!["JANE_DOE.png", "LI_WEI.png", "MARY_ANN_SMITH.png"]
    );

    let image = image::open(env.path().join("out/JANE_DOE.png"))
        .unwrap()
        .to_rgba8();
    assert_eq!(image.dimensions(), (600, 200));
    assert!(image.pixels().any(|p| p.0[..3] != [255, 255, 255]));
}

#[test]
fn test_render_test_mode_writes_sample() {
    let env = TestEnv::new();
    let template = write_template(&env);

    env.certgen()
        .args([
            "render",
            "--test-mode",
            "--template",
            template.to_str().unwrap(),
            "--font",
            fixture_font().to_str().unwrap(),
            "--output",
            "out",
        ])
        .assert()
        .success();

    assert_eq!(file_names(&env.path().join("out")), vec!["Name_Surname.png"]);
}

#[test]
fn test_render_rejects_compression_out_of_range() {
    let env = TestEnv::new();

    env.certgen()
        .args(["render", "--compress", "12"])
        .assert()
        .failure();
}

#[test]
fn test_invalid_config_file_fails() {
    let env = TestEnv::new();
    fs::write(&env.config_path, "[certificate\nfont = ").unwrap();

    env.certgen().arg("list").assert().failure();
}

// =============================================================================
// send
// =============================================================================

#[test]
fn test_send_rejects_invalid_sender() {
    let env = TestEnv::new();

    env.certgen()
        .args(["send", "--sender", "not-an-address"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not valid"));
}

#[test]
fn test_send_refuses_without_certificates() {
    let env = TestEnv::new();
    let list = env.write("users.txt", "Amy amy@x.com\n");

    env.certgen()
        .args([
            "send",
            "--sender",
            "me@example.com",
            "--userlist",
            list.to_str().unwrap(),
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no certificates"));
}

#[test]
fn test_send_body_file_is_saved() {
    let env = TestEnv::new();
    let body = env.write("body.html", "<p>Congratulations</p>");

    env.certgen()
        .args([
            "send",
            "--sender",
            "me@example.com",
            "--subject",
            "Well done",
            "--body-file",
            body.to_str().unwrap(),
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no certificates"));

    let config = fs::read_to_string(&env.config_path).unwrap();
    assert!(config.contains("Well done"), "{config}");
    assert!(config.contains("Congratulations"), "{config}");
    assert!(config.contains("me@example.com"), "{config}");
}
