//! Integration tests for the conductor CLI
//!
//! These tests drive the binary end to end with a shell script standing in
//! for the model.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Helper to create a conductor Command
fn conductor() -> Command {
    cargo_bin_cmd!("conductor")
}

/// Helper to create a temporary project directory
fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

/// Helper to write `.conductor/conductor.toml`
fn write_config(dir: &TempDir, content: &str) {
    let conductor_dir = dir.path().join(".conductor");
    fs::create_dir_all(&conductor_dir).unwrap();
    fs::write(conductor_dir.join("conductor.toml"), content).unwrap();
}

/// Helper to install a fake model that answers by `CONDUCTOR_TARGET`
fn install_fake_llm(dir: &TempDir, script: &str) {
    let path = dir.path().join("fake-llm.sh");
    fs::write(&path, script).unwrap();
    write_config(
        dir,
        &format!(
            "[project]\nllm_cmd = \"sh {}\"\n\n[commit]\nenabled = false\n",
            path.display()
        ),
    );
}

const HAPPY_LLM: &str = r#"cat > /dev/null
case "$CONDUCTOR_TARGET" in
  plan) echo '{"summary": "one page", "files": [{"path": "index.html", "description": "landing page"}]}' ;;
  audit) echo '{"verdict": "pass", "findings": [], "summary": "ok"}' ;;
  *) echo "<h1>$CONDUCTOR_TARGET</h1>" ;;
esac
"#;

fn write_plugin(dir: &Path, name: &str, manifest: &str) {
    let plugin_dir = dir.join(".conductor").join("plugins").join(name);
    fs::create_dir_all(&plugin_dir).unwrap();
    fs::write(plugin_dir.join("plugin.toml"), manifest).unwrap();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_conductor_help() {
        conductor()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("run"))
            .stdout(predicate::str::contains("recover"));
    }

    #[test]
    fn test_conductor_version() {
        conductor().arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_command_fails() {
        conductor().arg("deploy").assert().failure();
    }

    #[test]
    fn test_run_requires_task() {
        conductor().arg("run").assert().failure();
    }
}

// =============================================================================
// Configuration Tests
// =============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_config_init_creates_file() {
        let dir = create_temp_project();

        conductor()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created conductor.toml"));

        let content = fs::read_to_string(dir.path().join(".conductor/conductor.toml")).unwrap();
        assert!(content.contains("[defaults]"));
    }

    #[test]
    fn test_config_init_does_not_overwrite() {
        let dir = create_temp_project();
        write_config(&dir, "[defaults]\nmax_retries = 7\n");

        conductor()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));

        let content = fs::read_to_string(dir.path().join(".conductor/conductor.toml")).unwrap();
        assert!(content.contains("max_retries = 7"));
    }

    #[test]
    fn test_config_show_defaults() {
        let dir = create_temp_project();

        conductor()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Showing defaults"))
            .stdout(predicate::str::contains("max_concurrency = 4"));
    }

    #[test]
    fn test_config_show_reads_file() {
        let dir = create_temp_project();
        write_config(&dir, "[defaults]\nmax_concurrency = 9\n");

        conductor()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_concurrency = 9"));
    }

    #[test]
    fn test_config_validate_without_file() {
        let dir = create_temp_project();

        conductor()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Using defaults"));
    }

    #[test]
    fn test_config_validate_reports_unknown_phase() {
        let dir = create_temp_project();
        write_config(&dir, "[phases.deploy]\nmax_retries = 1\n");

        conductor()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Unknown phase 'deploy'"));
    }

    #[test]
    fn test_config_validate_rejects_malformed_toml() {
        let dir = create_temp_project();
        write_config(&dir, "[defaults\nmax_retries = ");

        conductor()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Plugin Tests
// =============================================================================

mod plugins {
    use super::*;

    #[test]
    fn test_plugins_list_empty() {
        let dir = create_temp_project();

        conductor()
            .current_dir(dir.path())
            .args(["plugins", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No plugins loaded"));
    }

    #[test]
    fn test_plugins_list_shows_hooks() {
        let dir = create_temp_project();
        write_plugin(
            dir.path(),
            "notify",
            "name = \"notify\"\nversion = \"1.2.0\"\n\n[hooks]\nsession_end = \"true\"\n",
        );

        conductor()
            .current_dir(dir.path())
            .args(["plugins", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("notify"))
            .stdout(predicate::str::contains("v1.2.0"))
            .stdout(predicate::str::contains("session_end"));
    }

    #[test]
    fn test_plugins_validate_clean() {
        let dir = create_temp_project();
        write_plugin(
            dir.path(),
            "notify",
            "name = \"notify\"\n\n[hooks]\nafter_phase = \"true\"\n",
        );

        conductor()
            .current_dir(dir.path())
            .args(["plugins", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("All plugins are valid"));
    }

    #[test]
    fn test_plugins_validate_reports_bad_manifest() {
        let dir = create_temp_project();
        write_plugin(
            dir.path(),
            "broken",
            "name = \"broken\"\n\n[hooks]\non_deploy = \"true\"\n",
        );

        conductor()
            .current_dir(dir.path())
            .args(["plugins", "validate"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("broken"));
    }

    #[test]
    fn test_plugins_validate_reports_missing_dependency() {
        let dir = create_temp_project();
        write_plugin(
            dir.path(),
            "lint",
            "name = \"lint\"\ndependencies = [\"formatter\"]\n\n[hooks]\nafter_phase = \"true\"\n",
        );

        conductor()
            .current_dir(dir.path())
            .args(["plugins", "validate"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Run Tests
// =============================================================================

mod run {
    use super::*;

    #[test]
    fn test_run_completes_with_fake_llm() {
        let dir = create_temp_project();
        install_fake_llm(&dir, HAPPY_LLM);

        conductor()
            .current_dir(dir.path())
            .args(["run", "build a landing page"])
            .assert()
            .success()
            .stdout(predicate::str::contains("completed"))
            .stdout(predicate::str::contains("index.html"));

        let page = fs::read_to_string(dir.path().join("index.html")).unwrap();
        assert_eq!(page, "<h1>index.html</h1>\n");

        // A completed session leaves no recovery point behind
        conductor()
            .current_dir(dir.path())
            .arg("sessions")
            .assert()
            .success()
            .stdout(predicate::str::contains("No sessions"));
    }

    #[test]
    fn test_run_reads_task_from_stdin() {
        let dir = create_temp_project();
        install_fake_llm(&dir, HAPPY_LLM);

        conductor()
            .current_dir(dir.path())
            .args(["run", "-"])
            .write_stdin("build a landing page\n")
            .assert()
            .success();

        assert!(dir.path().join("index.html").exists());
    }

    #[test]
    fn test_run_failure_keeps_recovery_point() {
        let dir = create_temp_project();
        install_fake_llm(&dir, "cat > /dev/null\necho 'model unavailable' >&2\nexit 1\n");

        conductor()
            .current_dir(dir.path())
            .args(["run", "build a landing page", "--max-retries", "0"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("failed"));

        conductor()
            .current_dir(dir.path())
            .arg("sessions")
            .assert()
            .success()
            .stdout(predicate::str::contains("failed"))
            .stdout(predicate::str::contains("build a landing page"));

        // Terminal sessions are not interrupted
        conductor()
            .current_dir(dir.path())
            .arg("recover")
            .assert()
            .success()
            .stdout(predicate::str::contains("No interrupted sessions"));
    }

    #[test]
    fn test_run_invokes_command_plugins() {
        let dir = create_temp_project();
        install_fake_llm(&dir, HAPPY_LLM);
        write_plugin(
            dir.path(),
            "journal",
            "name = \"journal\"\n\n[hooks]\nsession_start = \"echo $CONDUCTOR_EVENT >> events.log\"\nsession_end = \"echo $CONDUCTOR_EVENT >> events.log\"\n",
        );

        conductor()
            .current_dir(dir.path())
            .args(["run", "build a landing page"])
            .assert()
            .success();

        let log = fs::read_to_string(
            dir.path()
                .join(".conductor/plugins/journal/events.log"),
        )
        .unwrap();
        assert_eq!(log, "session_start\nsession_end\n");
    }

    #[test]
    fn test_run_rejects_bad_metadata() {
        let dir = create_temp_project();
        install_fake_llm(&dir, HAPPY_LLM);

        conductor()
            .current_dir(dir.path())
            .args(["run", "task", "--meta", "novalue"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("KEY=VALUE"));
    }
}

// =============================================================================
// Recovery Tests
// =============================================================================

mod recovery {
    use super::*;

    #[test]
    fn test_recover_with_nothing_to_recover() {
        let dir = create_temp_project();

        conductor()
            .current_dir(dir.path())
            .arg("recover")
            .assert()
            .success()
            .stdout(predicate::str::contains("No interrupted sessions"));
    }

    #[test]
    fn test_sessions_empty() {
        let dir = create_temp_project();

        conductor()
            .current_dir(dir.path())
            .arg("sessions")
            .assert()
            .success()
            .stdout(predicate::str::contains("No sessions with recovery points"));
    }

    #[test]
    fn test_recover_unknown_session_reports_nothing() {
        let dir = create_temp_project();

        conductor()
            .current_dir(dir.path())
            .args(["recover", "--session", "does-not-exist"])
            .assert()
            .success()
            .stdout(predicate::str::contains("nothing to recover"));
    }
}

// =============================================================================
// Global Flags Tests
// =============================================================================

mod global_flags {
    use super::*;

    #[test]
    fn test_project_dir_flag() {
        let dir = create_temp_project();

        conductor()
            .args(["--project-dir", dir.path().to_str().unwrap(), "config", "init"])
            .assert()
            .success();

        assert!(dir.path().join(".conductor/conductor.toml").exists());
    }

    #[test]
    fn test_verbose_and_json_logs_flags() {
        let dir = create_temp_project();

        conductor()
            .current_dir(dir.path())
            .args(["--verbose", "--json-logs", "sessions"])
            .assert()
            .success();
    }
}
