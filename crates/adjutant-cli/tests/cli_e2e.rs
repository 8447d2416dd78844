use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::tempdir;

fn adjutant() -> Command {
    let mut cmd = Command::cargo_bin("adjutant").expect("binary");
    // Keep the ambient environment out of the tests.
    cmd.env_remove("VAULT_PATH")
        .env_remove("AGENT_MODE")
        .env_remove("DRY_RUN")
        .env_remove("GIT_VAULT_BRANCH")
        .env_remove("ADJUTANT_REASONER");
    cmd
}

/// Point the watcher's sidecar inside the test sandbox.
fn write_config(vault: &Path, sidecar: &Path) {
    fs::write(
        vault.join(".adjutant.toml"),
        format!("[watch]\nsidecar_dir = \"{}\"\n", sidecar.display()),
    )
    .expect("write config");
}

fn approved_email(vault: &Path, stem: &str) {
    fs::write(
        vault.join("Approved").join(format!("{stem}.md")),
        "---\ntype: email\naction: send_email\npriority: P1\nstatus: approved\ncreated: 2025-01-02T03:04:05Z\nto: bob@example.com\n---\nReply body.\n",
    )
    .expect("write note");
}

#[test]
fn help_lists_every_component() {
    adjutant()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("init"))
        .stdout(contains("run"))
        .stdout(contains("watch"))
        .stdout(contains("sync"))
        .stdout(contains("merge-signals"))
        .stdout(contains("doctor"));
}

#[test]
fn missing_vault_is_a_configuration_error() {
    adjutant().arg("status").assert().code(2);
}

#[test]
fn nonexistent_vault_root_is_a_configuration_error() {
    adjutant()
        .args(["status", "--vault", "/definitely/not/a/vault"])
        .assert()
        .code(2);
}

#[test]
fn init_builds_the_layout() {
    let td = tempdir().expect("tempdir");
    let vault = td.path().join("vault");

    adjutant()
        .args(["init", "--vault"])
        .arg(&vault)
        .assert()
        .success()
        .stdout(contains("initialized vault"));

    for dir in [
        "Inbox",
        "Needs_Action",
        "In_Progress/local",
        "In_Progress/cloud",
        "Pending_Approval",
        "Approved",
        "Rejected",
        "Done",
        "Logs",
        "Signals",
    ] {
        assert!(vault.join(dir).is_dir(), "missing {dir}");
    }
    assert!(vault.join("Dashboard.md").exists());
    assert!(vault.join(".adjutant.toml").exists());
    assert!(vault.join(".gitignore").exists());
}

#[test]
fn status_reports_queue_depths() {
    let td = tempdir().expect("tempdir");
    let vault = td.path().join("vault");
    adjutant().args(["init", "--vault"]).arg(&vault).assert().success();
    approved_email(&vault, "EMAIL_reply_20250102030405");

    adjutant()
        .args(["status", "--vault"])
        .arg(&vault)
        .assert()
        .success()
        .stdout(contains("1  Approved"))
        .stdout(contains("0  Done"));
}

#[test]
fn run_once_dispatches_an_approved_email() {
    let td = tempdir().expect("tempdir");
    let vault = td.path().join("vault");
    adjutant().args(["init", "--vault"]).arg(&vault).assert().success();
    approved_email(&vault, "EMAIL_reply_20250102030405");

    adjutant()
        .args(["run", "--once", "--vault"])
        .arg(&vault)
        .assert()
        .success()
        .stdout(contains("1 sent"));

    assert!(vault.join("Done/EMAIL_reply_20250102030405.md").exists());
    assert!(!vault.join("Approved/EMAIL_reply_20250102030405.md").exists());

    // Exactly one day file, containing the dispatch record.
    let logs: Vec<_> = fs::read_dir(vault.join("Logs"))
        .expect("logs")
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == "jsonl"))
        .collect();
    assert_eq!(logs.len(), 1);
    let text = fs::read_to_string(logs[0].path()).expect("read log");
    assert!(text.contains("\"event_type\":\"dispatch\""));
    assert!(text.contains("\"result\":\"sent\""));
}

#[test]
fn send_now_on_a_done_file_is_a_noop() {
    let td = tempdir().expect("tempdir");
    let vault = td.path().join("vault");
    adjutant().args(["init", "--vault"]).arg(&vault).assert().success();
    fs::write(
        vault.join("Done/EMAIL_reply_20250102030405.md"),
        "---\ntype: email\naction: send_email\npriority: P1\nstatus: done\ncreated: 2025-01-02T03:04:05Z\n---\nSent already.\n",
    )
    .expect("write");

    adjutant()
        .args(["run", "--vault"])
        .arg(&vault)
        .args(["--send-now", "EMAIL_reply_20250102030405.md"])
        .assert()
        .success()
        .stdout(contains("nothing to do"));
}

#[test]
fn over_threshold_invoice_is_rejected_by_the_policy_gate() {
    let td = tempdir().expect("tempdir");
    let vault = td.path().join("vault");
    adjutant().args(["init", "--vault"]).arg(&vault).assert().success();
    fs::write(
        vault.join("Approved/ODOO_invoice_20250102030405.md"),
        "---\ntype: invoice\naction: create_invoice\npriority: P2\nstatus: approved\ncreated: 2025-01-02T03:04:05Z\namount: 1500\ncurrency: USD\n---\nInvoice.\n",
    )
    .expect("write");

    adjutant()
        .args(["run", "--once", "--vault"])
        .arg(&vault)
        .assert()
        .success()
        .stdout(contains("1 rejected"));

    assert!(vault.join("Rejected/ODOO_invoice_20250102030405.md").exists());
    assert!(
        vault
            .join("Rejected/ODOO_invoice_20250102030405_error.md")
            .exists()
    );
}

#[test]
fn watch_once_turns_a_file_drop_into_an_action_note() {
    let td = tempdir().expect("tempdir");
    let vault = td.path().join("vault");
    adjutant().args(["init", "--vault"]).arg(&vault).assert().success();
    write_config(&vault, &td.path().join("state"));
    fs::write(vault.join("Inbox/note.txt"), "hello").expect("drop");

    adjutant()
        .args(["watch", "--once", "--vault"])
        .arg(&vault)
        .assert()
        .success()
        .stdout(contains("1 emitted"));

    let pending: Vec<String> = fs::read_dir(vault.join("Needs_Action"))
        .expect("read")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| !n.starts_with('.'))
        .collect();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].starts_with("FILE_note_"), "got {pending:?}");

    let note = fs::read_to_string(vault.join("Needs_Action").join(&pending[0])).expect("read");
    assert!(note.contains("type: file_drop"));
    assert!(note.contains("priority: P3"));

    // The dropped file is never deleted.
    assert!(vault.join("Inbox/note.txt").exists());

    // Dedup: a second pass emits nothing new.
    adjutant()
        .args(["watch", "--once", "--vault"])
        .arg(&vault)
        .assert()
        .success()
        .stdout(contains("1 duplicate"));
}

#[test]
fn watch_dry_run_logs_without_writing() {
    let td = tempdir().expect("tempdir");
    let vault = td.path().join("vault");
    adjutant().args(["init", "--vault"]).arg(&vault).assert().success();
    write_config(&vault, &td.path().join("state"));
    fs::write(vault.join("Inbox/note.txt"), "hello").expect("drop");

    adjutant()
        .args(["watch", "--once", "--dry-run", "--vault"])
        .arg(&vault)
        .assert()
        .success();

    let pending: Vec<_> = fs::read_dir(vault.join("Needs_Action"))
        .expect("read")
        .filter_map(|e| e.ok())
        .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .collect();
    assert!(pending.is_empty(), "dry-run must not write notes");
}

#[test]
fn merge_signals_updates_the_dashboard_region() {
    let td = tempdir().expect("tempdir");
    let vault = td.path().join("vault");
    adjutant().args(["init", "--vault"]).arg(&vault).assert().success();

    adjutant()
        .args(["merge-signals", "--vault"])
        .arg(&vault)
        .assert()
        .success();

    let dashboard = fs::read_to_string(vault.join("Dashboard.md")).expect("read");
    assert!(dashboard.contains("# Dashboard"), "template prose survives");
    assert!(dashboard.contains("Peer activity as of"));
    assert!(dashboard.contains("Stage summary as of"));
}

#[test]
fn doctor_reports_layout_and_env() {
    let td = tempdir().expect("tempdir");
    let vault = td.path().join("vault");
    adjutant().args(["init", "--vault"]).arg(&vault).assert().success();

    adjutant()
        .args(["doctor", "--vault"])
        .arg(&vault)
        .assert()
        .success()
        .stdout(contains("layout: complete"))
        .stdout(contains("log dir writable: true"))
        .stdout(contains("env VAULT_PATH: unset"));
}

#[test]
fn vault_path_env_var_selects_the_vault() {
    let td = tempdir().expect("tempdir");
    let vault = td.path().join("vault");
    adjutant().args(["init", "--vault"]).arg(&vault).assert().success();

    adjutant()
        .arg("status")
        .env("VAULT_PATH", &vault)
        .assert()
        .success()
        .stdout(contains("Approved"));
}

#[test]
fn completions_generate_for_bash() {
    adjutant()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(contains("adjutant"));
}
