use std::path::Path;
use std::process::{Command, Output};

fn ace15(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ace15"))
        .arg("--root")
        .arg(root)
        .args(args)
        .env_remove("ACE15_ROOT")
        .output()
        .expect("run ace15")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn cli_paths_follow_root() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = ace15(dir.path(), &["paths"]);
    assert!(output.status.success());

    let text = stdout(&output);
    assert!(text.contains("ace_step_15_ui.settings.json"));
    assert!(text.contains("ace_step_15_ui.queue.json"));
    assert!(text.contains("ACE-Step-1.5"));
    assert!(text.contains("missing:"));
}

#[test]
fn cli_preset_lifecycle() {
    let dir = tempfile::tempdir().expect("tempdir");

    let listed = stdout(&ace15(dir.path(), &["preset", "list"]));
    assert!(listed.contains("EDM / Deep House"));
    assert!(listed.contains("Reggae / Roots Reggae"));

    let added = ace15(
        dir.path(),
        &["preset", "add", "Jazz", "Bebop", "--json", r#"{"caption": "fast bebop", "bpm": 220}"#],
    );
    assert!(added.status.success());

    let shown = stdout(&ace15(dir.path(), &["preset", "show", "Jazz", "Bebop"]));
    assert!(shown.contains("fast bebop"));

    let edited = ace15(
        dir.path(),
        &["preset", "edit", "Jazz", "Bebop", "--new-subgenre", "Hard Bop"],
    );
    assert!(edited.status.success());
    let listed = stdout(&ace15(dir.path(), &["preset", "list", "Jazz"]));
    assert_eq!(listed.trim(), "Jazz / Hard Bop");

    let removed = ace15(
        dir.path(),
        &["preset", "remove", "Jazz", "Hard Bop", "--drop-empty-genre"],
    );
    assert!(removed.status.success());
    assert!(!stdout(&ace15(dir.path(), &["preset", "list"])).contains("Jazz"));

    let bad = ace15(dir.path(), &["preset", "add", "Jazz", "Bad", "--json", "[1, 2]"]);
    assert!(!bad.status.success());
}

#[test]
fn cli_preset_apply_updates_settings() {
    let dir = tempfile::tempdir().expect("tempdir");
    let applied = ace15(dir.path(), &["preset", "apply", "Rock", "Alt Rock"]);
    assert!(applied.status.success());

    let shown = stdout(&ace15(dir.path(), &["settings", "show"]));
    assert!(shown.contains("Energetic alternative rock"));
    assert!(shown.contains("\"subgenre\": \"Alt Rock\""));
}

#[test]
fn cli_settings_set_persists() {
    let dir = tempfile::tempdir().expect("tempdir");
    assert!(ace15(dir.path(), &["settings", "set", "duration", "120"]).status.success());
    assert!(ace15(dir.path(), &["settings", "set", "backend", "pt"]).status.success());

    let shown = stdout(&ace15(dir.path(), &["settings", "show"]));
    assert!(shown.contains("\"duration\": 120.0"));
    assert!(shown.contains("\"backend\": \"pt\""));

    let unknown = ace15(dir.path(), &["settings", "set", "no_such_field", "1"]);
    assert!(!unknown.status.success());
}

#[test]
fn cli_queue_refuses_jobs_without_install() {
    let dir = tempfile::tempdir().expect("tempdir");
    assert!(stdout(&ace15(dir.path(), &["queue", "list"])).contains("Queue is empty"));

    let added = ace15(dir.path(), &["queue", "add", "--caption", "lofi beat"]);
    assert!(!added.status.success());
    assert!(String::from_utf8_lossy(&added.stderr).contains("env python"));

    assert!(stdout(&ace15(dir.path(), &["queue", "list"])).contains("Queue is empty"));
}

#[test]
fn cli_launch_without_script_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = ace15(dir.path(), &["launch"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("ace_step_15.py"));
}

#[test]
fn cli_lyrics_generate_and_clear() {
    let dir = tempfile::tempdir().expect("tempdir");
    assert!(ace15(dir.path(), &["preset", "apply", "Rock", "Alt Rock"]).status.success());

    let generated = ace15(dir.path(), &["lyrics", "generate"]);
    assert!(generated.status.success());
    let text = stdout(&generated);
    assert!(text.contains("[Verse 1]"));
    assert!(text.contains("[Final Chorus]"));
    assert!(stdout(&ace15(dir.path(), &["settings", "show"])).contains("[Verse 1]"));

    assert!(ace15(dir.path(), &["lyrics", "clear"]).status.success());
    let shown = stdout(&ace15(dir.path(), &["settings", "show"]));
    assert!(shown.contains("\"lyrics\": \"\""));
    assert!(!shown.contains("[Verse 1]"));
}
