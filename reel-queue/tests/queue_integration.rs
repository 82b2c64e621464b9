//! Integration tests for reel-queue commands

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to escape path for TOML on Windows
fn escape_path_for_toml(path: &str) -> String {
    path.replace('\\', "\\\\")
}

/// Helper to create a test environment with config and database path
fn setup_test_env() -> (TempDir, String) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    let db_path = temp_dir.path().join("reelcast.db");

    let config_content = format!(
        r#"
[database]
path = "{}"
"#,
        escape_path_for_toml(&db_path.to_string_lossy())
    );
    fs::write(&config_path, config_content).unwrap();

    (temp_dir, config_path.to_string_lossy().to_string())
}

fn reel_queue(config_path: &str, user: &str) -> Command {
    let mut cmd = Command::cargo_bin("reel-queue").unwrap();
    cmd.env("REELCAST_CONFIG", config_path)
        .env("REELCAST_USER", user)
        .env_remove("REELCAST_DB_PATH")
        .env_remove("REELCAST_ENV");
    cmd
}

/// Create a draft and return its ID
fn draft(config_path: &str, platforms: &[&str]) -> String {
    let mut cmd = reel_queue(config_path, "alice");
    cmd.arg("draft")
        .arg("--video-url")
        .arg("https://cdn.example.com/clip.mp4");
    for platform in platforms {
        cmd.arg("--platform").arg(platform);
    }
    let output = cmd.output().unwrap();
    assert!(output.status.success(), "draft failed: {:?}", output);
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

fn show_json(config_path: &str, post_id: &str) -> serde_json::Value {
    let output = reel_queue(config_path, "alice")
        .args(["show", post_id, "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    serde_json::from_slice(&output.stdout).unwrap()
}

// DRAFT & CAPTION

#[test]
fn test_draft_then_caption_then_show() {
    let (_temp_dir, config_path) = setup_test_env();
    let post_id = draft(&config_path, &["instagram", "tiktok"]);

    reel_queue(&config_path, "alice")
        .args(["caption", &post_id, "tiktok", "Behind the scenes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Caption set for tiktok"));

    let shown = show_json(&config_path, &post_id);
    assert_eq!(shown["post"]["status"], "draft");
    let subs = shown["platform_posts"].as_array().unwrap();
    assert_eq!(subs.len(), 2);
    let tiktok = subs.iter().find(|s| s["platform"] == "tiktok").unwrap();
    assert_eq!(tiktok["caption_final"], "Behind the scenes");
    assert_eq!(tiktok["status"], "draft");
}

#[test]
fn test_caption_over_limit_is_invalid_input() {
    let (_temp_dir, config_path) = setup_test_env();
    let post_id = draft(&config_path, &["tiktok"]);

    reel_queue(&config_path, "alice")
        .args(["caption", &post_id, "tiktok", &"x".repeat(2201)])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("Caption exceeds 2200 characters"));
}

#[test]
fn test_draft_rejects_duplicate_platforms() {
    let (_temp_dir, config_path) = setup_test_env();

    reel_queue(&config_path, "alice")
        .args(["draft", "--platform", "instagram", "--platform", "instagram"])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("Duplicate platform: instagram"));
}

#[test]
fn test_unknown_platform_is_usage_error() {
    let (_temp_dir, config_path) = setup_test_env();

    reel_queue(&config_path, "alice")
        .args(["draft", "--platform", "myspace"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown platform 'myspace'"));
}

#[test]
fn test_missing_user_is_invalid_input() {
    let (_temp_dir, config_path) = setup_test_env();

    Command::cargo_bin("reel-queue")
        .unwrap()
        .env("REELCAST_CONFIG", &config_path)
        .env_remove("REELCAST_USER")
        .arg("list")
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("No user given"));
}

// SCHEDULE, LIST & CANCEL

#[test]
fn test_schedule_appears_in_list() {
    let (_temp_dir, config_path) = setup_test_env();
    let post_id = draft(&config_path, &["facebook"]);

    reel_queue(&config_path, "alice")
        .args(["schedule", &post_id, "90m", "--timezone", "Europe/Berlin"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("Scheduled {}", post_id)));

    reel_queue(&config_path, "alice")
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains(&post_id))
        .stdout(predicate::str::contains("facebook:scheduled"))
        .stdout(predicate::str::contains("in 1 hour"));

    let shown = show_json(&config_path, &post_id);
    assert_eq!(shown["post"]["status"], "scheduled");
    assert_eq!(shown["post"]["timezone"], "Europe/Berlin");
}

#[test]
fn test_list_is_scoped_to_user_and_platform() {
    let (_temp_dir, config_path) = setup_test_env();
    let instagram = draft(&config_path, &["instagram"]);
    let tiktok = draft(&config_path, &["tiktok"]);
    for post_id in [&instagram, &tiktok] {
        reel_queue(&config_path, "alice")
            .args(["schedule", post_id, "1d"])
            .assert()
            .success();
    }

    let output = reel_queue(&config_path, "alice")
        .args(["list", "--format", "json", "--platform", "tiktok"])
        .output()
        .unwrap();
    let entries: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let entries = entries.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["post"]["id"], tiktok.as_str());

    reel_queue(&config_path, "bob")
        .args(["list", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::diff("[]\n"));
}

#[test]
fn test_schedule_in_past_is_rejected() {
    let (_temp_dir, config_path) = setup_test_env();
    let post_id = draft(&config_path, &["instagram"]);

    reel_queue(&config_path, "alice")
        .args(["schedule", &post_id, "2020-01-01T00:00:00Z"])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("not in the future"));
}

#[test]
fn test_cancel_removes_from_queue() {
    let (_temp_dir, config_path) = setup_test_env();
    let post_id = draft(&config_path, &["instagram", "facebook"]);
    reel_queue(&config_path, "alice")
        .args(["schedule", &post_id, "3h"])
        .assert()
        .success();

    reel_queue(&config_path, "alice")
        .args(["cancel", &post_id])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("Canceled {}", post_id)));

    let shown = show_json(&config_path, &post_id);
    assert_eq!(shown["post"]["status"], "canceled");
    for sub in shown["platform_posts"].as_array().unwrap() {
        assert_eq!(sub["status"], "canceled");
    }

    reel_queue(&config_path, "alice")
        .args(["cancel", &post_id])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("Cannot cancel a post that is canceled"));
}

#[test]
fn test_other_users_post_is_not_found() {
    let (_temp_dir, config_path) = setup_test_env();
    let post_id = draft(&config_path, &["instagram"]);

    reel_queue(&config_path, "mallory")
        .args(["show", &post_id])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("Not found"));

    reel_queue(&config_path, "mallory")
        .args(["cancel", &post_id])
        .assert()
        .failure()
        .code(3);
}

#[test]
fn test_delete() {
    let (_temp_dir, config_path) = setup_test_env();
    let post_id = draft(&config_path, &["instagram"]);

    reel_queue(&config_path, "alice")
        .args(["delete", &post_id])
        .assert()
        .success();

    reel_queue(&config_path, "alice")
        .args(["show", &post_id])
        .assert()
        .failure()
        .code(3);

    // Deleting again is not an error
    reel_queue(&config_path, "alice")
        .args(["delete", &post_id])
        .assert()
        .success();
}

// NOW & RETRY

#[test]
fn test_now_without_account_reports_failure() {
    let (_temp_dir, config_path) = setup_test_env();
    let post_id = draft(&config_path, &["instagram"]);

    reel_queue(&config_path, "alice")
        .args(["now", &post_id])
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains(
            "instagram: failed - No connected account found",
        ))
        .stdout(predicate::str::contains("is failed"));

    let shown = show_json(&config_path, &post_id);
    assert_eq!(shown["post"]["status"], "failed");
    assert_eq!(
        shown["platform_posts"][0]["last_error"],
        "No connected account found"
    );
}

#[test]
fn test_now_json_report() {
    let (_temp_dir, config_path) = setup_test_env();
    let post_id = draft(&config_path, &["facebook"]);

    let output = reel_queue(&config_path, "alice")
        .args(["now", &post_id, "--format", "json"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["post_id"], post_id.as_str());
    assert_eq!(report["status"], "failed");
    assert_eq!(report["results"][0]["outcome"]["outcome"], "failed");
}

#[test]
fn test_retry_requires_failed_platforms() {
    let (_temp_dir, config_path) = setup_test_env();
    let post_id = draft(&config_path, &["instagram"]);

    reel_queue(&config_path, "alice")
        .args(["retry", &post_id])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("No failed platforms to retry"));
}

#[test]
fn test_retry_after_failure_attempts_again() {
    let (_temp_dir, config_path) = setup_test_env();
    let post_id = draft(&config_path, &["instagram"]);
    reel_queue(&config_path, "alice")
        .args(["now", &post_id])
        .assert()
        .failure();

    reel_queue(&config_path, "alice")
        .args(["retry", &post_id, "--platform", "instagram"])
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("instagram: failed"));

    let shown = show_json(&config_path, &post_id);
    assert_eq!(shown["post"]["status"], "failed");
    assert_eq!(shown["platform_posts"][0]["status"], "failed");
}

#[test]
fn test_draft_rejects_video_type_a_platform_cannot_take() {
    let (_temp_dir, config_path) = setup_test_env();

    reel_queue(&config_path, "alice")
        .args([
            "draft",
            "--video-url",
            "https://cdn.example.com/clip.webm",
            "--mime-type",
            "video/webm",
            "--platform",
            "tiktok",
            "--platform",
            "instagram",
        ])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("Instagram does not accept video/webm"));
}

#[test]
fn test_caption_with_too_many_hashtags() {
    let (_temp_dir, config_path) = setup_test_env();
    let post_id = draft(&config_path, &["instagram"]);
    let caption: String = (0..31).map(|i| format!("#drop{} ", i)).collect();

    reel_queue(&config_path, "alice")
        .args(["caption", &post_id, "instagram", &caption])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains(
            "Caption has 31 hashtags, instagram allows at most 30",
        ));
}

// STATS

#[test]
fn test_stats_before_any_sync() {
    let (_temp_dir, config_path) = setup_test_env();

    reel_queue(&config_path, "alice")
        .args(["stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No analytics yet"));
}

#[test]
fn test_stats_sync_without_published_posts() {
    let (_temp_dir, config_path) = setup_test_env();
    draft(&config_path, &["tiktok"]);

    let output = reel_queue(&config_path, "alice")
        .args(["stats", "--sync", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success(), "stats failed: {:?}", output);

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["sync"]["total"], 0);
    assert_eq!(json["sync"]["synced"], 0);
    assert_eq!(json["overview"]["totals"]["posts"], 0);
}
