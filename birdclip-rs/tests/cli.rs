use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;

fn write_silence(path: &Path, rate: u32, secs: f32) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut w = hound::WavWriter::create(path, spec).expect("create wav");
    for _ in 0..(rate as f32 * secs) as usize {
        w.write_sample(0i16).expect("write sample");
    }
    w.finalize().expect("finalize");
}

fn write_labels(path: &Path, n: usize) {
    let text: String = (0..n).map(|i| format!("Avis numerus{i}_Bird {i}\n")).collect();
    std::fs::write(path, text).expect("labels");
}

#[test]
fn prints_top_k_lines() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clip = dir.path().join("clip.wav");
    let labels = dir.path().join("labels.txt");
    write_silence(&clip, 48_000, 1.5);
    write_labels(&labels, 20);

    let out = Command::cargo_bin("birdclip")
        .expect("binary")
        .args(["--labels", labels.to_str().unwrap()])
        .args(["--class-count", "20", "--top-k", "3", "--show-table", "false"])
        .arg(&clip)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(out).expect("utf8");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    for line in lines {
        assert!(line.starts_with("Bird "), "{line}");
        let score = line.rsplit(": ").next().unwrap();
        assert_eq!(score.split('.').nth(1).map(str::len), Some(3), "{line}");
    }
}

#[test]
fn json_output() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clip = dir.path().join("clip.wav");
    let labels = dir.path().join("labels.txt");
    write_silence(&clip, 16_000, 0.5);
    write_labels(&labels, 8);

    Command::cargo_bin("birdclip")
        .expect("binary")
        .args(["--labels", labels.to_str().unwrap(), "--class-count", "8", "--json"])
        .arg(&clip)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"scientific_name\": \"Avis numerus"))
        .stdout(predicate::str::contains("\"model\": \"dummy-birdnet\""))
        .stdout(predicate::str::is_match(r#""score_text": "-?\d+\.\d{3}""#).unwrap());
}

#[test]
fn label_count_mismatch_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clip = dir.path().join("clip.wav");
    let labels = dir.path().join("labels.txt");
    write_silence(&clip, 48_000, 0.1);
    write_labels(&labels, 7);

    Command::cargo_bin("birdclip")
        .expect("binary")
        .args(["--labels", labels.to_str().unwrap(), "--class-count", "8"])
        .arg(&clip)
        .assert()
        .failure()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("ConfigError"));
}

#[test]
fn top_k_above_classes_fails_with_rank_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clip = dir.path().join("clip.wav");
    let labels = dir.path().join("labels.txt");
    write_silence(&clip, 48_000, 0.1);
    write_labels(&labels, 4);

    Command::cargo_bin("birdclip")
        .expect("binary")
        .args(["--labels", labels.to_str().unwrap(), "--class-count", "4", "--top-k", "5"])
        .arg(&clip)
        .assert()
        .failure()
        .stderr(predicate::str::contains("RankError during rank stage"));
}

#[test]
fn dump_window_writes_fixed_length_wav() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clip = dir.path().join("clip.wav");
    let labels = dir.path().join("labels.txt");
    let dump = dir.path().join("window.wav");
    write_silence(&clip, 44_100, 0.25);
    write_labels(&labels, 4);

    Command::cargo_bin("birdclip")
        .expect("binary")
        .args(["--labels", labels.to_str().unwrap(), "--class-count", "4"])
        .args(["--top-k", "3", "--duration", "1", "--show-table", "false"])
        .arg("--dump-window")
        .arg(&dump)
        .arg(&clip)
        .assert()
        .success();

    let reader = hound::WavReader::open(&dump).expect("dump");
    assert_eq!(reader.spec().sample_rate, 48_000);
    assert_eq!(reader.len(), 48_000);
}

#[test]
fn failed_run_leaves_no_window_dump() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clip = dir.path().join("clip.wav");
    let labels = dir.path().join("labels.txt");
    let dump = dir.path().join("window.wav");
    write_silence(&clip, 48_000, 0.1);
    write_labels(&labels, 4);

    Command::cargo_bin("birdclip")
        .expect("binary")
        .args(["--labels", labels.to_str().unwrap(), "--class-count", "4", "--top-k", "5"])
        .arg("--dump-window")
        .arg(&dump)
        .arg(&clip)
        .assert()
        .failure()
        .stderr(predicate::str::contains("RankError"));
    assert!(!dump.exists());
}

#[test]
fn extensionless_clip_named_directly_is_classified() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clip = dir.path().join("recording");
    let labels = dir.path().join("labels.txt");
    write_silence(&clip, 48_000, 0.5);
    write_labels(&labels, 8);

    let out = Command::cargo_bin("birdclip")
        .expect("binary")
        .args(["--labels", labels.to_str().unwrap(), "--class-count", "8"])
        .args(["--show-table", "false"])
        .arg(&clip)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(String::from_utf8(out).expect("utf8").lines().count(), 5);
}

#[test]
fn empty_directory_fails_instead_of_printing_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clips = dir.path().join("clips");
    std::fs::create_dir(&clips).expect("mkdir");
    let labels = dir.path().join("labels.txt");
    write_labels(&labels, 8);

    Command::cargo_bin("birdclip")
        .expect("binary")
        .args(["--labels", labels.to_str().unwrap(), "--class-count", "8"])
        .arg(&clips)
        .assert()
        .failure()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("no audio clips found"));
}
