#![cfg(any(target_os = "linux", target_os = "macos"))]

//! End-to-end runs through the real `jostle` and `jostle-worker` binaries,
//! with a shell script standing in for the host runtime's test harness. The
//! script detects mutants by comparing the target class on its classpath
//! against a pristine golden copy.

use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use tempfile::tempdir;

use jostle::classfile::pool::ConstPool;
use jostle::classfile::{self, ClassImage, CodeAttr, Constant, MethodAttr, MethodInfo, RawAttribute};

fn target_class_bytes() -> Vec<u8> {
    let mut pool = ConstPool::new();
    let this_name = pool.utf8_index("demo/Target");
    let super_name = pool.utf8_index("java/lang/Object");
    let this_class = pool.push(Constant::Class(this_name));
    let super_class = pool.push(Constant::Class(super_name));
    let code_name = pool.utf8_index("Code");
    let line_table = pool.utf8_index("LineNumberTable");
    let method_name = pool.utf8_index("answer");
    let descriptor = pool.utf8_index("()I");

    classfile::emit(&ClassImage {
        minor: 0,
        major: 49,
        pool,
        access: 0x0021,
        this_class,
        super_class,
        interfaces: Vec::new(),
        fields: Vec::new(),
        methods: vec![MethodInfo {
            access: 0x0001,
            name_index: method_name,
            descriptor_index: descriptor,
            attributes: vec![MethodAttr::Code(CodeAttr {
                name_index: code_name,
                max_stack: 1,
                max_locals: 1,
                code: vec![16 /* bipush */, 42, 172 /* ireturn */],
                exceptions: Vec::new(),
                attributes: vec![RawAttribute {
                    name_index: line_table,
                    data: vec![0, 1, 0, 0, 0, 3],
                }],
            })],
        }],
        attributes: Vec::new(),
    })
}

struct Fixture {
    _tmp: tempfile::TempDir,
    classpath: PathBuf,
    golden: PathBuf,
    cache_dir: PathBuf,
    harness_dir: PathBuf,
}

fn fixture() -> Fixture {
    let tmp = tempdir().expect("tempdir should be created");
    let classpath = tmp.path().join("classes");
    let package = classpath.join("demo");
    fs::create_dir_all(&package).expect("package dir should be created");

    let bytes = target_class_bytes();
    fs::write(package.join("Target.class"), &bytes).expect("target class should be written");
    fs::write(package.join("TargetTest.class"), b"not a real class, fingerprinted only")
        .expect("test class stand-in should be written");

    let golden = tmp.path().join("Target.golden");
    fs::write(&golden, &bytes).expect("golden copy should be written");

    Fixture {
        classpath,
        golden,
        cache_dir: tmp.path().join("cache"),
        harness_dir: tmp.path().join("harness"),
        _tmp: tmp,
    }
}

/// A harness script reporting `alpha` and `beta`. `$1`-driven behaviour when
/// the target class differs from the golden copy: "fail", "pass", "hang", or
/// "always-fail" (fails even unmutated, for baseline tests).
fn write_harness(fixture: &Fixture, when_mutated: &str) -> PathBuf {
    fs::create_dir_all(&fixture.harness_dir).expect("harness dir should be created");
    let path = fixture.harness_dir.join(format!("harness-{when_mutated}"));
    let body = format!(
        r#"#!/usr/bin/env sh
mode="{when_mutated}"
prev=""
cp=""
class=""
method=""
for a in "$@"; do
  if [ "$prev" = "-cp" ]; then cp="$a"; prev=""; continue; fi
  if [ "$a" = "-cp" ]; then prev="-cp"; continue; fi
  if [ -z "$class" ]; then class="$a"; else method="$a"; fi
done

target=""
old_ifs="$IFS"
IFS=:
for entry in $cp; do
  if [ -f "$entry/demo/Target.class" ]; then target="$entry/demo/Target.class"; break; fi
done
IFS="$old_ifs"

mutated=0
if [ -n "$target" ] && ! cmp -s "$target" "$JOSTLE_E2E_GOLDEN"; then mutated=1; fi
if [ "$mode" = "always-fail" ]; then mutated=1; fi

emit() {{
  if [ "$mutated" = "1" ]; then
    case "$mode" in
      pass) echo "TEST $1 PASS 5" ;;
      hang) sleep 30; echo "TEST $1 PASS 5" ;;
      *) echo "TEST $1 FAIL 5 target class changed"; exit 1 ;;
    esac
  else
    echo "TEST $1 PASS 5"
  fi
}}

if [ -n "$method" ]; then
  emit "$method"
else
  emit alpha
  emit beta
fi
exit 0
"#
    );
    let mut file = File::create(&path).expect("harness script should be created");
    file.write_all(body.as_bytes()).expect("harness body should be written");
    file.sync_all().expect("harness script should be flushed");
    fs::set_permissions(&path, PermissionsExt::from_mode(0o755))
        .expect("harness script should be executable");
    path
}

fn run_jostle(fixture: &Fixture, harness: &Path, extra_args: &[&str]) -> Output {
    let jostle = PathBuf::from(env!("CARGO_BIN_EXE_jostle"));
    let worker = PathBuf::from(env!("CARGO_BIN_EXE_jostle-worker"));
    let mut command = Command::new(jostle);
    command
        .arg("demo.Target")
        .arg("demo.TargetTest")
        .arg("--classpath")
        .arg(fixture.classpath.display().to_string())
        .arg("--harness")
        .arg(harness.display().to_string())
        .arg("--cache-dir")
        .arg(fixture.cache_dir.display().to_string())
        .args(["--return-vals", "--inline-consts"])
        .args(extra_args)
        .env("JOSTLE_WORKER", worker)
        .env("JOSTLE_E2E_GOLDEN", &fixture.golden)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.output().expect("jostle should run")
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn detected_mutants_score_one_hundred_percent() {
    let fixture = fixture();
    let harness = write_harness(&fixture, "fail");
    let output = run_jostle(&fixture, &harness, &[]);

    let stdout = stdout_of(&output);
    assert!(
        output.status.success(),
        "stdout: {stdout}, stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    // Two points in `answer`: the inline constant and the return value.
    assert!(stdout.contains("(2 points)"), "stdout: {stdout}");
    assert!(stdout.contains("Score: 100%"), "stdout: {stdout}");
    assert!(stdout.contains("2 killed"), "stdout: {stdout}");
}

#[test]
fn undetected_mutants_survive_and_are_reported() {
    let fixture = fixture();
    let harness = write_harness(&fixture, "pass");
    let output = run_jostle(&fixture, &harness, &[]);

    let stdout = stdout_of(&output);
    assert!(output.status.success(), "stdout: {stdout}");
    assert!(stdout.contains("Score: 0%"), "stdout: {stdout}");
    assert!(stdout.contains("M FAIL: 3:"), "stdout: {stdout}");
    assert!(stdout.contains("2 survived"), "stdout: {stdout}");
}

#[test]
fn failing_baseline_refuses_to_score() {
    let fixture = fixture();
    let harness = write_harness(&fixture, "always-fail");
    let output = run_jostle(&fixture, &harness, &[]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("baseline"), "stderr: {stderr}");
    assert!(stderr.contains("alpha"), "stderr: {stderr}");
    let stdout = stdout_of(&output);
    assert!(!stdout.contains("Score:"), "stdout: {stdout}");
}

#[test]
fn first_mutation_restart_runs_the_tail_only() {
    let fixture = fixture();
    let harness = write_harness(&fixture, "fail");
    let output = run_jostle(&fixture, &harness, &["--first-mutation", "1"]);

    let stdout = stdout_of(&output);
    assert!(output.status.success(), "stdout: {stdout}");
    assert!(stdout.contains("(2 points)"), "stdout: {stdout}");
    assert!(stdout.contains("1 total"), "stdout: {stdout}");
    assert!(stdout.contains("Score: 100%"), "stdout: {stdout}");
}

#[test]
fn hanging_mutant_times_out_and_counts_as_killed() {
    let fixture = fixture();
    let harness = write_harness(&fixture, "hang");
    let output = run_jostle(&fixture, &harness, &["--first-mutation", "1"]);

    let stdout = stdout_of(&output);
    assert!(output.status.success(), "stdout: {stdout}");
    assert!(stdout.contains("1 timed out"), "stdout: {stdout}");
    assert!(stdout.contains("Score: 100%"), "stdout: {stdout}");
}

#[test]
fn cache_manifest_is_written_and_reused() {
    let fixture = fixture();
    let harness = write_harness(&fixture, "fail");

    let first = run_jostle(&fixture, &harness, &[]);
    assert!(first.status.success());
    let manifests: Vec<_> = fs::read_dir(&fixture.cache_dir)
        .expect("cache dir should exist")
        .collect();
    assert_eq!(manifests.len(), 1);

    // Second run consumes the manifest; the scores agree.
    let second = run_jostle(&fixture, &harness, &[]);
    assert!(second.status.success());
    assert!(stdout_of(&second).contains("Score: 100%"));
}
