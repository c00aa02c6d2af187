// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of weft, released under the BSD 3-Clause License.

//! End-to-end tests of the `weft` engine host binary: argv
//! parsing, resource resolution, and the startup banner contract.

use assert_cmd::Command;
use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;
use serial_test::serial;
use std::io::{BufRead, BufReader};
use std::process::{Command as StdCommand, Stdio};
use std::time::Duration;

fn write_resource_config(home: &TempDir, resource_id: &str, login: &str) {
    home.child(".config/weft/resources.toml")
        .write_str(&format!(
            "[resource.{resource_id}]\nsubmitting_host = \"localhost\"\nlogin = \"{login}\"\n"
        ))
        .unwrap();
}

#[test]
#[serial]
fn unknown_resource_exits_with_failure() {
    let home = TempDir::new().unwrap();

    Command::cargo_bin("weft")
        .unwrap()
        .env("WEFT_HOME", home.path())
        .env("WEFT_LOG", "off")
        .args(["ghost", "object", "tag"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown resource"));
}

#[test]
#[serial]
fn prints_startup_banner_then_serves() {
    let home = TempDir::new().unwrap();
    write_resource_config(&home, "cluster_a", "alice");

    let mut child = StdCommand::new(env!("CARGO_BIN_EXE_weft"))
        .env("WEFT_HOME", home.path())
        .env("WEFT_LOG", "off")
        .args(["cluster_a", "object", "tag"])
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();

    let stdout = child.stdout.take().unwrap();
    let (sender, receiver) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let mut reader = BufReader::new(stdout);
        let mut lines = Vec::new();
        for _ in 0..2 {
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap_or(0) == 0 {
                break;
            }
            lines.push(line);
        }
        let _ = sender.send(lines);
    });

    let lines = receiver
        .recv_timeout(Duration::from_secs(10))
        .expect("engine host did not print its banner in time");

    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("workflow_engine_alice tcp://"));
    assert!(lines[1].starts_with("connection_checker tcp://"));

    let _ = child.kill();
    let _ = child.wait();
}
