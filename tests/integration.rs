// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::Duration;

use vmm_sys_util::tempfile::TempFile;
use wait_timeout::ChildExt;

fn rawdisk(args: &[&str]) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_rawdisk"))
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap_or_else(|e| panic!("Expected rawdisk to run. Error: {e:?}"));

    // Outputs are small enough to fit in the pipe buffers.
    if child
        .wait_timeout(Duration::from_secs(20))
        .unwrap()
        .is_none()
    {
        let _ = child.kill();
    }
    let output = child.wait_with_output().unwrap();

    if !output.status.success() {
        eprintln!(
            "\n\n==== Start 'rawdisk {}' failed ==== \
            \n\n---stdout---\n{}\n---stderr---{} \
            \n\n==== End 'rawdisk' failed ====",
            args.join(" "),
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );
    }
    output
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap()
}

fn info_field(output: &Output, field: &str) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .find_map(|line| line.strip_prefix(&format!("{field}: ")))
        .unwrap_or_else(|| panic!("Missing {field} in {stdout}"))
        .to_string()
}

#[test]
fn test_cli_create_and_info() {
    let image = TempFile::new().unwrap();
    let image = path_str(image.as_path()).to_string();

    assert!(rawdisk(&[&image, "create", "--sectors", "16"]).status.success());

    let output = rawdisk(&[&image, "info"]);
    assert!(output.status.success());
    assert_eq!(info_field(&output, "length"), "8192");
    assert_eq!(info_field(&output, "sectors"), "16");
    assert_eq!(info_field(&output, "class"), "PlainFile");
    assert_eq!(info_field(&output, "read-only"), "true");
    assert_eq!(info_field(&output, "inserted"), "true");
}

#[test]
fn test_cli_write_then_read() {
    let image = TempFile::new().unwrap();
    image.as_file().set_len(4096).unwrap();
    let image = path_str(image.as_path()).to_string();

    let input = TempFile::new().unwrap();
    input.as_file().write_all(b"raw disk payload").unwrap();

    let output = rawdisk(&[
        &image,
        "write",
        "--offset",
        "1000",
        "--input",
        path_str(input.as_path()),
    ]);
    assert!(output.status.success());

    let output = rawdisk(&[&image, "read", "--offset", "1000", "--length", "16"]);
    assert!(output.status.success());
    assert_eq!(output.stdout, b"raw disk payload");

    let data = fs::read(&image).unwrap();
    assert_eq!(&data[1000..1016], b"raw disk payload");
    assert!(data[..1000].iter().all(|&b| b == 0));
}

#[test]
fn test_cli_aio_read() {
    let image = TempFile::new().unwrap();
    let mut data = vec![0u8; 2048];
    data[512..1024].fill(0xa5);
    image.as_file().write_all(&data).unwrap();
    let image = path_str(image.as_path()).to_string();

    let config = TempFile::new().unwrap();
    config
        .as_file()
        .write_all(br#"{"aio": {"backend": "thread_pool"}}"#)
        .unwrap();
    let out = TempFile::new().unwrap();

    let output = rawdisk(&[
        "--config",
        path_str(config.as_path()),
        &image,
        "aio-read",
        "--sector",
        "1",
        "--count",
        "1",
        "--output",
        path_str(out.as_path()),
    ]);
    assert!(output.status.success());
    assert_eq!(fs::read(out.as_path()).unwrap(), vec![0xa5u8; 512]);
}

#[test]
fn test_cli_truncate() {
    let image = TempFile::new().unwrap();
    let image = path_str(image.as_path()).to_string();

    assert!(rawdisk(&[&image, "create", "--sectors", "2"]).status.success());
    assert!(rawdisk(&[&image, "truncate", "--sectors", "5"]).status.success());
    assert_eq!(fs::metadata(&image).unwrap().len(), 5 * 512);
}

#[test]
fn test_cli_readonly_write_fails() {
    let image = TempFile::new().unwrap();
    image.as_file().set_len(1024).unwrap();
    let image = path_str(image.as_path()).to_string();

    let input = TempFile::new().unwrap();
    input.as_file().write_all(b"data").unwrap();

    let output = rawdisk(&[
        "--readonly",
        &image,
        "write",
        "--offset",
        "0",
        "--input",
        path_str(input.as_path()),
    ]);
    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("rawdisk exited with"));
    assert!(fs::read(&image).unwrap().iter().all(|&b| b == 0));
}

#[test]
fn test_cli_plain_file_has_no_removable_media() {
    let image = TempFile::new().unwrap();
    image.as_file().set_len(512).unwrap();
    let image = path_str(image.as_path()).to_string();

    assert!(!rawdisk(&[&image, "eject"]).status.success());
    assert!(!rawdisk(&[&image, "lock"]).status.success());
    assert!(!rawdisk(&[&image, "media-changed"]).status.success());
}

#[test]
fn test_cli_missing_image() {
    let output = rawdisk(&["/nonexistent/rawdisk.img", "info"]);
    assert_eq!(output.status.code(), Some(1));
}
