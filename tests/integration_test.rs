use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn diskdiff_exe() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_diskdiff"))
}

fn run(args: &[&str]) -> Output {
    Command::new(diskdiff_exe())
        .args(args)
        .output()
        .expect("Failed to run diskdiff")
}

fn assert_success(output: &Output, what: &str) {
    assert!(
        output.status.success(),
        "diskdiff {what} failed:\nstdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn s(path: &Path) -> &str {
    path.to_str().unwrap()
}

/// Lay out a directory image: one subdirectory per partition.
fn create_image(root: &Path, partition: &str, files: &[(&str, &[u8])]) {
    let part = root.join(partition);
    fs::create_dir_all(&part).unwrap();
    for (rel_path, content) in files {
        let full = part.join(rel_path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&full, content).unwrap();
    }
}

fn collect_dir_tree(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut entries = Vec::new();
    collect_recursive(root, root, &mut entries);
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

fn collect_recursive(root: &Path, current: &Path, entries: &mut Vec<(String, Vec<u8>)>) {
    let mut dir_entries: Vec<_> = fs::read_dir(current).unwrap().collect::<Result<_, _>>().unwrap();
    dir_entries.sort_by_key(|e| e.file_name());

    for entry in dir_entries {
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap().to_str().unwrap().replace('\\', "/");
        if path.is_dir() {
            collect_recursive(root, &path, entries);
        } else {
            entries.push((rel, fs::read(&path).unwrap()));
        }
    }
}

#[test]
fn test_end_to_end_compare_and_apply() {
    let temp = tempfile::tempdir().unwrap();
    let old_img = temp.path().join("old");
    let new_img = temp.path().join("new");
    let base_img = temp.path().join("base");
    let diff_img = temp.path().join("diff");
    let out_img = temp.path().join("out");

    let mut blob_v1 = vec![0u8; 4096];
    blob_v1[..4].copy_from_slice(b"BLOB");
    let mut blob_v2 = blob_v1.clone();
    blob_v2[100] = 0xBB;

    let old_files: &[(&str, &[u8])] = &[
        ("readme.txt", b"line one\nline two\nline three\nline four\n"),
        ("config/settings.ini", b"[main]\ndebug=0\nlevel=1\n"),
        ("data/records.bin", &blob_v1),
        ("same.txt", b"untouched\n"),
    ];
    create_image(&old_img, "0-ntfs", old_files);
    create_image(&base_img, "0-ntfs", old_files);
    create_image(
        &new_img,
        "0-ntfs",
        &[
            ("readme.txt", b"line one\nline 2\nline three\nline four\nline five\n"),
            ("config/settings.ini", b"[main]\ndebug=1\nlevel=1\n"),
            ("data/records.bin", &blob_v2),
            ("same.txt", b"untouched\n"),
            ("docs/new_file.txt", b"Brand new file\n"),
        ],
    );

    let output = run(&[
        "compare",
        "--old",
        s(&old_img),
        "--new",
        s(&new_img),
        "--output",
        s(&diff_img),
        "--policy",
        "binary-only",
    ]);
    assert_success(&output, "compare");
    println!("Compare output:\n{}", String::from_utf8_lossy(&output.stdout));

    // text changes are stored as patches, everything else whole
    let stored = fs::read(diff_img.join("0-ntfs/FILES/readme.txt")).unwrap();
    assert!(stored.starts_with(b"@@ -2,1 +2,1 @@\n-line two\n+line 2\n"));
    assert_eq!(fs::read(diff_img.join("0-ntfs/FILES/data/records.bin")).unwrap(), blob_v2);
    assert!(!diff_img.join("0-ntfs/FILES/same.txt").exists());

    let output = run(&["apply", "--base", s(&base_img), "--diff", s(&diff_img), "-o", s(&out_img)]);
    assert_success(&output, "apply");
    println!("Apply output:\n{}", String::from_utf8_lossy(&output.stdout));

    assert_eq!(collect_dir_tree(&new_img), collect_dir_tree(&out_img));
    // the base is left alone when an output is given
    assert_eq!(collect_dir_tree(&old_img), collect_dir_tree(&base_img));
}

#[test]
fn test_apply_in_place() {
    let temp = tempfile::tempdir().unwrap();
    let old_img = temp.path().join("old");
    let new_img = temp.path().join("new");
    let diff_img = temp.path().join("diff");

    create_image(&old_img, "0-fat32", &[("a.txt", b"1\n2\n3\n")]);
    create_image(&new_img, "0-fat32", &[("a.txt", b"1\nTWO\n3\n"), ("sub/b.txt", b"b\n")]);

    assert_success(
        &run(&["compare", "--old", s(&old_img), "--new", s(&new_img), "-o", s(&diff_img)]),
        "compare",
    );
    assert_success(&run(&["apply", "--base", s(&old_img), "--diff", s(&diff_img)]), "apply");
    assert_eq!(collect_dir_tree(&new_img), collect_dir_tree(&old_img));
}

#[test]
fn test_no_changes_yields_empty_partition() {
    let temp = tempfile::tempdir().unwrap();
    let old_img = temp.path().join("old");
    let new_img = temp.path().join("new");
    let diff_img = temp.path().join("diff");

    let files: &[(&str, &[u8])] = &[("a.txt", b"Same content\n"), ("sub/b.txt", b"Also same\n")];
    create_image(&old_img, "0-ntfs", files);
    create_image(&new_img, "0-ntfs", files);

    let output = run(&[
        "compare",
        "--old",
        s(&old_img),
        "--new",
        s(&new_img),
        "-o",
        s(&diff_img),
        "--policy",
        "full",
    ]);
    assert_success(&output, "compare");
    assert!(diff_img.join("0-ntfs").is_dir());
    assert!(collect_dir_tree(&diff_img).is_empty());
}

#[test]
fn test_existing_output_is_refused_without_overwrite() {
    let temp = tempfile::tempdir().unwrap();
    let old_img = temp.path().join("old");
    let new_img = temp.path().join("new");
    let diff_img = temp.path().join("diff");

    create_image(&old_img, "0-ntfs", &[("a.txt", b"a\n")]);
    create_image(&new_img, "0-ntfs", &[("a.txt", b"bb\n")]);
    fs::create_dir_all(diff_img.join("keep")).unwrap();

    let args = ["compare", "--old", s(&old_img), "--new", s(&new_img), "-o", s(&diff_img)];
    let output = run(&args);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("already exists"));
    assert!(diff_img.join("keep").is_dir());

    let mut args = args.to_vec();
    args.push("--overwrite");
    assert_success(&run(&args), "compare --overwrite");
    assert!(!diff_img.join("keep").exists());
    assert!(diff_img.join("0-ntfs/FILES/a.txt").exists());
}

#[test]
fn test_filesystem_mismatch_writes_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let old_img = temp.path().join("old");
    let new_img = temp.path().join("new");
    let diff_img = temp.path().join("diff");

    create_image(&old_img, "0-ntfs", &[("a.txt", b"a\n")]);
    create_image(&new_img, "0-fat32", &[("a.txt", b"b\n")]);

    let output = run(&["compare", "--old", s(&old_img), "--new", s(&new_img), "-o", s(&diff_img)]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("does not match"));
    assert!(!diff_img.exists());
}

#[test]
fn test_explicit_partition_pair() {
    let temp = tempfile::tempdir().unwrap();
    let old_img = temp.path().join("old");
    let new_img = temp.path().join("new");
    let diff_img = temp.path().join("diff");

    create_image(&old_img, "0-ntfs", &[("a.txt", b"a\n")]);
    create_image(&new_img, "0-fat32", &[("boot.ini", b"x\n")]);
    create_image(&new_img, "1-ntfs", &[("a.txt", b"changed\n")]);

    let output = run(&["compare", "--old", s(&old_img), "--new", s(&new_img), "-o", s(&diff_img)]);
    assert!(!output.status.success(), "partition counts differ");

    let output = run(&[
        "compare",
        "--old",
        s(&old_img),
        "--new",
        s(&new_img),
        "-o",
        s(&diff_img),
        "--old-partition",
        "0",
        "--new-partition",
        "1",
    ]);
    assert_success(&output, "compare");
    assert_eq!(
        fs::read(diff_img.join("0-ntfs/FILES/a.txt")).unwrap(),
        b"@@ -1,1 +1,1 @@\n-a\n+changed\n"
    );
}

#[test]
fn test_missing_input() {
    let temp = tempfile::tempdir().unwrap();
    let output = run(&[
        "compare",
        "--old",
        s(&temp.path().join("nope")),
        "--new",
        s(&temp.path().join("nope2")),
        "-o",
        s(&temp.path().join("out")),
    ]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("does not exist"));
}
