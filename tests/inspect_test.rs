mod common;

#[cfg(test)]
mod tests {
    use std::fs;

    use assert_cmd::Command;
    use predicates::prelude::*;
    use tempfile::tempdir;

    use crate::common::{Entry, ImageBuilder};

    #[test]
    fn test_inspect_lists_imports() {
        let image = ImageBuilder::new()
            .library("ws2_32.dll", &[Entry::Name("socket"), Entry::Ordinal(151)])
            .library("user32.dll", &[Entry::Name("MessageBoxA")])
            .build();

        let dir = tempdir().unwrap();
        let path = dir.path().join("target.dll");
        fs::write(&path, &image.bytes).unwrap();

        Command::cargo_bin("iatswap")
            .unwrap()
            .args(["inspect", "-i"])
            .arg(&path)
            .assert()
            .success()
            .stdout(predicate::str::contains("ws2_32.dll"))
            .stdout(predicate::str::contains("socket (hint 16)"))
            .stdout(predicate::str::contains("Ordinal#151"))
            .stdout(predicate::str::contains("user32.dll"))
            .stdout(predicate::str::contains(
                "3 import entries across 2 libraries",
            ));
    }

    #[test]
    fn test_inspect_filters_by_library() {
        let image = ImageBuilder::new()
            .library("ws2_32.dll", &[Entry::Name("socket"), Entry::Ordinal(151)])
            .library("user32.dll", &[Entry::Name("MessageBoxA")])
            .build();

        let dir = tempdir().unwrap();
        let path = dir.path().join("target.dll");
        fs::write(&path, &image.bytes).unwrap();

        Command::cargo_bin("iatswap")
            .unwrap()
            .args(["inspect", "-i"])
            .arg(&path)
            .args(["-l", "USER32.dll"])
            .assert()
            .success()
            .stdout(predicate::str::contains("user32.dll"))
            .stdout(predicate::str::contains("ws2_32.dll").not())
            .stdout(predicate::str::contains(
                "1 import entries across 1 libraries",
            ));
    }

    #[test]
    fn test_inspect_rejects_corrupt_file() {
        let mut image = ImageBuilder::new()
            .library("ws2_32.dll", &[Entry::Name("socket")])
            .build();
        image.corrupt_dos_signature();

        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.dll");
        fs::write(&path, &image.bytes).unwrap();

        Command::cargo_bin("iatswap")
            .unwrap()
            .args(["inspect", "-i"])
            .arg(&path)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to inspect"));
    }

    #[test]
    fn test_inspect_reports_missing_import_directory() {
        let image = ImageBuilder::new().build();

        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.dll");
        fs::write(&path, &image.bytes).unwrap();

        Command::cargo_bin("iatswap")
            .unwrap()
            .args(["inspect", "-i"])
            .arg(&path)
            .assert()
            .success()
            .stdout(predicate::str::contains("No import directory"));
    }
}
