use std::env;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

/// Directory searched before anything else for bundled tools such as ffprobe.
pub const ENV_BIN_DIR: &str = "FRAMECHAIN_BIN_DIR";

/// Directories probed for helper binaries, in priority order:
///   1. `$FRAMECHAIN_BIN_DIR`
///   2. `<exe_dir>/`, `<exe_dir>/bin/`, `<exe_dir>/../bin/`
///   3. `<cwd>/`, `<cwd>/bin/`
///
/// Falls back to `PATH` when none of them holds the binary.
fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(dir) = env::var_os(ENV_BIN_DIR) {
        dirs.push(PathBuf::from(dir));
    }

    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("bin"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("bin"));
            }
        }
    }

    if let Ok(cwd) = env::current_dir() {
        let cwd_bin = cwd.join("bin");
        for dir in [cwd, cwd_bin] {
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
    }

    dirs
}

#[cfg(unix)]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    vec![binary.to_string()]
}

#[cfg(windows)]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    if Path::new(binary).components().count() > 1 {
        return vec![binary.to_string()];
    }

    let lower = binary.to_ascii_lowercase();
    if lower.ends_with(".exe") || lower.ends_with(".cmd") || lower.ends_with(".bat") {
        return vec![binary.to_string()];
    }

    vec![format!("{binary}.exe"), binary.to_string()]
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let names = candidate_binary_names(binary);
    dirs.iter()
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| Path::is_file(candidate))
}

/// A `Command` for `binary`, resolved against the bundled directories first.
pub fn command_for(binary: &str) -> ProcessCommand {
    match find_binary_in_dirs(binary, &candidate_bin_dirs()) {
        Some(path) => ProcessCommand::new(path),
        None => ProcessCommand::new(binary),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_bin_dirs_includes_cwd_bin() {
        let dirs = candidate_bin_dirs();
        if let Ok(cwd) = env::current_dir() {
            assert!(dirs.contains(&cwd.join("bin")));
        }
    }

    #[test]
    fn find_binary_in_dirs_prefers_first_match() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).expect("first dir should be created");
        std::fs::create_dir_all(&second).expect("second dir should be created");

        #[cfg(unix)]
        let binary_name = "ffprobe";
        #[cfg(windows)]
        let binary_name = "ffprobe.exe";

        std::fs::write(second.join(binary_name), b"second").expect("second binary should exist");
        let resolved = find_binary_in_dirs("ffprobe", &[first.clone(), second.clone()])
            .expect("binary should be resolved");
        assert_eq!(resolved, second.join(binary_name));

        std::fs::write(first.join(binary_name), b"first").expect("first binary should exist");
        let resolved = find_binary_in_dirs("ffprobe", &[first.clone(), second])
            .expect("binary should be resolved");
        assert_eq!(resolved, first.join(binary_name));
    }

    #[test]
    fn find_binary_in_dirs_misses_cleanly() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        assert!(find_binary_in_dirs("ffprobe", &[temp.path().to_path_buf()]).is_none());
    }
}
