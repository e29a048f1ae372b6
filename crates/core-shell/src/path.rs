//! PATH search.
//!
//! Resolves a program abbreviation against the PATH variable of the shell
//! environment (not the host process environment). POSIX splits on `:` and
//! probes the execute bit; the Windows arm splits on `;` and additionally
//! tries every `PATHEXT` suffix.

use std::path::{Path, PathBuf};

use crate::local::{LocalId, Locals};

pub fn find_in_path(locals: &Locals, scope: LocalId, abbreviation: &str) -> Option<PathBuf> {
    // Anything with a separator is used as-is, relative to the working
    // directory.
    if abbreviation.contains('/') || (cfg!(windows) && abbreviation.contains('\\')) {
        let path = Path::new(locals.get_wd(scope)).join(abbreviation);
        return is_executable(&path).then_some(path);
    }

    let path_var = locals.get_var(scope, "PATH")?;
    let separator = if cfg!(windows) { ';' } else { ':' };

    for piece in path_var.split(separator) {
        if piece.is_empty() {
            continue;
        }
        let candidate = Path::new(piece).join(abbreviation);

        if cfg!(windows) {
            let extensions = locals
                .get_var(scope, "PATHEXT")
                .unwrap_or_else(|| ".EXE".into());
            for extension in extensions.split(separator) {
                let mut with_extension = candidate.as_os_str().to_owned();
                with_extension.push(extension);
                let with_extension = PathBuf::from(with_extension);
                if is_executable(&with_extension) {
                    return Some(with_extension);
                }
            }
        }

        if is_executable(&candidate) {
            return Some(candidate);
        }
    }

    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    nix::unistd::access(path, nix::unistd::AccessFlags::X_OK).is_ok() && path.is_file()
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::Locals;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn finds_executable_in_path() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("mytool");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let (mut locals, root) = Locals::new();
        locals.set_var(
            root,
            "PATH",
            &format!("/nonexistent:{}", dir.path().display()),
        );
        assert_eq!(find_in_path(&locals, root, "mytool"), Some(tool));
        assert_eq!(find_in_path(&locals, root, "missing"), None);
    }

    #[test]
    fn non_executable_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data");
        std::fs::write(&file, "not a program").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o644)).unwrap();

        let (mut locals, root) = Locals::new();
        locals.set_var(root, "PATH", &dir.path().display().to_string());
        assert_eq!(find_in_path(&locals, root, "data"), None);
    }

    #[test]
    fn relative_path_resolves_against_wd() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("tool.sh");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let (mut locals, root) = Locals::new();
        locals.set_wd(root, &dir.path().display().to_string());
        assert_eq!(find_in_path(&locals, root, "./tool.sh"), Some(dir.path().join("./tool.sh")));
    }

    #[test]
    fn missing_path_variable_finds_nothing() {
        let (locals, root) = Locals::new();
        assert_eq!(find_in_path(&locals, root, "ls"), None);
    }
}
