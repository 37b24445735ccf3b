use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, error};
use regex::Regex;
use sha1::{Digest, Sha1};

use crate::config::Config;

/// Basenames that mean "a distributing wrapper, not a real compiler".
const WRAPPER_NAMES: &[&str] = &["fiskc", "icecc"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerKind {
    Gcc,
    Clang,
    Other,
}

/// The three faces of the compiler for one invocation: the executable we
/// exec locally, the symlink-resolved file used for environment hashing,
/// and the basename the remote builder should invoke.
#[derive(Debug, Clone)]
pub struct CompilerInfo {
    pub compiler: PathBuf,
    pub resolved: PathBuf,
    pub builder_compiler: String,
    pub kind: CompilerKind,
}

fn basename(path: &Path) -> &str {
    path.file_name().and_then(|f| f.to_str()).unwrap_or("")
}

fn is_executable(path: &Path) -> bool {
    let Ok(cpath) = CString::new(path.as_os_str().as_encoded_bytes()) else {
        return false;
    };
    unsafe { libc::access(cpath.as_ptr(), libc::X_OK) == 0 }
}

/// First executable named `name` on `$PATH` that is not this client and not
/// a symlink straight into another distributing wrapper.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(name);
        if !is_executable(&candidate) {
            continue;
        }
        if let Ok(resolved) = fs::canonicalize(&candidate) {
            if basename(&resolved) == "fiskc" {
                continue;
            }
        }
        if let Ok(target) = fs::read_link(&candidate) {
            if WRAPPER_NAMES.contains(&basename(&target)) {
                continue;
            }
        }
        return Some(candidate);
    }
    None
}

/// Follows `link` one hop at a time, resolving relative targets against the
/// link's directory, until `stop` says so or a non-symlink is reached.
fn resolve_symlink(link: &Path, mut stop: impl FnMut(&Path) -> bool) -> PathBuf {
    let mut current = link.to_path_buf();
    loop {
        let target = match fs::read_link(&current) {
            Ok(target) => target,
            Err(_) => break,
        };
        current = if target.is_absolute() {
            target
        } else {
            current.parent().unwrap_or(Path::new(".")).join(target)
        };
        if stop(&current) {
            break;
        }
    }
    current
}

fn builder_compiler_for(path: &Path) -> Option<String> {
    let base = basename(path);
    // clang++ contains "g++", so the clang checks must come first.
    if base.contains("clang++") {
        Some("/usr/bin/clang++".to_string())
    } else if base.contains("clang") {
        Some("/usr/bin/clang".to_string())
    } else if base.contains("g++") {
        Some("/usr/bin/g++".to_string())
    } else if base.contains("gcc") {
        Some("/usr/bin/gcc".to_string())
    } else {
        None
    }
}

/// Rewrites the resolved compiler's basename for hashing purposes:
/// `clang++` → `clang`, `g++` → `gcc`, `c++` → `cc`.
fn strip_plus_plus(path: &Path) -> PathBuf {
    let base = basename(path);
    let rewritten = if base.contains("clang++") {
        base.replace("clang++", "clang")
    } else if base.contains("g++") {
        base.replace("g++", "gcc")
    } else if base.contains("c++") {
        base.replace("c++", "cc")
    } else {
        return path.to_path_buf();
    };
    path.with_file_name(rewritten)
}

/// Resolves the compiler behind this invocation. `preresolved` comes from
/// configuration or from the driver's argv[0] inference; when empty the
/// basename of argv[0] is looked up on `$PATH`.
pub fn find_compiler(argv0: &str, preresolved: Option<&str>) -> crate::Result<CompilerInfo> {
    let exec = match preresolved {
        Some(name) if name.starts_with('/') => PathBuf::from(name),
        Some(name) => find_in_path(name)
            .ok_or_else(|| crate::Error::from(format!("no executable for {name} on PATH")))?,
        None => {
            let name = basename(Path::new(argv0));
            find_in_path(name)
                .ok_or_else(|| crate::Error::from(format!("no executable for {name} on PATH")))?
        }
    };

    if basename(&exec) == "fiskc" {
        return Err(crate::Error::from("compiler resolution loops back to fiskc"));
    }

    let mut resolved = None;
    if basename(&exec).contains("g++") || basename(&exec).contains("gcc") {
        resolved = Some(exec.clone());
    } else {
        let end = resolve_symlink(&exec, |p| {
            let base = basename(p);
            base.contains("g++") || base.contains("gcc")
        });
        let base = basename(&end);
        if base.contains("g++") || base.contains("gcc") || base.contains("clang") {
            resolved = Some(end);
        }
    }
    let resolved = strip_plus_plus(&resolved.unwrap_or_else(|| exec.clone()));

    let builder_compiler = builder_compiler_for(&exec)
        .or_else(|| builder_compiler_for(&resolved))
        .unwrap_or_else(|| exec.to_string_lossy().into_owned());

    let kind = if builder_compiler.contains("clang") {
        CompilerKind::Clang
    } else if builder_compiler.contains("g++") || builder_compiler.contains("gcc") {
        CompilerKind::Gcc
    } else {
        CompilerKind::Other
    };

    let metadata = fs::metadata(&exec)
        .map_err(|e| crate::Error::from(format!("can't stat {}: {e}", exec.display())))?;
    if !metadata.is_file() {
        return Err(crate::Error::from(format!(
            "{} is not a regular file",
            exec.display()
        )));
    }

    Ok(CompilerInfo {
        compiler: exec,
        resolved,
        builder_compiler,
        kind,
    })
}

/// What `<compiler> -v` tells us, minus the `COLLECT_*` noise that varies
/// between otherwise identical toolchains.
#[derive(Debug, Clone)]
pub struct EnvironmentInfo {
    pub hash: String,
    pub major_version: Option<u32>,
}

fn filter_collect(text: &str) -> String {
    text.lines()
        .filter(|line| !line.starts_with("COLLECT_"))
        .fold(String::with_capacity(text.len()), |mut acc, line| {
            acc.push_str(line);
            acc.push('\n');
            acc
        })
}

fn read_signature(compiler: &Path) -> crate::Result<EnvironmentInfo> {
    let output = Command::new(compiler).arg("-v").output()?;
    if !output.status.success() {
        return Err(crate::Error::from(format!(
            "{} -v exited with {}",
            compiler.display(),
            output.status
        )));
    }
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    let filtered = filter_collect(&text);

    let mut hasher = Sha1::new();
    hasher.update(filtered.as_bytes());
    let version = Regex::new(r"(?m)\b(?:gcc|clang) version (\d+)")
        .unwrap()
        .captures(&filtered)
        .and_then(|c| c[1].parse().ok());
    Ok(EnvironmentInfo {
        hash: hex::encode(hasher.finalize()),
        major_version: version,
    })
}

fn flock(file: &File, operation: libc::c_int) -> std::io::Result<()> {
    loop {
        if unsafe { libc::flock(file.as_raw_fd(), operation) } == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

fn cache_key(compiler: &Path) -> Option<String> {
    let metadata = fs::metadata(compiler).ok()?;
    let mtime = metadata.modified().ok()?;
    let secs = mtime
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?
        .as_secs();
    Some(format!("{}:{}", compiler.display(), secs))
}

fn read_cache(path: &Path) -> Option<BTreeMap<String, String>> {
    let file = File::open(path).ok()?;
    if let Err(e) = flock(&file, libc::LOCK_SH) {
        error!("Failed to lock {} for reading: {}", path.display(), e);
        return None;
    }
    let mut contents = String::new();
    let result = (&file).read_to_string(&mut contents);
    let _ = flock(&file, libc::LOCK_UN);
    result.ok()?;
    serde_json::from_str(&contents).ok()
}

fn write_cache(path: &Path, entries: &BTreeMap<String, String>) {
    if let Some(dir) = path.parent() {
        if let Err(e) = fs::create_dir_all(dir) {
            error!("Failed to create {}: {}", dir.display(), e);
            return;
        }
    }
    let file = match OpenOptions::new().create(true).read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) => {
            error!("Failed to open {} for writing: {}", path.display(), e);
            return;
        }
    };
    if flock(&file, libc::LOCK_EX | libc::LOCK_NB).is_err() {
        debug!("Cache {} is busy, skipping write", path.display());
        return;
    }
    let json = serde_json::to_string(entries).unwrap_or_default();
    let mut file = file;
    let result = file
        .rewind()
        .and_then(|_| file.write_all(json.as_bytes()))
        .and_then(|_| file.set_len(json.len() as u64));
    if let Err(e) = result {
        error!("Failed to write {}: {}", path.display(), e);
        let _ = fs::remove_file(path);
    }
    let _ = flock(&file, libc::LOCK_UN);
}

/// Environment hash (and compiler major version) for the resolved compiler,
/// backed by a flock-guarded JSON cache keyed on path and mtime. Entries
/// for older mtimes of the same compiler are dropped on rewrite.
pub fn environment_info(config: &Config, resolved: &Path) -> crate::Result<EnvironmentInfo> {
    let Some(cache_path) = config.env_cache.as_deref() else {
        return read_signature(resolved);
    };
    let Some(key) = cache_key(resolved) else {
        return read_signature(resolved);
    };
    let version_key = format!("{key}:v");

    let mut entries = read_cache(cache_path).unwrap_or_default();
    if let Some(hash) = entries.get(&key) {
        debug!("Environment cache hit for {}", key);
        return Ok(EnvironmentInfo {
            hash: hash.clone(),
            major_version: entries.get(&version_key).and_then(|v| v.parse().ok()),
        });
    }

    let info = read_signature(resolved)?;
    let prefix = format!("{}:", resolved.display());
    entries.retain(|k, _| !k.starts_with(&prefix));
    entries.insert(key, info.hash.clone());
    if let Some(major) = info.major_version {
        entries.insert(version_key, major.to_string());
    }
    write_cache(cache_path, &entries);
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::{symlink, PermissionsExt};

    fn touch_executable(path: &Path) {
        fs::write(path, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn filter_collect_drops_collect_lines() {
        let input = "Using built-in specs.\nCOLLECT_GCC=gcc\nCOLLECT_LTO_WRAPPER=/usr/lib/lto\nTarget: x86_64\n";
        let filtered = filter_collect(input);
        assert_eq!(filtered, "Using built-in specs.\nTarget: x86_64\n");
    }

    #[test]
    fn strip_plus_plus_rewrites() {
        assert_eq!(
            strip_plus_plus(Path::new("/usr/bin/g++-12")),
            PathBuf::from("/usr/bin/gcc-12")
        );
        assert_eq!(
            strip_plus_plus(Path::new("/opt/llvm/clang++")),
            PathBuf::from("/opt/llvm/clang")
        );
        assert_eq!(
            strip_plus_plus(Path::new("/usr/bin/c++")),
            PathBuf::from("/usr/bin/cc")
        );
        assert_eq!(
            strip_plus_plus(Path::new("/usr/bin/gcc")),
            PathBuf::from("/usr/bin/gcc")
        );
    }

    #[test]
    fn builder_compiler_prefers_clang_over_embedded_gxx() {
        assert_eq!(
            builder_compiler_for(Path::new("/usr/bin/clang++")).as_deref(),
            Some("/usr/bin/clang++")
        );
        assert_eq!(
            builder_compiler_for(Path::new("/usr/bin/x86_64-linux-gnu-g++")).as_deref(),
            Some("/usr/bin/g++")
        );
        assert_eq!(builder_compiler_for(Path::new("/usr/bin/ld")), None);
    }

    #[test]
    fn find_in_path_skips_wrapper_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = dir.path().join("fiskc");
        touch_executable(&wrapper);
        symlink(&wrapper, dir.path().join("cc-via-wrapper")).unwrap();

        let real = dir.path().join("mygcc");
        touch_executable(&real);

        let old_path = std::env::var_os("PATH");
        std::env::set_var("PATH", dir.path());

        assert_eq!(find_in_path("cc-via-wrapper"), None);
        assert_eq!(find_in_path("mygcc"), Some(dir.path().join("mygcc")));
        assert_eq!(find_in_path("fiskc"), None);

        match old_path {
            Some(path) => std::env::set_var("PATH", path),
            None => std::env::remove_var("PATH"),
        }
    }

    #[test]
    fn cache_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("env-cache.json");
        let mut entries = BTreeMap::new();
        entries.insert(
            "/usr/bin/gcc:1700000000".to_string(),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709".to_string(),
        );
        write_cache(&cache, &entries);
        let reread = read_cache(&cache).unwrap();
        assert_eq!(reread, entries);
    }
}
