//! Environment for spawned shells and the login-shell bootstrap directory.

use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use tracing::{debug, warn};

/// Directories that must be on `PATH` for tools launched from a login shell,
/// ahead of whatever the host process inherited.
const SAFE_PATH_DIRS: &[&str] = &[
    "/opt/homebrew/bin",
    "/opt/homebrew/sbin",
    "/usr/local/bin",
    "/usr/local/sbin",
    "/usr/bin",
    "/bin",
    "/usr/sbin",
    "/sbin",
];

const DEFAULT_LOCALE: &str = "en_US.UTF-8";

/// Base `PATH` and locale variables handed to every spawned shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellEnvironment {
    pub path: String,
    pub lang: String,
    pub lc_ctype: String,
}

impl ShellEnvironment {
    /// Build from the current process environment.
    pub fn detect() -> Self {
        let home = std::env::var("HOME").ok();
        Self::from_parts(
            std::env::var("PATH").ok().as_deref(),
            home.as_deref(),
            std::env::var("LANG").ok().as_deref(),
            std::env::var("LC_CTYPE").ok().as_deref(),
        )
    }

    pub fn from_parts(
        inherited_path: Option<&str>,
        home: Option<&str>,
        lang: Option<&str>,
        lc_ctype: Option<&str>,
    ) -> Self {
        let mut dirs: Vec<String> = Vec::new();
        if let Some(home) = home {
            dirs.push(format!("{home}/.local/bin"));
            dirs.push(format!("{home}/.cargo/bin"));
        }
        dirs.extend(SAFE_PATH_DIRS.iter().map(|d| d.to_string()));
        if let Some(inherited) = inherited_path {
            dirs.extend(inherited.split(':').filter(|d| !d.is_empty()).map(String::from));
        }

        let mut seen = std::collections::HashSet::new();
        dirs.retain(|d| seen.insert(d.clone()));

        let non_empty = |v: Option<&str>| {
            v.filter(|s| !s.trim().is_empty())
                .unwrap_or(DEFAULT_LOCALE)
                .to_string()
        };
        let lang = non_empty(lang);
        let lc_ctype = non_empty(lc_ctype);

        Self {
            path: dirs.join(":"),
            lang,
            lc_ctype,
        }
    }

    /// Variables to set on a spawned process.
    pub fn vars(&self) -> Vec<(String, String)> {
        vec![
            ("PATH".into(), self.path.clone()),
            ("LANG".into(), self.lang.clone()),
            ("LC_CTYPE".into(), self.lc_ctype.clone()),
        ]
    }
}

// ---------------------------------------------------------------------------
// BootstrapDir
// ---------------------------------------------------------------------------

/// A `ZDOTDIR` whose rc files source the user's own dotfiles and then pin
/// the safe `PATH` so login profiles cannot drop it.
///
/// The directory must be owned by the current user and is kept at mode 0700;
/// anything else is refused rather than sourced by every new shell.
#[derive(Debug, Clone)]
pub struct BootstrapDir {
    root: PathBuf,
}

static DEFAULT_ROOT: OnceLock<PathBuf> = OnceLock::new();

impl BootstrapDir {
    /// `ptyhive-shell` under the per-user runtime dir, else the cache dir,
    /// else a uid-suffixed entry in the temp dir. The location is computed
    /// once per process.
    pub fn default_location() -> Self {
        let root = DEFAULT_ROOT.get_or_init(|| {
            dirs::runtime_dir()
                .or_else(dirs::cache_dir)
                .map(|base| base.join("ptyhive-shell"))
                .unwrap_or_else(|| {
                    std::env::temp_dir().join(format!("ptyhive-shell-{}", current_uid()))
                })
        });
        Self { root: root.clone() }
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write the rc files and return the directory.
    ///
    /// Files are rewritten on every call so a changed `PATH` never lingers
    /// from an earlier run.
    pub fn resolve(&self, env: &ShellEnvironment) -> io::Result<PathBuf> {
        self.prepare()?;
        let pin = pin_block(env);
        for (name, user_file) in [
            (".zshenv", ".zshenv"),
            (".zprofile", ".zprofile"),
            (".zshrc", ".zshrc"),
        ] {
            let body = format!(
                "# generated by ptyhive; rewritten on every session start\n\
                 [ -f \"$HOME/{user_file}\" ] && source \"$HOME/{user_file}\"\n\
                 {pin}"
            );
            write_private(&self.root.join(name), body.as_bytes())?;
        }
        debug!(dir = %self.root.display(), "shell bootstrap written");
        Ok(self.root.clone())
    }

    /// Create the directory (0700) or check an existing one: it must be a
    /// real directory owned by us, and group/other access is stripped.
    fn prepare(&self) -> io::Result<()> {
        if let Some(parent) = self.root.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::DirBuilder::new().mode(0o700).create(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }

        let meta = std::fs::symlink_metadata(&self.root)?;
        if !meta.file_type().is_dir() {
            return Err(unsafe_dir(&self.root, "not a directory"));
        }
        if meta.uid() != current_uid() {
            return Err(unsafe_dir(&self.root, "owned by another user"));
        }
        if meta.mode() & 0o077 != 0 {
            warn!(dir = %self.root.display(), "tightening bootstrap dir permissions");
            std::fs::set_permissions(&self.root, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }
}

fn current_uid() -> u32 {
    // SAFETY: getuid(2) cannot fail.
    unsafe { libc::getuid() }
}

fn unsafe_dir(path: &Path, why: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        format!("refusing bootstrap dir {}: {why}", path.display()),
    )
}

/// Replace `path` with a fresh 0600 file. The contents go to a uniquely
/// named sibling first and are renamed into place, so an existing symlink is
/// replaced rather than followed and concurrent writers never collide.
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = path.with_file_name(format!(
        "{name}.{}.{}.tmp",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&staging)?;
    if let Err(e) = file.write_all(contents) {
        let _ = std::fs::remove_file(&staging);
        return Err(e);
    }
    std::fs::rename(&staging, path)
}

/// POSIX single-quoting: the value is taken literally by any sh-family shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn pin_block(env: &ShellEnvironment) -> String {
    format!(
        "export PATH={}:\"$PATH\"\n\
         typeset -U path\n\
         [ -n \"$LANG\" ] || export LANG={}\n\
         [ -n \"$LC_CTYPE\" ] || export LC_CTYPE={}\n",
        shell_quote(&env.path),
        shell_quote(&env.lang),
        shell_quote(&env.lc_ctype)
    )
}
