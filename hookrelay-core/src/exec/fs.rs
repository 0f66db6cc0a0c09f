//! Privileged filesystem access.
//!
//! Reads are direct, falling back to `sudo cat` when a file we wrote through
//! sudo is not readable by the invoking user. Writes to shared system
//! locations go through [`HostFs`], which writes directly when running as
//! root and otherwise shells out to `tee`, `mkdir`, `ln`, `install` and
//! `chmod` through `sudo` with explicit argument vectors. In dry-run mode
//! every write is a logged no-op.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::{CommandRunner, CommandSpec, Elevation};

#[derive(Clone)]
pub struct HostFs {
    runner: Arc<dyn CommandRunner>,
    elevation: Elevation,
    dry_run: bool,
}

impl std::fmt::Debug for HostFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFs")
            .field("elevation", &self.elevation)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl HostFs {
    pub fn new(runner: Arc<dyn CommandRunner>, elevation: Elevation, dry_run: bool) -> Self {
        Self {
            runner,
            elevation,
            dry_run,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Reads a file, returning `None` if it does not exist.
    pub async fn read_to_string(&self, path: &Path) -> Result<Option<String>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied && self.elevation == Elevation::Sudo => {
                debug!("{} is not readable directly; reading through sudo", path.display());
                self.read_privileged(path).await.map(Some)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    /// Non-mutating, so it also runs in dry-run and `status`.
    async fn read_privileged(&self, path: &Path) -> Result<String> {
        self.runner
            .run(&CommandSpec::new("cat").arg(path_arg(path)).privileged())
            .await
            .map(|out| out.stdout)
            .with_context(|| format!("Failed to read {}", path.display()))
    }

    pub async fn read_link(&self, path: &Path) -> Option<PathBuf> {
        tokio::fs::read_link(path).await.ok()
    }

    // ========================================================================
    // Writes
    // ========================================================================

    pub async fn create_dir_all(&self, dir: &Path) -> Result<()> {
        if self.dry_run {
            info!("dry-run: would create directory {}", dir.display());
            return Ok(());
        }
        match self.elevation {
            Elevation::Direct => tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create directory: {}", dir.display())),
            Elevation::Sudo => self
                .privileged(CommandSpec::new("mkdir").arg("-p").arg(path_arg(dir)))
                .await
                .with_context(|| format!("Failed to create directory: {}", dir.display())),
        }
    }

    /// Replaces a file's content and optionally sets its mode.
    pub async fn write(&self, path: &Path, content: &str, mode: Option<u32>) -> Result<()> {
        if self.dry_run {
            info!(
                "dry-run: would write {} bytes to {}",
                content.len(),
                path.display()
            );
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent).await?;
        }

        match self.elevation {
            Elevation::Direct => write_replace(path, content, mode).await?,
            Elevation::Sudo => {
                // Restrict permissions before the content lands.
                if let Some(mode) = mode {
                    self.privileged(CommandSpec::new("touch").arg(path_arg(path)))
                        .await?;
                    self.chmod(path, mode).await?;
                }
                self.privileged(
                    CommandSpec::new("tee")
                        .arg(path_arg(path))
                        .stdin(content.as_bytes().to_vec()),
                )
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            }
        }
        debug!("Wrote {}", path.display());
        Ok(())
    }

    /// Appends text to a file without rewriting existing content.
    pub async fn append(&self, path: &Path, text: &str) -> Result<()> {
        if self.dry_run {
            info!("dry-run: would append {:?} to {}", text.trim_end(), path.display());
            return Ok(());
        }

        match self.elevation {
            Elevation::Direct => {
                use tokio::io::AsyncWriteExt;
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .with_context(|| format!("Failed to open {} for append", path.display()))?;
                file.write_all(text.as_bytes())
                    .await
                    .with_context(|| format!("Failed to append to {}", path.display()))?;
                file.flush().await.context("Failed to flush file")?;
            }
            Elevation::Sudo => {
                self.privileged(
                    CommandSpec::new("tee")
                        .arg("-a")
                        .arg(path_arg(path))
                        .stdin(text.as_bytes().to_vec()),
                )
                .await
                .with_context(|| format!("Failed to append to {}", path.display()))?;
            }
        }
        Ok(())
    }

    /// Removes a file or link; a missing one is not an error.
    pub async fn remove_file(&self, path: &Path) -> Result<()> {
        if self.dry_run {
            info!("dry-run: would remove {}", path.display());
            return Ok(());
        }
        match self.elevation {
            Elevation::Direct => match tokio::fs::remove_file(path).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    Err(e).with_context(|| format!("Failed to remove {}", path.display()))
                }
                _ => Ok(()),
            },
            Elevation::Sudo => self
                .privileged(CommandSpec::new("rm").arg("-f").arg(path_arg(path)))
                .await
                .with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    /// Points `link` at `target`, replacing whatever `link` was before.
    pub async fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        if self.dry_run {
            info!(
                "dry-run: would link {} -> {}",
                link.display(),
                target.display()
            );
            return Ok(());
        }

        match self.elevation {
            Elevation::Direct => {
                if tokio::fs::symlink_metadata(link).await.is_ok() {
                    tokio::fs::remove_file(link)
                        .await
                        .with_context(|| format!("Failed to replace {}", link.display()))?;
                }
                #[cfg(unix)]
                tokio::fs::symlink(target, link).await.with_context(|| {
                    format!("Failed to link {} -> {}", link.display(), target.display())
                })?;
                #[cfg(not(unix))]
                tokio::fs::copy(target, link).await.with_context(|| {
                    format!("Failed to copy {} -> {}", target.display(), link.display())
                })?;
                Ok(())
            }
            Elevation::Sudo => self
                .privileged(
                    CommandSpec::new("ln")
                        .arg("-sfn")
                        .arg(path_arg(target))
                        .arg(path_arg(link)),
                )
                .await
                .with_context(|| format!("Failed to link {}", link.display())),
        }
    }

    /// Copies an executable into place with mode 0755.
    pub async fn install_executable(&self, source: &Path, dest: &Path) -> Result<()> {
        self.install_file(source, dest, 0o755).await
    }

    /// Copies a file into place with the given mode, creating parents.
    pub async fn install_file(&self, source: &Path, dest: &Path, mode: u32) -> Result<()> {
        if self.dry_run {
            info!(
                "dry-run: would install {} to {}",
                source.display(),
                dest.display()
            );
            return Ok(());
        }

        match self.elevation {
            Elevation::Direct => {
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await.with_context(|| {
                        format!("Failed to create directory: {}", parent.display())
                    })?;
                }
                tokio::fs::copy(source, dest).await.with_context(|| {
                    format!("Failed to copy {} to {}", source.display(), dest.display())
                })?;
                set_mode_direct(dest, mode)
            }
            Elevation::Sudo => self
                .privileged(
                    CommandSpec::new("install")
                        .arg("-D")
                        .arg("-m")
                        .arg(format!("{:04o}", mode))
                        .arg(path_arg(source))
                        .arg(path_arg(dest)),
                )
                .await
                .with_context(|| format!("Failed to install {}", dest.display())),
        }
    }

    pub async fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        match self.elevation {
            Elevation::Direct => set_mode_direct(path, mode),
            Elevation::Sudo => self
                .privileged(
                    CommandSpec::new("chmod")
                        .arg(format!("{:o}", mode))
                        .arg(path_arg(path)),
                )
                .await,
        }
    }

    async fn privileged(&self, spec: CommandSpec) -> Result<()> {
        self.runner
            .run(&spec.privileged().mutating())
            .await
            .map(|_| ())
            .map_err(anyhow::Error::from)
    }
}

/// Writes a sibling temp file created with `mode`, then renames it over
/// `path`, so readers never see a partial file or looser permissions.
async fn write_replace(path: &Path, content: &str, mode: Option<u32>) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let name = path
        .file_name()
        .with_context(|| format!("Not a file path: {}", path.display()))?;
    let staged = path.with_file_name(format!(".{}.hookrelay-tmp", name.to_string_lossy()));

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(mode.unwrap_or(0o644));

    let written = async {
        let mut file = options
            .open(&staged)
            .await
            .with_context(|| format!("Failed to create {}", staged.display()))?;
        if let Some(mode) = mode {
            set_mode_direct(&staged, mode)?;
        }
        file.write_all(content.as_bytes())
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        file.sync_all().await.context("Failed to flush file")?;
        tokio::fs::rename(&staged, path)
            .await
            .with_context(|| format!("Failed to move {} into place", path.display()))
    }
    .await;

    if written.is_err() {
        let _ = tokio::fs::remove_file(&staged).await;
    }
    written
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[allow(unused_variables)]
fn set_mode_direct(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::FakeRunner;
    use crate::exec::CommandOutput;
    use tempfile::TempDir;

    fn direct(dry_run: bool) -> HostFs {
        HostFs::new(Arc::new(FakeRunner::new()), Elevation::Direct, dry_run)
    }

    #[tokio::test]
    async fn test_write_and_read_direct() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/dir/file.conf");
        let fs = direct(false);

        fs.write(&path, "content\n", Some(0o600)).await.unwrap();
        assert_eq!(
            fs.read_to_string(&path).await.unwrap().as_deref(),
            Some("content\n")
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_read_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let fs = direct(false);
        assert!(fs
            .read_to_string(&dir.path().join("missing"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file");
        let fs = direct(true);

        fs.write(&path, "x", None).await.unwrap();
        fs.append(&path, "y").await.unwrap();
        fs.symlink(&path, &dir.path().join("link")).await.unwrap();

        assert!(!path.exists());
        assert!(!dir.path().join("link").exists());
    }

    #[tokio::test]
    async fn test_append_direct() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "a\n").unwrap();
        let fs = direct(false);

        fs.append(&path, "b\n").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_replaces_existing() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let link = dir.path().join("link");
        std::fs::write(&a, "a").unwrap();
        std::fs::write(&b, "b").unwrap();
        let fs = direct(false);

        fs.symlink(&a, &link).await.unwrap();
        fs.symlink(&b, &link).await.unwrap();
        assert_eq!(fs.read_link(&link).await, Some(b));
    }

    #[tokio::test]
    async fn test_sudo_mode_uses_argv_commands() {
        let runner = Arc::new(FakeRunner::new());
        let fs = HostFs::new(runner.clone(), Elevation::Sudo, false);

        fs.write(Path::new("/etc/app/site.conf"), "data", None)
            .await
            .unwrap();
        fs.append(Path::new("/etc/hosts"), "127.0.0.1 x\n")
            .await
            .unwrap();

        let calls = runner.calls();
        assert!(calls.iter().all(|c| c.privileged && c.mutating));
        let lines = runner.lines();
        assert_eq!(lines[0], "mkdir -p /etc/app");
        assert_eq!(lines[1], "tee /etc/app/site.conf");
        assert_eq!(calls[1].stdin.as_deref(), Some(&b"data"[..]));
        assert_eq!(lines[2], "tee -a /etc/hosts");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_replaces_file_with_mode_and_no_leftovers() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "OLD=1\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        direct(false).write(&path, "NEW=1\n", Some(0o600)).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "NEW=1\n");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from(".env")]);
    }

    #[tokio::test]
    async fn test_privileged_read_is_not_mutating() {
        let runner = Arc::new(FakeRunner::new().respond(|spec| {
            (spec.program == "cat").then(|| CommandOutput::ok("SECRET=1\n"))
        }));
        let fs = HostFs::new(runner.clone(), Elevation::Sudo, true);

        let content = fs.read_privileged(Path::new("/opt/hookrelay/.env")).await.unwrap();
        assert_eq!(content, "SECRET=1\n");
        let calls = runner.calls();
        assert_eq!(runner.lines(), vec!["cat /opt/hookrelay/.env"]);
        assert!(calls[0].privileged && !calls[0].mutating);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_root_owned_file_reads_back_in_sudo_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "SECRET=1\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o000)).unwrap();
        let runner = Arc::new(FakeRunner::new().respond(|spec| {
            (spec.program == "cat").then(|| CommandOutput::ok("SECRET=1\n"))
        }));
        let fs = HostFs::new(runner.clone(), Elevation::Sudo, false);

        // Root reads directly; anyone else goes through sudo.
        let content = fs.read_to_string(&path).await.unwrap();
        assert_eq!(content.as_deref(), Some("SECRET=1\n"));
        assert!(runner.calls().iter().all(|c| c.program == "cat" && !c.mutating));
    }

    #[tokio::test]
    async fn test_remove_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("site");
        std::fs::write(&path, "x").unwrap();
        let fs = direct(false);

        fs.remove_file(&path).await.unwrap();
        assert!(!path.exists());
        fs.remove_file(&path).await.unwrap();

        let runner = Arc::new(FakeRunner::new());
        HostFs::new(runner.clone(), Elevation::Sudo, false)
            .remove_file(Path::new("/etc/nginx/sites-enabled/x"))
            .await
            .unwrap();
        assert_eq!(runner.lines(), vec!["rm -f /etc/nginx/sites-enabled/x"]);
    }

    #[tokio::test]
    async fn test_sudo_install_file_mode() {
        let runner = Arc::new(FakeRunner::new());
        let fs = HostFs::new(runner.clone(), Elevation::Sudo, false);

        fs.install_executable(Path::new("/tmp/hookrelay/mkcert"), Path::new("/usr/local/bin/mkcert"))
            .await
            .unwrap();
        assert_eq!(
            runner.lines(),
            vec!["install -D -m 0755 /tmp/hookrelay/mkcert /usr/local/bin/mkcert"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_install_executable_direct() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dest = dir.path().join("bin/tool");
        std::fs::write(&src, b"x").unwrap();

        direct(false).install_executable(&src, &dest).await.unwrap();
        let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
