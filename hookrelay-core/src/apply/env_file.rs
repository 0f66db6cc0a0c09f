//! The application's environment file.
//!
//! Managed keys follow the desired config. Secrets keep whatever value is
//! already on disk and are generated only when absent. Keys we do not manage
//! are carried over untouched after the managed block.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{inspect_file, sync_file, Outcome, ResourceKind, ResourceRecord};
use crate::config::{generate_secret, AppEnv, SECRET_KEYS};
use crate::exec::HostFs;
use crate::paths::HostPaths;

const HEADER: &str = "# Managed by hookrelay. Secrets are kept across runs.\n";
const REDACTED: &str = "<redacted>";

/// Parses `KEY=value` lines, ignoring comments and blanks.
pub fn parse_env(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Renders the file from the desired parameters and the existing content.
///
/// `secret` is called for each secret that has neither a configured nor an
/// existing value.
pub fn render_env(app: &AppEnv, existing: &BTreeMap<String, String>, mut secret: impl FnMut() -> String) -> String {
    let mut out = String::from(HEADER);
    let entries = app.entries();

    for (key, value) in &entries {
        let value = match value {
            Some(v) => v.clone(),
            None => existing
                .get(*key)
                .filter(|v| !v.is_empty())
                .cloned()
                .unwrap_or_else(&mut secret),
        };
        out.push_str(&format!("{}={}\n", key, value));
    }

    let extra: Vec<_> = existing
        .iter()
        .filter(|(k, _)| !entries.iter().any(|(managed, _)| managed == k))
        .collect();
    if !extra.is_empty() {
        out.push('\n');
        for (key, value) in extra {
            out.push_str(&format!("{}={}\n", key, value));
        }
    }
    out
}

/// Replaces secret values for display.
pub fn redact(content: &str) -> String {
    content
        .lines()
        .map(|line| match line.split_once('=') {
            Some((key, _)) if SECRET_KEYS.contains(&key.trim()) => format!("{}={}", key, REDACTED),
            _ => line.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct EnvFileApplier {
    fs: HostFs,
    path: PathBuf,
}

impl EnvFileApplier {
    pub fn new(fs: HostFs, install_dir: &Path) -> Self {
        Self {
            fs,
            path: HostPaths::env_file(install_dir),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn desired(&self, app: &AppEnv) -> anyhow::Result<String> {
        let existing = self.fs.read_to_string(&self.path).await?.unwrap_or_default();
        Ok(render_env(app, &parse_env(&existing), generate_secret))
    }

    /// Read-only check. A missing secret counts as a pending change.
    pub async fn inspect(&self, app: &AppEnv) -> ResourceRecord {
        match self.desired(app).await {
            Ok(desired) => {
                let outcome = inspect_file(&self.fs, &self.path, &desired).await;
                ResourceRecord::new(ResourceKind::EnvFile, &self.path, redact(&desired)).with_outcome(outcome)
            }
            Err(e) => ResourceRecord::new(ResourceKind::EnvFile, &self.path, String::new())
                .with_outcome(Outcome::failed(format!("{:#}", e))),
        }
    }

    pub async fn apply(&self, app: &AppEnv) -> ResourceRecord {
        let desired = match self.desired(app).await {
            Ok(desired) => desired,
            Err(e) => {
                return ResourceRecord::new(ResourceKind::EnvFile, &self.path, String::new())
                    .with_outcome(Outcome::failed(format!("{:#}", e)))
            }
        };
        let record = ResourceRecord::new(ResourceKind::EnvFile, &self.path, redact(&desired));
        match sync_file(&self.fs, &self.path, &desired, Some(0o600)).await {
            Ok(outcome) => record.with_outcome(outcome),
            Err(e) => record.with_outcome(Outcome::failed(format!("{:#}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::FakeRunner;
    use crate::exec::Elevation;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn applier(dir: &TempDir) -> EnvFileApplier {
        let fs = HostFs::new(Arc::new(FakeRunner::new()), Elevation::Direct, false);
        EnvFileApplier::new(fs, dir.path())
    }

    #[test]
    fn test_parse_env() {
        let env = parse_env("# comment\nA=1\n\n B = two \nnot a pair\n");
        assert_eq!(env.get("A").map(String::as_str), Some("1"));
        assert_eq!(env.get("B").map(String::as_str), Some("two"));
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn test_render_generates_missing_secrets_once() {
        let mut generated = 0;
        let out = render_env(&AppEnv::default(), &BTreeMap::new(), || {
            generated += 1;
            format!("secret{}", generated)
        });
        assert_eq!(generated, 2);
        assert!(out.contains("DB_PASSWORD=secret1\n"));
        assert!(out.contains("BASIC_AUTH_PASSWORD=secret2\n"));
        assert!(out.contains("PORT=8080\n"));
    }

    #[test]
    fn test_render_keeps_existing_secrets_and_extra_keys() {
        let existing = parse_env("DB_PASSWORD=keep-me\nBASIC_AUTH_PASSWORD=also\nCUSTOM=1\nPORT=1\n");
        let out = render_env(&AppEnv::default(), &existing, || panic!("must not generate"));
        assert!(out.contains("DB_PASSWORD=keep-me\n"));
        assert!(out.contains("CUSTOM=1\n"));
        assert!(out.contains("PORT=8080\n"));
        assert!(!out.contains("PORT=1\n"));
    }

    #[test]
    fn test_configured_secret_wins() {
        let app = AppEnv {
            db_password: Some("from-config".into()),
            ..Default::default()
        };
        let existing = parse_env("DB_PASSWORD=old\n");
        let out = render_env(&app, &existing, || "gen".into());
        assert!(out.contains("DB_PASSWORD=from-config\n"));
    }

    #[test]
    fn test_redact() {
        let out = redact("DB_USER=webhooks\nDB_PASSWORD=hunter2");
        assert_eq!(out, "DB_USER=webhooks\nDB_PASSWORD=<redacted>");
    }

    #[tokio::test]
    async fn test_second_apply_is_unchanged() {
        let dir = TempDir::new().unwrap();
        let applier = applier(&dir);
        let app = AppEnv::default();

        let first = applier.apply(&app).await;
        let content = std::fs::read_to_string(applier.path()).unwrap();
        let second = applier.apply(&app).await;

        assert_eq!(first.outcome, Outcome::Applied);
        assert_eq!(second.outcome, Outcome::Unchanged);
        assert_eq!(std::fs::read_to_string(applier.path()).unwrap(), content);
        assert!(!first.desired.contains(&parse_env(&content)["DB_PASSWORD"]));
        assert_eq!(applier.inspect(&app).await.outcome, Outcome::Unchanged);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(applier.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_port_change_rewrites_file() {
        let dir = TempDir::new().unwrap();
        let applier = applier(&dir);
        applier.apply(&AppEnv::default()).await;
        let password = parse_env(&std::fs::read_to_string(applier.path()).unwrap())["DB_PASSWORD"].clone();

        let app = AppEnv {
            listen_port: 9000,
            ..Default::default()
        };
        assert_eq!(applier.apply(&app).await.outcome, Outcome::Applied);
        let env = parse_env(&std::fs::read_to_string(applier.path()).unwrap());
        assert_eq!(env["PORT"], "9000");
        assert_eq!(env["DB_PASSWORD"], password);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_root_owned_file_is_unchanged_in_sudo_mode() {
        use crate::exec::CommandOutput;
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let app = AppEnv::default();
        applier(&dir).apply(&app).await;
        let path = HostPaths::env_file(dir.path());
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o000)).unwrap();

        let runner = Arc::new(FakeRunner::new().respond(move |spec| {
            (spec.program == "cat").then(|| CommandOutput::ok(content.clone()))
        }));
        let fs = HostFs::new(runner.clone(), Elevation::Sudo, false);
        let sudo = EnvFileApplier::new(fs, dir.path());

        assert_eq!(sudo.inspect(&app).await.outcome, Outcome::Unchanged);
        assert_eq!(sudo.apply(&app).await.outcome, Outcome::Unchanged);
        assert!(runner.calls().iter().all(|c| !c.mutating));
    }
}
