//! Chooses between a bundled conversion script and a user override.

use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Directory name used under the platform data dir.
pub const APP_DIR: &str = "installer2iso";

/// The script a conversion will run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptChoice {
    Bundled(PathBuf),
    Override(PathBuf),
}

impl ScriptChoice {
    pub fn path(&self) -> &Path {
        match self {
            ScriptChoice::Bundled(p) | ScriptChoice::Override(p) => p,
        }
    }

    pub fn is_override(&self) -> bool {
        matches!(self, ScriptChoice::Override(_))
    }
}

/// Answer to the "an external script exists" question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptDecision {
    UseBundled,
    UseOverride,
    Cancel,
}

/// Interactive collaborator consulted when an override script exists.
pub trait ScriptChooser {
    fn choose(
        &mut self,
        name: &str,
        bundled: &Path,
        override_path: &Path,
    ) -> impl Future<Output = ScriptDecision> + Send;
}

/// Always gives the same answer. Used for `--script-choice bundled|override`.
#[derive(Debug, Clone, Copy)]
pub struct FixedChooser(pub ScriptDecision);

impl ScriptChooser for FixedChooser {
    fn choose(
        &mut self,
        _name: &str,
        _bundled: &Path,
        _override_path: &Path,
    ) -> impl Future<Output = ScriptDecision> + Send {
        std::future::ready(self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("script {name} not found (looked in {searched})")]
    NotFound { name: String, searched: String },
    #[error("script selection cancelled")]
    Cancelled,
    #[error("no override directory is configured")]
    NoOverrideDir,
    #[error("{path} already exists")]
    AlreadyExists { path: PathBuf },
    #[error("failed to copy {from} to {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Default override location: `<data dir>/installer2iso/scripts`.
pub fn default_override_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join(APP_DIR).join("scripts"))
}

#[derive(Debug, Clone)]
pub struct ScriptResolver {
    bundled_dir: PathBuf,
    override_dir: Option<PathBuf>,
}

impl ScriptResolver {
    pub fn new(bundled_dir: impl Into<PathBuf>, override_dir: Option<PathBuf>) -> Self {
        Self {
            bundled_dir: bundled_dir.into(),
            override_dir,
        }
    }

    pub fn bundled_path(&self, name: &str) -> PathBuf {
        self.bundled_dir.join(name)
    }

    pub fn override_path(&self, name: &str) -> Option<PathBuf> {
        self.override_dir.as_ref().map(|d| d.join(name))
    }

    fn not_found(&self, name: &str) -> ResolveError {
        let mut searched = self.bundled_dir.display().to_string();
        if let Some(dir) = &self.override_dir {
            searched.push_str(", ");
            searched.push_str(&dir.display().to_string());
        }
        ResolveError::NotFound {
            name: name.to_string(),
            searched,
        }
    }

    /// Pick the script to run for `name`.
    ///
    /// Without an override the bundled script is returned and `chooser` is not
    /// consulted. With one, `chooser` is asked on every call.
    pub async fn resolve<C: ScriptChooser>(
        &self,
        name: &str,
        chooser: &mut C,
    ) -> Result<ScriptChoice, ResolveError> {
        let bundled = self.bundled_path(name);
        let override_path = self.override_path(name).filter(|p| p.is_file());

        let Some(override_path) = override_path else {
            if bundled.is_file() {
                debug!(script = %bundled.display(), "using bundled script");
                return Ok(ScriptChoice::Bundled(bundled));
            }
            return Err(self.not_found(name));
        };

        match chooser.choose(name, &bundled, &override_path).await {
            ScriptDecision::UseOverride => {
                info!(script = %override_path.display(), "using external script");
                Ok(ScriptChoice::Override(override_path))
            }
            ScriptDecision::UseBundled if bundled.is_file() => {
                info!(script = %bundled.display(), "using bundled script");
                Ok(ScriptChoice::Bundled(bundled))
            }
            ScriptDecision::UseBundled => Err(self.not_found(name)),
            ScriptDecision::Cancel => Err(ResolveError::Cancelled),
        }
    }

    /// Copy the bundled script into the override directory so it can be edited.
    pub fn export_bundled(&self, name: &str, overwrite: bool) -> Result<PathBuf, ResolveError> {
        let from = self.bundled_path(name);
        if !from.is_file() {
            return Err(self.not_found(name));
        }
        let dir = self.override_dir.as_ref().ok_or(ResolveError::NoOverrideDir)?;
        let to = dir.join(name);
        if to.exists() && !overwrite {
            return Err(ResolveError::AlreadyExists { path: to });
        }
        let copy_err = |source| ResolveError::Copy {
            from: from.clone(),
            to: to.clone(),
            source,
        };
        std::fs::create_dir_all(dir).map_err(copy_err)?;
        std::fs::copy(&from, &to).map_err(copy_err)?;
        info!(from = %from.display(), to = %to.display(), "exported bundled script");
        Ok(to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAME: &str = "InstallerApp2ISO.sh";

    struct CountingChooser {
        calls: usize,
        answer: ScriptDecision,
    }

    impl ScriptChooser for CountingChooser {
        async fn choose(
            &mut self,
            name: &str,
            _bundled: &Path,
            _override_path: &Path,
        ) -> ScriptDecision {
            assert_eq!(name, NAME);
            self.calls += 1;
            self.answer
        }
    }

    fn fixture(with_override: bool) -> (tempfile::TempDir, ScriptResolver) {
        let root = tempfile::tempdir().unwrap();
        let bundled = root.path().join("bundled");
        let overrides = root.path().join("overrides");
        std::fs::create_dir_all(&bundled).unwrap();
        std::fs::create_dir_all(&overrides).unwrap();
        std::fs::write(bundled.join(NAME), "#!/bin/sh\n").unwrap();
        if with_override {
            std::fs::write(overrides.join(NAME), "#!/bin/sh\necho custom\n").unwrap();
        }
        let resolver = ScriptResolver::new(bundled, Some(overrides));
        (root, resolver)
    }

    #[tokio::test]
    async fn no_override_skips_the_chooser() {
        let (_root, resolver) = fixture(false);
        let mut chooser = CountingChooser {
            calls: 0,
            answer: ScriptDecision::UseOverride,
        };
        let choice = resolver.resolve(NAME, &mut chooser).await.unwrap();
        assert_eq!(choice, ScriptChoice::Bundled(resolver.bundled_path(NAME)));
        assert_eq!(chooser.calls, 0);
    }

    #[tokio::test]
    async fn override_prompts_on_every_resolve() {
        let (_root, resolver) = fixture(true);
        let mut chooser = CountingChooser {
            calls: 0,
            answer: ScriptDecision::UseOverride,
        };
        let first = resolver.resolve(NAME, &mut chooser).await.unwrap();
        assert!(first.is_override());
        assert_eq!(chooser.calls, 1);

        chooser.answer = ScriptDecision::UseBundled;
        let second = resolver.resolve(NAME, &mut chooser).await.unwrap();
        assert!(!second.is_override());
        assert_eq!(chooser.calls, 2);
    }

    #[tokio::test]
    async fn cancelling_the_prompt_yields_no_script() {
        let (_root, resolver) = fixture(true);
        let mut chooser = FixedChooser(ScriptDecision::Cancel);
        let err = resolver.resolve(NAME, &mut chooser).await.unwrap_err();
        assert!(matches!(err, ResolveError::Cancelled));
    }

    #[tokio::test]
    async fn missing_everywhere_is_not_found() {
        let (_root, resolver) = fixture(false);
        let mut chooser = FixedChooser(ScriptDecision::UseBundled);
        let err = resolver
            .resolve("InstallerApp2VDI.sh", &mut chooser)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { .. }));
    }

    #[test]
    fn export_refuses_to_overwrite_without_force() {
        let (_root, resolver) = fixture(false);
        let to = resolver.export_bundled(NAME, false).unwrap();
        assert!(to.is_file());
        assert!(matches!(
            resolver.export_bundled(NAME, false),
            Err(ResolveError::AlreadyExists { .. })
        ));
        assert!(resolver.export_bundled(NAME, true).is_ok());
    }
}
