//! Locates the Miso server entrypoint and the interpreter to run it with.

use crate::config::LaunchConfig;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

/// What to spawn for the Miso server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entrypoint {
    pub kind: EntrypointKind,
    pub command: OsString,
    pub args: Vec<OsString>,
    pub cwd: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrypointKind {
    PackagedBinary,
    PackagedScript,
    DevScript,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOs,
    Windows,
    Linux,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }

    fn dist_dir(self) -> &'static str {
        match self {
            Platform::MacOs => "macos",
            Platform::Windows => "windows",
            Platform::Linux => "linux",
        }
    }

    fn server_binary(self) -> &'static str {
        match self {
            Platform::Windows => "miso-server.exe",
            _ => "miso-server",
        }
    }

    fn default_python(self) -> &'static str {
        match self {
            Platform::Windows => "python",
            _ => "python3",
        }
    }

    fn venv_python(self, venv: &Path) -> PathBuf {
        match self {
            Platform::Windows => venv.join("Scripts").join("python.exe"),
            _ => venv.join("bin").join("python"),
        }
    }
}

/// Filesystem and interpreter checks used while resolving an entrypoint.
pub trait EnvironmentProbe: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    fn has_module(&self, interpreter: &str, module: &str) -> bool;
}

/// Probes the real filesystem and runs interpreters synchronously.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl EnvironmentProbe for SystemProbe {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn has_module(&self, interpreter: &str, module: &str) -> bool {
        if interpreter.is_empty() || module.is_empty() {
            return false;
        }
        let script = format!(
            "import importlib.util, sys; sys.exit(0 if importlib.util.find_spec(\"{module}\") else 1)"
        );
        let mut cmd = std::process::Command::new(interpreter);
        cmd.args(["-c", &script])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }
        matches!(cmd.status(), Ok(status) if status.success())
    }
}

/// Source of launch plans for the supervisor. Implementations may block.
pub trait EntrypointResolver: Send + Sync {
    fn resolve(&self) -> Option<Entrypoint>;

    /// Extra environment for the child on top of the supervisor's own.
    fn child_env(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

pub struct Launcher {
    config: LaunchConfig,
    platform: Platform,
    probe: Arc<dyn EnvironmentProbe>,
}

impl Launcher {
    pub fn new(config: LaunchConfig) -> Self {
        Self::with_probe(config, Platform::current(), Arc::new(SystemProbe))
    }

    pub fn with_probe(
        config: LaunchConfig,
        platform: Platform,
        probe: Arc<dyn EnvironmentProbe>,
    ) -> Self {
        Self {
            config,
            platform,
            probe,
        }
    }

    fn looks_like_miso_source(&self, path: &Path) -> bool {
        let pkg = path.join("miso");
        self.probe.exists(&pkg.join("broth.py")) && self.probe.exists(&pkg.join("__init__.py"))
    }

    /// A Miso checkout next to the app, or the configured one.
    pub fn dev_source_path(&self) -> Option<PathBuf> {
        if let Some(configured) = &self.config.source_path {
            if self.looks_like_miso_source(configured) {
                return Some(configured.clone());
            }
        }
        let sibling = self
            .config
            .app_path
            .parent()
            .map(|parent| parent.join("miso"))?;
        self.looks_like_miso_source(&sibling).then_some(sibling)
    }

    /// Ranked, de-duplicated interpreter candidates.
    pub fn interpreter_candidates(&self) -> Vec<String> {
        let mut candidates: Vec<String> = Vec::new();

        let app_venv = self.platform.venv_python(&self.config.app_path.join(".venv"));
        if self.probe.exists(&app_venv) {
            candidates.push(app_venv.to_string_lossy().into_owned());
        }

        if let Some(source) = self.dev_source_path() {
            let miso_venv = self.platform.venv_python(&source.join("venv"));
            if self.probe.exists(&miso_venv) {
                candidates.push(miso_venv.to_string_lossy().into_owned());
            }
        }

        match self.platform {
            Platform::Windows => candidates.push("python".to_string()),
            _ => {
                candidates.push("python3".to_string());
                candidates.push("python".to_string());
            }
        }

        let mut seen = std::collections::HashSet::new();
        candidates.retain(|c| seen.insert(c.clone()));
        candidates
    }

    pub fn pick_interpreter(&self) -> String {
        if let Some(bin) = self
            .config
            .python_bin
            .as_deref()
            .filter(|b| !b.trim().is_empty())
        {
            return bin.to_string();
        }

        let candidates = self.interpreter_candidates();
        let module = self.config.required_module.as_str();
        if let Some(found) = candidates
            .iter()
            .find(|candidate| self.probe.has_module(candidate, module))
        {
            return found.clone();
        }

        candidates
            .into_iter()
            .next()
            .unwrap_or_else(|| self.platform.default_python().to_string())
    }

    fn packaged_binary(&self) -> PathBuf {
        self.config
            .resources_path
            .join("miso_runtime")
            .join("dist")
            .join(self.platform.dist_dir())
            .join(self.platform.server_binary())
    }

    fn script_entry(&self, script: PathBuf, kind: EntrypointKind) -> Option<Entrypoint> {
        if !self.probe.exists(&script) {
            return None;
        }
        let cwd = script.parent().map(Path::to_path_buf).unwrap_or_default();
        Some(Entrypoint {
            kind,
            command: self.pick_interpreter().into(),
            args: vec![script.into_os_string()],
            cwd,
        })
    }

    pub fn resolve_entrypoint(&self) -> Option<Entrypoint> {
        if self.config.packaged {
            let binary = self.packaged_binary();
            if self.probe.exists(&binary) {
                let cwd = binary.parent().map(Path::to_path_buf).unwrap_or_default();
                return Some(Entrypoint {
                    kind: EntrypointKind::PackagedBinary,
                    command: binary.into_os_string(),
                    args: Vec::new(),
                    cwd,
                });
            }

            let script = self
                .config
                .resources_path
                .join("miso_runtime")
                .join("server")
                .join("main.py");
            return self.script_entry(script, EntrypointKind::PackagedScript);
        }

        let script = self
            .config
            .app_path
            .join("miso_runtime")
            .join("server")
            .join("main.py");
        self.script_entry(script, EntrypointKind::DevScript)
    }
}

impl EntrypointResolver for Launcher {
    fn resolve(&self) -> Option<Entrypoint> {
        self.resolve_entrypoint()
    }

    fn child_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("MISO_PROVIDER".to_string(), self.config.provider.clone()),
            ("MISO_MODEL".to_string(), self.config.model.clone()),
        ];
        if !self.config.packaged {
            if let Some(source) = self.dev_source_path() {
                env.push((
                    "MISO_SOURCE_PATH".to_string(),
                    source.to_string_lossy().into_owned(),
                ));
            }
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[derive(Default)]
    struct FakeProbe {
        files: HashSet<PathBuf>,
        with_module: HashSet<String>,
    }

    impl FakeProbe {
        fn file(mut self, path: impl Into<PathBuf>) -> Self {
            self.files.insert(path.into());
            self
        }

        fn module_in(mut self, interpreter: &str) -> Self {
            self.with_module.insert(interpreter.to_string());
            self
        }
    }

    impl EnvironmentProbe for FakeProbe {
        fn exists(&self, path: &Path) -> bool {
            self.files.contains(path)
        }

        fn has_module(&self, interpreter: &str, _module: &str) -> bool {
            self.with_module.contains(interpreter)
        }
    }

    fn config(packaged: bool) -> LaunchConfig {
        LaunchConfig {
            app_path: PathBuf::from("/apps/pupu"),
            resources_path: PathBuf::from("/apps/pupu/resources"),
            packaged,
            ..LaunchConfig::default()
        }
    }

    fn launcher(cfg: LaunchConfig, platform: Platform, probe: FakeProbe) -> Launcher {
        Launcher::with_probe(cfg, platform, Arc::new(probe))
    }

    #[test]
    fn packaged_binary_wins_when_present() {
        let binary = "/apps/pupu/resources/miso_runtime/dist/linux/miso-server";
        let probe = FakeProbe::default()
            .file(binary)
            .file("/apps/pupu/resources/miso_runtime/server/main.py");
        let entry = launcher(config(true), Platform::Linux, probe)
            .resolve_entrypoint()
            .expect("entrypoint");

        assert_eq!(entry.kind, EntrypointKind::PackagedBinary);
        assert_eq!(entry.command, OsString::from(binary));
        assert!(entry.args.is_empty());
        assert_eq!(
            entry.cwd,
            PathBuf::from("/apps/pupu/resources/miso_runtime/dist/linux")
        );
    }

    #[test]
    fn windows_binary_has_exe_suffix() {
        let binary = "/apps/pupu/resources/miso_runtime/dist/windows/miso-server.exe";
        let probe = FakeProbe::default().file(binary);
        let entry = launcher(config(true), Platform::Windows, probe)
            .resolve_entrypoint()
            .expect("entrypoint");
        assert_eq!(entry.command, OsString::from(binary));
    }

    #[test]
    fn packaged_script_falls_back_to_interpreter() {
        let script = "/apps/pupu/resources/miso_runtime/server/main.py";
        let probe = FakeProbe::default().file(script).module_in("python");
        let entry = launcher(config(true), Platform::MacOs, probe)
            .resolve_entrypoint()
            .expect("entrypoint");

        assert_eq!(entry.kind, EntrypointKind::PackagedScript);
        assert_eq!(entry.command, OsString::from("python"));
        assert_eq!(entry.args, vec![OsString::from(script)]);
    }

    #[test]
    fn packaged_without_artifacts_is_not_found() {
        let probe = FakeProbe::default().file("/apps/pupu/miso_runtime/server/main.py");
        assert!(launcher(config(true), Platform::Linux, probe)
            .resolve_entrypoint()
            .is_none());
    }

    #[test]
    fn dev_script_is_used_when_not_packaged() {
        let probe = FakeProbe::default().file("/apps/pupu/miso_runtime/server/main.py");
        let entry = launcher(config(false), Platform::Linux, probe)
            .resolve_entrypoint()
            .expect("entrypoint");

        assert_eq!(entry.kind, EntrypointKind::DevScript);
        assert_eq!(entry.cwd, PathBuf::from("/apps/pupu/miso_runtime/server"));
        // nothing has flask, so the first candidate is used
        assert_eq!(entry.command, OsString::from("python3"));
    }

    #[test]
    fn override_interpreter_wins_outright() {
        let mut cfg = config(false);
        cfg.python_bin = Some("/opt/py/bin/python3.11".to_string());
        let probe = FakeProbe::default()
            .file("/apps/pupu/miso_runtime/server/main.py")
            .module_in("python3");
        let entry = launcher(cfg, Platform::Linux, probe)
            .resolve_entrypoint()
            .expect("entrypoint");
        assert_eq!(entry.command, OsString::from("/opt/py/bin/python3.11"));
    }

    #[test]
    fn candidates_rank_venvs_first() {
        let probe = FakeProbe::default()
            .file("/apps/pupu/.venv/bin/python")
            .file("/apps/miso/miso/broth.py")
            .file("/apps/miso/miso/__init__.py")
            .file("/apps/miso/venv/bin/python");
        let l = launcher(config(false), Platform::Linux, probe);

        assert_eq!(
            l.interpreter_candidates(),
            vec![
                "/apps/pupu/.venv/bin/python",
                "/apps/miso/venv/bin/python",
                "python3",
                "python"
            ]
        );
    }

    #[test]
    fn first_candidate_with_required_module_is_picked() {
        let probe = FakeProbe::default()
            .file("/apps/pupu/.venv/bin/python")
            .module_in("python3");
        let l = launcher(config(false), Platform::Linux, probe);
        assert_eq!(l.pick_interpreter(), "python3");
    }

    #[test]
    fn windows_only_offers_python() {
        let l = launcher(config(false), Platform::Windows, FakeProbe::default());
        assert_eq!(l.interpreter_candidates(), vec!["python"]);
        assert_eq!(l.pick_interpreter(), "python");
    }

    #[test]
    fn configured_source_path_must_look_like_miso() {
        let mut cfg = config(false);
        cfg.source_path = Some(PathBuf::from("/src/not-miso"));
        let probe = FakeProbe::default()
            .file("/apps/miso/miso/broth.py")
            .file("/apps/miso/miso/__init__.py");
        let l = launcher(cfg, Platform::Linux, probe);
        assert_eq!(l.dev_source_path(), Some(PathBuf::from("/apps/miso")));
    }

    #[test]
    fn dev_child_env_exports_source_path() {
        let probe = FakeProbe::default()
            .file("/apps/miso/miso/broth.py")
            .file("/apps/miso/miso/__init__.py");
        let env = launcher(config(false), Platform::Linux, probe).child_env();
        assert!(env.contains(&("MISO_PROVIDER".to_string(), "ollama".to_string())));
        assert!(env.contains(&("MISO_MODEL".to_string(), "deepseek-r1:14b".to_string())));
        assert!(env.contains(&("MISO_SOURCE_PATH".to_string(), "/apps/miso".to_string())));
    }

    #[test]
    fn packaged_child_env_omits_source_path() {
        let probe = FakeProbe::default()
            .file("/apps/miso/miso/broth.py")
            .file("/apps/miso/miso/__init__.py");
        let env = launcher(config(true), Platform::Linux, probe).child_env();
        assert!(env.iter().all(|(k, _)| k != "MISO_SOURCE_PATH"));
    }
}
