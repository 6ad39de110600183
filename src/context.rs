use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::{
    config::Settings,
    error::{Result, SupervisorError},
};

/// A context as written in `contexts_dir/<name>.toml` or inline in the
/// settings. Everything is optional.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Default)]
pub struct ContextDefinition {
    /// Defaults to the file stem.
    #[serde(default)]
    pub name: Option<String>,

    /// Master entry executable. Defaults to the running executable.
    #[serde(default)]
    pub entry: Option<PathBuf>,

    #[serde(default)]
    pub args: Option<Vec<String>>,

    #[serde(default)]
    pub workers: Option<usize>,

    /// Address the reference worker listens on.
    #[serde(default)]
    pub listen: Option<String>,
}

/// A named deployment unit, fully resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    pub name: String,
    pub entry: PathBuf,
    pub entry_args: Vec<String>,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub workers: usize,
    pub listen: Option<String>,
}

impl Context {
    /// Arguments the master entry is started with.
    pub fn master_args(&self, debug: bool) -> Vec<String> {
        let mut args = self.entry_args.clone();
        args.push("--context".to_string());
        args.push(self.name.clone());
        if debug {
            args.push("--debug".to_string());
        }
        args
    }
}

pub fn validate_context_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SupervisorError::Config(format!(
            "context name {:?} may only contain letters, digits, '-' and '_'",
            name
        )))
    }
}

/// A context found on disk or inline. Failures stay attached to the name
/// they were found under so one broken file never hides the others.
pub type DiscoveredContexts = BTreeMap<String, Result<Context>>;

impl Settings {
    /// Every context found in `contexts_dir` plus the inline ones. Only an
    /// unreadable `contexts_dir` fails the whole discovery.
    pub fn discover_contexts(&self) -> Result<DiscoveredContexts> {
        let mut definitions: BTreeMap<String, Result<ContextDefinition>> = BTreeMap::new();

        if self.contexts_dir.is_dir() {
            for entry in WalkDir::new(&self.contexts_dir)
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name()
            {
                let entry = entry.map_err(|err| SupervisorError::Config(err.to_string()))?;
                let path = entry.path();
                if !entry.file_type().is_file()
                    || path.extension().and_then(|ext| ext.to_str()) != Some("toml")
                {
                    continue;
                }

                let stem = file_stem(path);
                match read_definition(path) {
                    Ok(definition) => {
                        let name = definition.name.clone().unwrap_or(stem);
                        definitions.insert(name, Ok(definition));
                    }
                    Err(err) => {
                        definitions.insert(stem, Err(err));
                    }
                }
            }
        }

        for (name, definition) in &self.contexts {
            definitions.insert(name.clone(), Ok(definition.clone()));
        }

        Ok(definitions
            .into_iter()
            .map(|(name, definition)| {
                let context = definition.and_then(|definition| self.resolve_context(&name, &definition));
                (name, context)
            })
            .collect())
    }

    pub fn context(&self, name: &str) -> Result<Context> {
        self.discover_contexts()?
            .remove(name)
            .unwrap_or_else(|| Err(SupervisorError::UnknownContext(name.to_string())))
    }

    pub fn resolve_context(&self, name: &str, definition: &ContextDefinition) -> Result<Context> {
        validate_context_name(name)?;

        let (entry, default_args) = match &definition.entry {
            Some(entry) => (entry.clone(), Vec::new()),
            None => (std::env::current_exe()?, self.master_args.clone()),
        };

        Ok(Context {
            name: name.to_string(),
            entry,
            entry_args: definition.args.clone().unwrap_or(default_args),
            pid_file: self.run_dir.join(format!("{}.pid", name)),
            log_file: self.log_dir.join(format!("{}.log", name)),
            workers: definition.workers.unwrap_or(self.workers),
            listen: definition.listen.clone(),
        })
    }
}

fn read_definition(path: &Path) -> Result<ContextDefinition> {
    let definition: ContextDefinition = toml::from_str(&fs::read_to_string(path)?)
        .map_err(|err| SupervisorError::Config(format!("{}: {}", path.display(), err)))?;
    Ok(definition)
}

/// Lossy so that a file with a non-UTF-8 name is still reported by name.
fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// The decimal pid of a context's master, as written by `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when the file is absent or does not hold a pid.
    pub fn read(&self) -> Result<Option<i32>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents.trim().parse::<i32>().ok().filter(|pid| *pid > 0)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn write(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, format!("{}\n", pid))?;
        Ok(())
    }
}
