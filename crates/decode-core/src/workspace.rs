use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::WorkspaceConfig;

const PROJECT_FILE: &str = "dbt_project.yml";
const PROFILES_FILE: &str = "profiles.yml";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: String,
    pub title: String,
    /// Model directory relative to the project root.
    pub model_dir: String,
}

impl Lesson {
    fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            model_dir: format!("models/{id}"),
        }
    }
}

pub fn default_lessons() -> Vec<Lesson> {
    vec![
        Lesson::new("hello_dbt", "Hello dbt"),
        Lesson::new("fintech", "Fintech: Digital Payments"),
        Lesson::new("cafe_chain", "Cafe Chain Analytics"),
        Lesson::new("energy_smart", "Energy Smart: IoT Data"),
    ]
}

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Lesson not found: {0}")]
    UnknownLesson(String),
    #[error("invalid user id: {0}")]
    InvalidUser(String),
    #[error("invalid model name: {0}")]
    InvalidModelName(String),
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("project template not found at {}", .0.display())]
    TemplateMissing(PathBuf),
    #[error("workspace i/o: {0}")]
    Io(#[from] io::Error),
}

/// Warehouse schema holding everything one user's runs build.
pub fn schema_for(user_id: &str) -> String {
    format!("user_{user_id}")
}

/// A (user, lesson) sandbox rooted at a directory the tool runs in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Workspace {
    user_id: String,
    lesson_id: String,
    root: PathBuf,
    model_dir: PathBuf,
}

impl Workspace {
    pub fn new(
        user_id: impl Into<String>,
        lesson_id: impl Into<String>,
        root: impl Into<PathBuf>,
        model_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            lesson_id: lesson_id.into(),
            root: root.into(),
            model_dir: model_dir.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn lesson_id(&self) -> &str {
        &self.lesson_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn schema_name(&self) -> String {
        schema_for(&self.user_id)
    }

    pub fn is_initialized(&self) -> bool {
        self.root.join(PROJECT_FILE).is_file()
    }

    pub fn model_dir(&self) -> PathBuf {
        self.root.join(&self.model_dir)
    }

    pub fn seed_dir(&self) -> PathBuf {
        self.root.join("seeds").join(&self.lesson_id)
    }

    /// Path-pattern selector restricting a seed load to this lesson.
    pub fn seed_selector(&self) -> String {
        format!("path:seeds/{}", self.lesson_id)
    }

    /// True when the lesson seed directory holds at least one CSV file.
    pub fn has_seed_files(&self) -> io::Result<bool> {
        let dir = self.seed_dir();
        if !dir.is_dir() {
            return Ok(false);
        }
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_file() && has_extension(&path, "csv") {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

pub struct WorkspaceManager {
    config: WorkspaceConfig,
    token_env: String,
    share: String,
}

impl WorkspaceManager {
    pub fn new(config: WorkspaceConfig, token_env: impl Into<String>, share: impl Into<String>) -> Self {
        Self {
            config,
            token_env: token_env.into(),
            share: share.into(),
        }
    }

    pub fn lessons(&self) -> &[Lesson] {
        &self.config.lessons
    }

    pub fn lesson(&self, id: &str) -> Option<&Lesson> {
        self.config.lessons.iter().find(|l| l.id == id)
    }

    pub fn resolve(&self, user_id: &str, lesson_id: &str) -> Result<Workspace, WorkspaceError> {
        if !is_safe_token(user_id) {
            return Err(WorkspaceError::InvalidUser(user_id.to_string()));
        }
        let lesson = self
            .lesson(lesson_id)
            .ok_or_else(|| WorkspaceError::UnknownLesson(lesson_id.to_string()))?;
        let root = self
            .config
            .base_dir
            .join(format!("user_{user_id}"))
            .join(&lesson.id);
        Ok(Workspace::new(user_id, &lesson.id, root, &lesson.model_dir))
    }

    /// Copy the project template in and write the tool profile.
    pub fn initialize(&self, workspace: &Workspace) -> Result<(), WorkspaceError> {
        let template = &self.config.template_dir;
        if !template.is_dir() {
            return Err(WorkspaceError::TemplateMissing(template.clone()));
        }
        std::fs::create_dir_all(workspace.root())?;
        let copied = copy_tree(template, workspace.root())?;
        std::fs::write(
            workspace.root().join(PROFILES_FILE),
            self.render_profile(workspace),
        )?;
        info!(
            target: "decode::workspace",
            user = workspace.user_id(),
            lesson = workspace.lesson_id(),
            root = %workspace.root().display(),
            files = copied,
            "workspace initialized"
        );
        Ok(())
    }

    fn render_profile(&self, workspace: &Workspace) -> String {
        format!(
            "{profile}:\n  target: dev\n  outputs:\n    dev:\n      type: duckdb\n      path: \"md:{share}\"\n      schema: {schema}\n      threads: {threads}\n      motherduck_token: \"{{{{ env_var('{token_env}') }}}}\"\n",
            profile = self.config.profile_name,
            share = self.share,
            schema = workspace.schema_name(),
            threads = self.config.threads,
            token_env = self.token_env,
        )
    }

    /// Sorted model names (SQL file stems) in the lesson directory.
    pub fn list_models(&self, workspace: &Workspace) -> Result<Vec<String>, WorkspaceError> {
        let dir = workspace.model_dir();
        if !workspace.is_initialized() || !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_file() && has_extension(&path, "sql") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn load_model(&self, workspace: &Workspace, name: &str) -> Result<String, WorkspaceError> {
        read_model(&model_path(workspace, name)?, name)
    }

    /// The model as shipped in the project template, before any user edit.
    pub fn load_original_model(
        &self,
        workspace: &Workspace,
        name: &str,
    ) -> Result<String, WorkspaceError> {
        if !is_safe_token(name) {
            return Err(WorkspaceError::InvalidModelName(name.to_string()));
        }
        let path = self
            .config
            .template_dir
            .join(&workspace.model_dir)
            .join(format!("{name}.sql"));
        read_model(&path, name)
    }

    pub fn save_model(
        &self,
        workspace: &Workspace,
        name: &str,
        sql: &str,
    ) -> Result<(), WorkspaceError> {
        let path = model_path(workspace, name)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, sql)?;
        debug!(
            target: "decode::workspace",
            user = workspace.user_id(),
            model = name,
            bytes = sql.len(),
            "model saved"
        );
        Ok(())
    }
}

fn model_path(workspace: &Workspace, name: &str) -> Result<PathBuf, WorkspaceError> {
    if !is_safe_token(name) {
        return Err(WorkspaceError::InvalidModelName(name.to_string()));
    }
    Ok(workspace.model_dir().join(format!("{name}.sql")))
}

fn read_model(path: &Path, name: &str) -> Result<String, WorkspaceError> {
    match std::fs::read_to_string(path) {
        Ok(sql) => Ok(sql),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            Err(WorkspaceError::ModelNotFound(name.to_string()))
        }
        Err(err) => Err(err.into()),
    }
}

/// Identifiers that are safe as path components and selector tokens.
pub(crate) fn is_safe_token(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= 128
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

fn copy_tree(from: &Path, to: &Path) -> Result<usize, WorkspaceError> {
    let mut copied = 0usize;
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = match entry.path().strip_prefix(from) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &dest)?;
            copied += 1;
        }
    }
    Ok(copied)
}
