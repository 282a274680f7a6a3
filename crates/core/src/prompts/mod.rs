use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const BUILT_IN_PROMPTS: &str = include_str!("../../prompts/default.toml");

pub type PromptArguments = HashMap<String, String>;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt `{0}` not found")]
    NotFound(String),
    #[error("missing argument `{argument}` when rendering prompt `{key}`")]
    MissingArgument { key: String, argument: String },
    #[error("failed to read prompt file `{path}`: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse built-in prompt definitions: {0}")]
    ParseBuiltIn(toml::de::Error),
    #[error("failed to parse prompt file `{path}` as TOML: {source}")]
    ParseToml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to parse prompt file `{path}` as YAML: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

#[derive(Clone, Debug)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

#[derive(Clone, Debug)]
pub struct PromptTemplate {
    key: String,
    template: String,
    segments: Vec<Segment>,
    placeholders: BTreeSet<String>,
}

impl PromptTemplate {
    fn new(key: String, template: String) -> Self {
        let (segments, placeholders) = parse_template(&template);
        Self {
            key,
            template,
            segments,
            placeholders,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.placeholders.iter().map(String::as_str)
    }

    pub fn render(&self, arguments: &PromptArguments) -> Result<String, PromptError> {
        for placeholder in &self.placeholders {
            if !arguments.contains_key(placeholder) {
                return Err(PromptError::MissingArgument {
                    key: self.key.clone(),
                    argument: placeholder.clone(),
                });
            }
        }

        let mut output = String::with_capacity(self.template.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => output.push_str(text),
                Segment::Placeholder(name) => {
                    if let Some(value) = arguments.get(name) {
                        output.push_str(value);
                    }
                }
            }
        }
        Ok(output)
    }
}

/// 提示词模板库：内建 TOML 模板加上可选的自定义目录，自定义目录里
/// 的同名模板覆盖内建版本。
#[derive(Debug)]
pub struct PromptRegistry {
    prompts: BTreeMap<String, PromptTemplate>,
    directories: Vec<PathBuf>,
}

impl PromptRegistry {
    pub fn new() -> Result<Self, PromptError> {
        Self::with_custom_directories::<&Path>(&[])
    }

    pub fn with_custom_directories<P: AsRef<Path>>(directories: &[P]) -> Result<Self, PromptError> {
        let mut registry = Self {
            prompts: BTreeMap::new(),
            directories: directories
                .iter()
                .map(|path| path.as_ref().to_path_buf())
                .collect(),
        };
        registry.reload()?;
        Ok(registry)
    }

    pub fn reload(&mut self) -> Result<(), PromptError> {
        let mut prompts = BTreeMap::new();

        let document: PromptDocument =
            toml::from_str(BUILT_IN_PROMPTS).map_err(PromptError::ParseBuiltIn)?;
        for (key, raw) in document.prompts {
            prompts.insert(key.clone(), PromptTemplate::new(key, raw.template));
        }

        for dir in self.directories.clone() {
            load_directory(&dir, &mut prompts)?;
        }

        self.prompts = prompts;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&PromptTemplate> {
        self.prompts.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.prompts.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.prompts.keys().map(String::as_str)
    }

    pub fn format(&self, key: &str, arguments: &PromptArguments) -> Result<String, PromptError> {
        let template = self
            .get(key)
            .ok_or_else(|| PromptError::NotFound(key.to_string()))?;
        template.render(arguments)
    }

    pub fn format_with<I, K, V>(&self, key: &str, arguments: I) -> Result<String, PromptError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = PromptArguments::new();
        for (argument, value) in arguments {
            map.insert(argument.into(), value.into());
        }
        self.format(key, &map)
    }
}

fn load_directory(
    dir: &Path,
    prompts: &mut BTreeMap<String, PromptTemplate>,
) -> Result<(), PromptError> {
    if !dir.is_dir() {
        return Ok(());
    }

    let read_dir = fs::read_dir(dir).map_err(|source| PromptError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|source| PromptError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        if entry.path().is_file() {
            files.push(entry.path());
        }
    }
    files.sort();

    for path in files {
        let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
            continue;
        };
        let document = match ext.to_ascii_lowercase().as_str() {
            "toml" => {
                let contents = read_prompt_file(&path)?;
                toml::from_str::<PromptDocument>(&contents).map_err(|source| {
                    PromptError::ParseToml {
                        path: path.clone(),
                        source,
                    }
                })?
            }
            "yaml" | "yml" => {
                let contents = read_prompt_file(&path)?;
                serde_yaml::from_str::<PromptDocument>(&contents).map_err(|source| {
                    PromptError::ParseYaml {
                        path: path.clone(),
                        source,
                    }
                })?
            }
            _ => continue,
        };
        for (key, raw) in document.prompts {
            prompts.insert(key.clone(), PromptTemplate::new(key, raw.template));
        }
    }

    Ok(())
}

fn read_prompt_file(path: &Path) -> Result<String, PromptError> {
    fs::read_to_string(path).map_err(|source| PromptError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Deserialize)]
struct PromptDocument {
    #[serde(default)]
    prompts: BTreeMap<String, RawPrompt>,
}

#[derive(Debug, Deserialize)]
struct RawPrompt {
    #[serde(alias = "text")]
    template: String,
}

/// `{name}` 为占位符，`{{`/`}}` 转义为字面大括号（模板里嵌 JSON 示例
/// 时会用到）。
fn parse_template(template: &str) -> (Vec<Segment>, BTreeSet<String>) {
    let mut segments = Vec::new();
    let mut placeholders = BTreeSet::new();
    let mut literal = String::new();
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == '}' {
                        closed = true;
                        break;
                    }
                    name.push(next);
                }
                let trimmed = name.trim();
                if closed && !trimmed.is_empty() {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    placeholders.insert(trimmed.to_string());
                    segments.push(Segment::Placeholder(trimmed.to_string()));
                } else {
                    literal.push('{');
                    literal.push_str(&name);
                    if closed {
                        literal.push('}');
                    }
                }
            }
            _ => literal.push(ch),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    (segments, placeholders)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn renders_builtin_outline_prompt() {
        let registry = PromptRegistry::new().expect("registry");
        let output = registry
            .format_with(
                "outline",
                [("user_intent", "一部悬疑小说"), ("min_chapters", "5")],
            )
            .expect("rendered");
        assert!(output.contains("一部悬疑小说"));
        assert!(output.contains('5'));
        assert!(output.contains("```json"));
    }

    #[test]
    fn missing_argument_is_reported() {
        let registry = PromptRegistry::new().expect("registry");
        let error = registry
            .format("outline", &PromptArguments::new())
            .expect_err("missing args");
        assert!(matches!(error, PromptError::MissingArgument { .. }));
    }

    #[test]
    fn custom_directory_overrides_builtin() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("custom.toml"),
            "[prompts.outline]\ntemplate = \"定制 {user_intent}\"\n",
        )
        .unwrap();

        let registry = PromptRegistry::with_custom_directories(&[dir.path()]).unwrap();
        let output = registry
            .format_with("outline", [("user_intent", "悬疑")])
            .unwrap();
        assert_eq!(output, "定制 悬疑");
    }

    #[test]
    fn braces_escape_to_literals() {
        let template = PromptTemplate::new("t".into(), "{{\"a\": \"{x}\"}}".into());
        let mut args = PromptArguments::new();
        args.insert("x".into(), "1".into());
        assert_eq!(template.render(&args).unwrap(), "{\"a\": \"1\"}");
    }

    #[test]
    fn every_revision_strategy_has_a_template() {
        let registry = PromptRegistry::new().expect("registry");
        for key in [
            "revision_plot",
            "revision_character",
            "revision_style",
            "revision_dialogue",
            "revision_pacing",
            "revision_description",
            "revision_logic",
            "revision_expand",
            "revision_general",
            "revision_full",
        ] {
            assert!(registry.contains(key), "missing template `{key}`");
        }
    }
}
