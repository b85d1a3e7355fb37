use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum SkillError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Pattern(#[from] regex::Error),

    #[error("unterminated {0} quote in arguments")]
    UnbalancedQuote(char),
}

/// A prompt template that can be invoked as `/name args...`.
#[derive(Debug, Clone, PartialEq)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub content: String,
    /// Directory the skill file lives in.
    pub path: PathBuf,
    pub disable_model_invocation: bool,
    pub user_invocable: bool,
}

impl Skill {
    /// Substitutes `$ARGUMENTS` with the raw argument string and `$0`..`$9`
    /// with the individual, quote-aware arguments. Placeholders without a
    /// matching argument are left as written.
    pub fn render(&self, arguments: &str) -> Result<String, SkillError> {
        let args = parse_arguments(arguments)?;
        let mut out = String::with_capacity(self.content.len() + arguments.len());
        let mut rest = self.content.as_str();

        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];

            if let Some(tail) = after.strip_prefix("ARGUMENTS") {
                out.push_str(arguments);
                rest = tail;
                continue;
            }

            let indexed = after
                .chars()
                .next()
                .and_then(|c| c.to_digit(10))
                .and_then(|i| args.get(i as usize));
            match indexed {
                Some(arg) => {
                    out.push_str(arg);
                    rest = &after[1..];
                }
                None => {
                    out.push('$');
                    rest = after;
                }
            }
        }

        out.push_str(rest);
        Ok(out)
    }

    /// Wraps rendered content with the skill header the model sees.
    pub fn format_content(&self, rendered: &str) -> String {
        format!(
            "[Skill: {}]\nBase path: {}\n\n{}",
            self.name,
            self.path.display(),
            rendered
        )
    }
}

/// Splits on whitespace, keeping single- or double-quoted runs together.
fn parse_arguments(arguments: &str) -> Result<Vec<String>, SkillError> {
    let mut result = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in arguments.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    result.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }

    if let Some(q) = quote {
        return Err(SkillError::UnbalancedQuote(q));
    }
    if !current.is_empty() {
        result.push(current);
    }
    Ok(result)
}

/// Splits `/name rest of line` into the skill name and its trimmed arguments.
pub fn parse_invocation(text: &str) -> (&str, &str) {
    let text = text.strip_prefix('/').unwrap_or(text);
    match text.split_once(' ') {
        Some((name, args)) => (name, args.trim()),
        None => (text, ""),
    }
}

/// Skills loaded from a directory of `<name>.md` files and
/// `<name>/SKILL.md` folders.
#[derive(Debug, Default)]
pub struct SkillRegistry {
    skills: BTreeMap<String, Skill>,
}

impl SkillRegistry {
    /// Loads every skill under `dir`. A missing directory yields an empty
    /// registry; unreadable skill files are skipped with a warning.
    pub fn load(dir: &Path) -> Result<Self, SkillError> {
        let front_matter = Regex::new(r"(?s)\A---[ \t]*\r?\n(.*?)\r?\n---[ \t]*(?:\r?\n|\z)")?;
        let mut skills = BTreeMap::new();

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self { skills })
            }
            Err(source) => {
                return Err(SkillError::Io {
                    path: dir.to_path_buf(),
                    source,
                })
            }
        };

        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            let file = if path.is_dir() {
                path.join("SKILL.md")
            } else if path.extension().is_some_and(|ext| ext == "md") {
                path
            } else {
                continue;
            };
            if !file.is_file() {
                continue;
            }

            match load_skill_file(&file, &front_matter) {
                Ok(skill) => {
                    debug!(name = %skill.name, path = %file.display(), "loaded skill");
                    skills.insert(skill.name.clone(), skill);
                }
                Err(err) => warn!(path = %file.display(), error = %err, "skipping skill"),
            }
        }

        Ok(Self { skills })
    }

    pub fn get(&self, name: &str) -> Option<&Skill> {
        self.skills.get(name)
    }

    /// Skills a user may call as slash commands, ordered by name.
    pub fn user_invocable(&self) -> impl Iterator<Item = &Skill> {
        self.skills.values().filter(|skill| skill.user_invocable)
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}

#[cfg(test)]
impl SkillRegistry {
    pub(crate) fn from_skills(list: Vec<Skill>) -> Self {
        Self {
            skills: list.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }
}

fn load_skill_file(path: &Path, front_matter: &Regex) -> Result<Skill, SkillError> {
    let raw = std::fs::read_to_string(path).map_err(|source| SkillError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw = raw.trim_start();

    let (header, body) = match front_matter.captures(raw) {
        Some(caps) => {
            let whole = caps.get(0).map_or(0, |m| m.end());
            (caps.get(1).map_or("", |m| m.as_str()), &raw[whole..])
        }
        None => ("", raw),
    };

    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut skill = Skill {
        name: String::new(),
        description: String::new(),
        content: body.trim().to_string(),
        path: dir,
        disable_model_invocation: false,
        user_invocable: true,
    };

    for line in header.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
        match key.trim() {
            "name" => skill.name = value.to_string(),
            "description" => skill.description = value.to_string(),
            "disable-model-invocation" | "disable_model_invocation" => {
                skill.disable_model_invocation = value == "true"
            }
            "user-invocable" | "user_invocable" => skill.user_invocable = value != "false",
            _ => {}
        }
    }

    if skill.name.is_empty() {
        skill.name = derive_name(path);
    }
    Ok(skill)
}

fn derive_name(path: &Path) -> String {
    let from_dir = path.file_name().is_some_and(|f| f == "SKILL.md");
    let source = if from_dir { path.parent() } else { Some(path) };
    source
        .and_then(|p| if from_dir { p.file_name() } else { p.file_stem() })
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skill(content: &str) -> Skill {
        Skill {
            name: "review".to_string(),
            description: "Review a file".to_string(),
            content: content.to_string(),
            path: PathBuf::from("/skills/review"),
            disable_model_invocation: false,
            user_invocable: true,
        }
    }

    #[test]
    fn render_substitutes_whole_and_indexed_arguments() {
        let s = skill("Review $0 for $1. Full request: $ARGUMENTS. Missing: $5, cost $");
        let out = s.render("src/main.rs \"error handling\"").unwrap();
        assert_eq!(
            out,
            "Review src/main.rs for error handling. Full request: src/main.rs \"error handling\". Missing: $5, cost $"
        );
    }

    #[test]
    fn render_does_not_rescan_substituted_text() {
        let s = skill("$0 then $1");
        assert_eq!(s.render("'$1' b").unwrap(), "$1 then b");
    }

    #[test]
    fn unbalanced_quote_is_a_render_error() {
        let s = skill("$0");
        let err = s.render("\"oops").unwrap_err();
        assert_eq!(err.to_string(), "unterminated \" quote in arguments");
    }

    #[test]
    fn format_content_adds_header() {
        let s = skill("body");
        assert_eq!(
            s.format_content("body"),
            "[Skill: review]\nBase path: /skills/review\n\nbody"
        );
    }

    #[test]
    fn invocation_splits_name_and_arguments() {
        assert_eq!(parse_invocation("/review  a b "), ("review", "a b"));
        assert_eq!(parse_invocation("/help"), ("help", ""));
    }

    #[test]
    fn registry_loads_files_and_folders() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("commit.md"),
            "---\ndescription: \"Write a commit message\"\n---\nSummarise $ARGUMENTS\n",
        )
        .unwrap();
        std::fs::create_dir(dir.path().join("deploy")).unwrap();
        std::fs::write(
            dir.path().join("deploy").join("SKILL.md"),
            "---\nname: ship\nuser-invocable: false\ndisable-model-invocation: true\n---\nShip it\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = SkillRegistry::load(dir.path()).unwrap();
        assert_eq!(registry.len(), 2);

        let commit = registry.get("commit").unwrap();
        assert_eq!(commit.description, "Write a commit message");
        assert_eq!(commit.content, "Summarise $ARGUMENTS");
        assert!(commit.user_invocable);

        let ship = registry.get("ship").unwrap();
        assert!(!ship.user_invocable);
        assert!(ship.disable_model_invocation);
        assert_eq!(ship.path, dir.path().join("deploy"));

        let names: Vec<&str> = registry.user_invocable().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["commit"]);
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SkillRegistry::load(&dir.path().join("absent")).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn file_without_front_matter_is_all_body() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plain.md"), "\n\nJust do $0\n").unwrap();

        let registry = SkillRegistry::load(dir.path()).unwrap();
        let plain = registry.get("plain").unwrap();
        assert_eq!(plain.content, "Just do $0");
        assert_eq!(plain.description, "");
    }
}
