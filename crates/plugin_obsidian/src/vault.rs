//! Walking an Obsidian vault and parsing its markdown notes.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;
use walkdir::WalkDir;

static INLINE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)#([\p{L}\p{N}_/-]+)").expect("valid inline tag pattern"));
static WIKILINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[([^\[\]|]+)(?:\|[^\[\]]*)?\]\]").expect("valid wikilink pattern"));

#[derive(Debug, Clone, PartialEq)]
pub struct VaultNote {
    /// Vault-relative path with `/` separators.
    pub relative_path: String,
    /// File name without `.md`.
    pub name: String,
    /// Markdown body with the frontmatter removed.
    pub content: String,
    pub tags: Vec<String>,
    pub links: Vec<String>,
    pub modified: SystemTime,
}

/// What to pick up from a vault.
#[derive(Debug, Clone, Default)]
pub struct Scan {
    /// `None` disables the recency filter.
    pub since: Option<Duration>,
    /// Relative directory prefixes; empty means the whole vault.
    pub folders: Vec<String>,
    pub skip_dirs: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Frontmatter {
    #[serde(default)]
    tags: Option<TagField>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TagField {
    List(Vec<String>),
    Text(String),
}

/// Splits a leading `---` YAML block off `text`. Returns the parsed
/// frontmatter and the remaining body, or `None` when there is no valid block.
fn split_frontmatter(text: &str) -> Option<(Frontmatter, &str)> {
    let rest = text.strip_prefix("---\n").or_else(|| text.strip_prefix("---\r\n"))?;
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let yaml = &rest[..offset];
            let body = &rest[offset + line.len()..];
            let fm = if yaml.trim().is_empty() {
                Frontmatter::default()
            } else {
                serde_yaml_bw::from_str(yaml).ok()?
            };
            return Some((fm, body));
        }
        offset += line.len();
    }
    None
}

pub fn inline_tags(text: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for cap in INLINE_TAG.captures_iter(text) {
        let tag = cap[1].trim_end_matches(['/', '-']).to_string();
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

pub fn wikilinks(text: &str) -> Vec<String> {
    let mut links: Vec<String> = Vec::new();
    for cap in WIKILINK.captures_iter(text) {
        let link = cap[1].trim().to_string();
        if !link.is_empty() && !links.contains(&link) {
            links.push(link);
        }
    }
    links
}

/// Parses one note file's text.
pub fn parse_note(relative_path: String, text: &str, modified: SystemTime) -> VaultNote {
    let (fm, body) = split_frontmatter(text).unwrap_or((Frontmatter::default(), text));

    let mut tags: Vec<String> = match fm.tags {
        Some(TagField::List(list)) => list,
        Some(TagField::Text(s)) => s.split(',').map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect(),
        None => Vec::new(),
    };
    for tag in inline_tags(body) {
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }

    let name = Path::new(&relative_path)
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.strip_suffix(".md").unwrap_or(n).to_string())
        .unwrap_or_default();

    VaultNote {
        name,
        content: body.to_string(),
        links: wikilinks(body),
        tags,
        modified,
        relative_path,
    }
}

fn folder_matches(relative_dir: &str, folders: &[String]) -> bool {
    folders.is_empty()
        || folders
            .iter()
            .any(|f| relative_dir.starts_with(f.as_str()) || (f.is_empty() && relative_dir.is_empty()))
}

/// Collects the vault's markdown notes matching `scan`. Unreadable files are
/// skipped; an unreadable vault root is an error.
pub fn read_vault(vault: &Path, scan: &Scan) -> Result<Vec<VaultNote>> {
    let cutoff = scan.since.filter(|d| !d.is_zero()).and_then(|d| SystemTime::now().checked_sub(d));
    let mut notes = Vec::new();

    let walker = WalkDir::new(vault).sort_by_file_name().into_iter().filter_entry(|e| {
        if e.depth() == 0 || !e.file_type().is_dir() {
            return true;
        }
        let name = e.file_name().to_str().unwrap_or("");
        !name.starts_with('.') && !scan.skip_dirs.iter().any(|s| s == name)
    });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                return Err(e).with_context(|| format!("failed to walk vault {}", vault.display()));
            }
            Err(e) => {
                debug!(error = %e, "skipping unreadable vault entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let is_markdown = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("md"));
        if !is_markdown {
            continue;
        }

        let Some(modified) = entry.metadata().ok().and_then(|m| m.modified().ok()) else {
            continue;
        };
        if cutoff.is_some_and(|c| modified < c) {
            continue;
        }

        let relative: PathBuf = entry.path().strip_prefix(vault).unwrap_or(entry.path()).to_path_buf();
        let relative_dir = relative
            .parent()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        if !folder_matches(&relative_dir, &scan.folders) {
            continue;
        }

        let text = match std::fs::read_to_string(entry.path()) {
            Ok(text) => text,
            Err(e) => {
                debug!(path = %entry.path().display(), error = %e, "skipping unreadable note");
                continue;
            }
        };
        let relative_path = relative.to_string_lossy().replace('\\', "/");
        notes.push(parse_note(relative_path, &text, modified));
    }
    Ok(notes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontmatter_tags_as_list_or_string() {
        let note = parse_note(
            "a.md".into(),
            "---\ntitle: A\ntags:\n  - work\n  - urgent\n---\nBody #idea and #work.\n",
            SystemTime::now(),
        );
        assert_eq!(note.content, "Body #idea and #work.\n");
        assert_eq!(note.tags, vec!["work", "urgent", "idea"]);

        let note = parse_note("b.md".into(), "---\ntags: home, garden\n---\ntext", SystemTime::now());
        assert_eq!(note.tags, vec!["home", "garden"]);
        assert_eq!(note.name, "b");
    }

    #[test]
    fn broken_frontmatter_keeps_the_whole_text() {
        let text = "---\ntags: [unclosed\n---\nbody";
        let note = parse_note("c.md".into(), text, SystemTime::now());
        assert_eq!(note.content, text);

        let text = "---\nno closing fence";
        assert_eq!(parse_note("d.md".into(), text, SystemTime::now()).content, text);
    }

    #[test]
    fn headings_are_not_tags() {
        assert_eq!(inline_tags("# Title\n## Sub\nsee #project/alpha, #todo"), vec!["project/alpha", "todo"]);
        assert!(inline_tags("issue#12 is not a tag").is_empty());
    }

    #[test]
    fn wikilinks_drop_aliases_and_duplicates() {
        let links = wikilinks("[[Home]] then [[Projects/Launch|the launch]] and [[Home]]");
        assert_eq!(links, vec!["Home", "Projects/Launch"]);
    }

    #[test]
    fn vault_walk_honours_skips_and_folders() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for (path, body) in [
            ("inbox.md", "root note"),
            ("Work/plan.md", "work plan"),
            ("Work/deep/more.MD", "deeper"),
            ("Personal/diary.md", "diary"),
            (".obsidian/workspace.md", "internal"),
            ("templates/t.md", "template"),
            ("Work/image.png", "binary"),
        ] {
            let p = root.join(path);
            std::fs::create_dir_all(p.parent().unwrap()).unwrap();
            std::fs::write(p, body).unwrap();
        }

        let scan = Scan { skip_dirs: vec!["templates".into()], ..Default::default() };
        let all: Vec<_> = read_vault(root, &scan).unwrap().into_iter().map(|n| n.relative_path).collect();
        assert_eq!(all, vec!["Personal/diary.md", "Work/deep/more.MD", "Work/plan.md", "inbox.md"]);

        let scan = Scan { folders: vec!["Work".into()], ..Default::default() };
        let work: Vec<_> = read_vault(root, &scan).unwrap().into_iter().map(|n| n.relative_path).collect();
        assert_eq!(work, vec!["Work/deep/more.MD", "Work/plan.md"]);
    }

    #[test]
    fn old_notes_fall_outside_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let fresh = dir.path().join("fresh.md");
        let stale = dir.path().join("stale.md");
        std::fs::write(&fresh, "new").unwrap();
        std::fs::write(&stale, "old").unwrap();
        let week_ago = SystemTime::now() - Duration::from_secs(7 * 86_400);
        filetime::set_file_mtime(&stale, filetime::FileTime::from_system_time(week_ago)).unwrap();

        let scan = Scan { since: Some(Duration::from_secs(86_400)), ..Default::default() };
        let names: Vec<_> = read_vault(dir.path(), &scan).unwrap().into_iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["fresh"]);

        let everything = read_vault(dir.path(), &Scan::default()).unwrap();
        assert_eq!(everything.len(), 2);
    }

    #[test]
    fn missing_vault_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_vault(&dir.path().join("nope"), &Scan::default()).is_err());
    }
}
