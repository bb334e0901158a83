//! # Question Catalog
//!
//! The categorized interview questions the study app presents. Loaded from a TOML
//! file (see `questions.toml` at the repository root); the same file is compiled
//! in as the built-in catalog.
//!
//! ## Stable Ids:
//! Cached answers are keyed by question id, so ids must not change when the file
//! is edited. A question either pins its id explicitly or gets
//! `"<category slug>-<position>"`.
//!
//! ## Rust Concepts:
//! - **#[serde(untagged)]**: A question entry may be a plain string or a table
//! - **include_str!**: Embeds the default catalog into the binary at compile time

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const BUILTIN_CATALOG: &str = include_str!("../questions.toml");

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Question {
    pub id: String,
    pub category: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Category {
    pub name: String,
    pub slug: String,
    pub questions: Vec<Question>,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(rename = "category", default)]
    categories: Vec<CategoryEntry>,
}

#[derive(Debug, Deserialize)]
struct CategoryEntry {
    name: String,
    slug: Option<String>,
    #[serde(default)]
    questions: Vec<QuestionEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum QuestionEntry {
    Text(String),
    Pinned { id: String, text: String },
}

/// All questions, grouped by category, with lookup by id.
#[derive(Debug, Clone)]
pub struct QuestionCatalog {
    categories: Vec<Category>,
    /// id -> (category index, question index)
    index: HashMap<String, (usize, usize)>,
}

impl QuestionCatalog {
    /// Parse a catalog from TOML text.
    ///
    /// ## Validation:
    /// - Question text must not be blank
    /// - Ids must be unique across the whole catalog
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(source).context("invalid question catalog")?;

        let mut categories = Vec::with_capacity(file.categories.len());
        let mut index = HashMap::new();

        for (ci, entry) in file.categories.into_iter().enumerate() {
            let slug = entry.slug.unwrap_or_else(|| slugify(&entry.name));
            let mut questions = Vec::with_capacity(entry.questions.len());

            for (qi, question) in entry.questions.into_iter().enumerate() {
                let (id, text) = match question {
                    QuestionEntry::Text(text) => (format!("{}-{}", slug, qi + 1), text),
                    QuestionEntry::Pinned { id, text } => (id, text),
                };
                if text.trim().is_empty() {
                    return Err(anyhow!("question {} in '{}' has no text", qi + 1, entry.name));
                }
                if index.insert(id.clone(), (ci, qi)).is_some() {
                    return Err(anyhow!("duplicate question id '{}'", id));
                }
                questions.push(Question {
                    id,
                    category: entry.name.clone(),
                    text: text.trim().to_string(),
                });
            }

            categories.push(Category {
                name: entry.name,
                slug,
                questions,
            });
        }

        Ok(Self { categories, index })
    }

    /// The catalog compiled into the binary.
    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(BUILTIN_CATALOG)
    }

    /// Load from `path`, or the built-in catalog when `path` is empty.
    pub fn load(path: &str) -> Result<Self> {
        if path.trim().is_empty() {
            return Self::builtin();
        }
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read question catalog {}", path))?;
        Self::from_toml_str(&source)
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    pub fn get(&self, id: &str) -> Option<&Question> {
        let &(ci, qi) = self.index.get(id)?;
        self.categories.get(ci)?.questions.get(qi)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }
}

/// Lowercase ASCII alphanumerics, everything else collapsed into single dashes.
fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}
