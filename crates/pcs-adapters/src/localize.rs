//! Display-text localization strategies.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

pub trait Localizer: Send + Sync {
    fn locale(&self) -> &str;

    /// Translate known terms; everything else passes through unchanged.
    fn localize(&self, text: &str) -> String;

    fn localize_name(&self, name: &str) -> String {
        self.localize(name)
    }

    fn localize_description(&self, description: &str) -> String {
        self.localize(description)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityLocalizer;

impl Localizer for IdentityLocalizer {
    fn locale(&self) -> &str {
        "en"
    }

    fn localize(&self, text: &str) -> String {
        text.to_string()
    }
}

#[derive(Debug, Deserialize)]
struct DictionaryFile {
    locale: String,
    terms: BTreeMap<String, String>,
}

/// Whole-word, case-insensitive term substitution. Longer terms win over
/// their prefixes ("No Refill" before "Refill").
#[derive(Debug, Clone)]
pub struct TermDictionaryLocalizer {
    locale: String,
    /// `(lowercased term, replacement)`, longest term first.
    terms: Vec<(String, String)>,
}

impl TermDictionaryLocalizer {
    pub fn new<I, K, V>(locale: impl Into<String>, terms: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut terms: Vec<(String, String)> = terms
            .into_iter()
            .map(|(k, v)| (k.into().to_ascii_lowercase(), v.into()))
            .filter(|(k, _)| !k.is_empty())
            .collect();
        terms.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Self {
            locale: locale.into(),
            terms,
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: DictionaryFile = serde_yaml::from_str(text).context("parsing term dictionary")?;
        Ok(Self::new(file.locale, file.terms))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Built-in Arabic storefront vocabulary.
    pub fn arabic() -> Self {
        Self::new(
            "ar",
            [
                ("Followers", "متابعين"),
                ("Follower", "متابع"),
                ("Likes", "إعجابات"),
                ("Like", "إعجاب"),
                ("Views", "مشاهدات"),
                ("Comments", "تعليقات"),
                ("Shares", "مشاركات"),
                ("Subscribers", "مشتركين"),
                ("Instagram", "انستغرام"),
                ("TikTok", "تيك توك"),
                ("YouTube", "يوتيوب"),
                ("Twitter", "تويتر"),
                ("Facebook", "فيسبوك"),
                ("Snapchat", "سناب شات"),
                ("High Quality", "جودة عالية"),
                ("Premium", "مميز"),
                ("Real", "حقيقي"),
                ("Fast", "سريع"),
                ("Instant", "فوري"),
                ("No Refill", "بدون تعويض"),
                ("Refill", "تعويض"),
                ("Lifetime", "مدى الحياة"),
                ("Days", "أيام"),
                ("Day", "يوم"),
                ("Speed", "سرعة"),
            ],
        )
    }
}

fn is_word_char(c: Option<char>) -> bool {
    c.is_some_and(char::is_alphanumeric)
}

impl Localizer for TermDictionaryLocalizer {
    fn locale(&self) -> &str {
        &self.locale
    }

    fn localize(&self, text: &str) -> String {
        // ASCII lowercasing keeps byte offsets aligned with `text`.
        let lower = text.to_ascii_lowercase();
        let mut out = String::with_capacity(text.len());
        let mut i = 0;

        while i < text.len() {
            let before = text[..i].chars().next_back();
            let hit = if is_word_char(before) {
                None
            } else {
                self.terms.iter().find(|(term, _)| {
                    lower[i..].starts_with(term.as_str())
                        && !is_word_char(text[i + term.len()..].chars().next())
                })
            };

            match hit {
                Some((term, replacement)) => {
                    out.push_str(replacement);
                    i += term.len();
                }
                None => {
                    let ch = text[i..].chars().next().unwrap_or_default();
                    out.push(ch);
                    i += ch.len_utf8().max(1);
                }
            }
        }
        out
    }
}
