//! Rule-driven page parser
//!
//! [`RulePageParser`] extracts canonical data from markup with one regular
//! expression per field. Each field rule captures its value in a group named
//! `value` (or the first group). List rules use named groups:
//!
//! - chapters: `url` and `title`, optionally `id`
//! - search results: `url` and `title`, optionally `cover`
//! - content: `body`, the block holding the chapter text

use bridge_traits::source::{
    BookStatus, BookSummary, CanonicalBook, CanonicalChapter, ContentPayload, FetchError,
    FetchResult, RawPage, RemoteValue, SearchPage,
};
use regex::{Captures, Regex};
use std::sync::OnceLock;

use crate::error::{CatalogError, Result};
use crate::html::PageParser;

fn re_all_tags() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"(?is)<[^>]+>").unwrap())
}

fn re_line_breaks() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"(?is)<br\s*/?>|</?p\b[^>]*>|</div\s*>").unwrap())
}

fn re_script_style() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"(?is)<script\b.*?</script>|<style\b.*?</style>").unwrap())
}

/// Regular expressions describing one catalog's markup.
#[derive(Debug, Clone, Default)]
pub struct PageRules {
    pub title: Option<String>,
    pub author: Option<String>,
    pub description: Option<String>,
    pub cover: Option<String>,
    /// Matches every tag on the detail page
    pub tags: Option<String>,
    pub status: Option<String>,
    pub chapter: Option<String>,
    pub search_item: Option<String>,
    pub content: Option<String>,
    /// Search pages with a next link match this
    pub next_page: Option<String>,
}

#[derive(Debug)]
struct CompiledRules {
    title: Option<Regex>,
    author: Option<Regex>,
    description: Option<Regex>,
    cover: Option<Regex>,
    tags: Option<Regex>,
    status: Option<Regex>,
    chapter: Option<Regex>,
    search_item: Option<Regex>,
    content: Option<Regex>,
    next_page: Option<Regex>,
}

#[derive(Debug)]
pub struct RulePageParser {
    rules: CompiledRules,
}

impl RulePageParser {
    /// Compile `rules`. Fails with [`CatalogError::InvalidConfig`] naming the
    /// first rule that is not a valid expression.
    pub fn new(rules: PageRules) -> Result<Self> {
        Ok(Self {
            rules: CompiledRules {
                title: compile("title", rules.title)?,
                author: compile("author", rules.author)?,
                description: compile("description", rules.description)?,
                cover: compile("cover", rules.cover)?,
                tags: compile("tags", rules.tags)?,
                status: compile("status", rules.status)?,
                chapter: compile("chapter", rules.chapter)?,
                search_item: compile("search_item", rules.search_item)?,
                content: compile("content", rules.content)?,
                next_page: compile("next_page", rules.next_page)?,
            },
        })
    }

    fn field(rule: &Option<Regex>, body: &str) -> RemoteValue<String> {
        rule.as_ref()
            .and_then(|re| re.captures(body))
            .and_then(|caps| value_group(&caps))
            .map(|raw| clean_text(&raw))
            .into()
    }
}

fn compile(name: &str, pattern: Option<String>) -> Result<Option<Regex>> {
    pattern
        .map(|pattern| {
            Regex::new(&pattern)
                .map_err(|e| CatalogError::InvalidConfig(format!("rule `{}`: {}", name, e)))
        })
        .transpose()
}

fn value_group(caps: &Captures<'_>) -> Option<String> {
    caps.name("value")
        .or_else(|| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn named(caps: &Captures<'_>, name: &str) -> Option<String> {
    caps.name(name).map(|m| m.as_str().trim().to_string())
}

fn unescape_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&#34;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Markup fragment to single-line plain text.
fn clean_text(fragment: &str) -> String {
    let stripped = re_all_tags().replace_all(fragment, " ");
    unescape_entities(&stripped)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Markup block to paragraphs, one per line break or closed block element.
fn paragraphs(block: &str) -> Vec<String> {
    let without_scripts = re_script_style().replace_all(block, "");
    let with_breaks = re_line_breaks().replace_all(&without_scripts, "\n");
    let stripped = re_all_tags().replace_all(&with_breaks, "");
    unescape_entities(&stripped)
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect()
}

impl PageParser for RulePageParser {
    fn parse_search(&self, page: &RawPage) -> FetchResult<SearchPage> {
        let rule = self.rules.search_item.as_ref().ok_or_else(|| {
            FetchError::Unknown("search is not supported by this source".to_string())
        })?;

        let items = rule
            .captures_iter(&page.body)
            .filter_map(|caps| {
                Some(BookSummary {
                    remote_key: named(&caps, "url")?,
                    title: clean_text(&named(&caps, "title")?),
                    cover_url: named(&caps, "cover"),
                })
            })
            .collect();

        let has_next_page = self
            .rules
            .next_page
            .as_ref()
            .map(|re| re.is_match(&page.body))
            .unwrap_or(false);

        Ok(SearchPage {
            items,
            has_next_page,
        })
    }

    fn parse_detail(&self, page: &RawPage) -> FetchResult<Option<CanonicalBook>> {
        let body = &page.body;
        let mut book = CanonicalBook::new(page.url.clone());
        book.title = Self::field(&self.rules.title, body);
        book.author = Self::field(&self.rules.author, body);
        book.description = self
            .rules
            .description
            .as_ref()
            .and_then(|re| re.captures(body))
            .and_then(|caps| value_group(&caps))
            .map(|raw| paragraphs(&raw).join("\n"))
            .into();
        book.cover_url = self
            .rules
            .cover
            .as_ref()
            .and_then(|re| re.captures(body))
            .and_then(|caps| value_group(&caps))
            .map(|url| unescape_entities(url.trim()))
            .into();
        book.tags = self
            .rules
            .tags
            .as_ref()
            .map(|re| {
                re.captures_iter(body)
                    .filter_map(|caps| value_group(&caps))
                    .map(|tag| clean_text(&tag))
                    .filter(|tag| !tag.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|tags| !tags.is_empty())
            .into();
        book.status = Self::field(&self.rules.status, body)
            .into_option()
            .and_then(|status| status.parse::<BookStatus>().ok())
            .into();

        let found_anything = book.title.is_known()
            || book.author.is_known()
            || book.description.is_known()
            || book.cover_url.is_known();
        Ok(found_anything.then_some(book))
    }

    fn parse_chapters(&self, page: &RawPage) -> FetchResult<Vec<CanonicalChapter>> {
        let Some(rule) = self.rules.chapter.as_ref() else {
            return Ok(Vec::new());
        };

        Ok(rule
            .captures_iter(&page.body)
            .filter_map(|caps| {
                let url = named(&caps, "url")?;
                let title = clean_text(&named(&caps, "title")?);
                let chapter = CanonicalChapter::new(title, unescape_entities(&url));
                Some(match named(&caps, "id") {
                    Some(id) => chapter.with_remote_id(id),
                    None => chapter,
                })
            })
            .collect())
    }

    fn parse_content(&self, page: &RawPage) -> FetchResult<ContentPayload> {
        let rule = self
            .rules
            .content
            .as_ref()
            .ok_or_else(|| FetchError::Unknown("no content rule configured".to_string()))?;

        let block = rule
            .captures(&page.body)
            .and_then(|caps| named(&caps, "body").or_else(|| value_group(&caps)))
            .ok_or_else(|| {
                FetchError::ParseFailure(format!("No chapter body found on {}", page.url))
            })?;

        Ok(ContentPayload::new(paragraphs(&block)))
    }
}
