//! HTML extraction for novel index pages and chapter pages.
//!
//! Layout follows the common "m-read / #article" reader template: chapter text lives in a
//! content container, metadata in Open Graph `og:novel:*` tags with a DOM fallback.

use crate::model::NovelMetadata;
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;
use std::sync::LazyLock;

use super::{ChapterParser, ParseError, ParsedChapter};

/// Chapter number in a chapter URL: `/chapter-12`, `/chapter_12`.
static CHAPTER_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)/chapter[-_](\d+)").expect("chapter number regex is valid")
});

static NEXT_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bnext\b").expect("next word regex is valid"));

/// Content containers, most specific first.
const CONTAINER_SELECTORS: [&str; 7] = [
    "div.m-read",
    "div#article",
    "#article",
    ".txt",
    ".txt-article",
    ".read-content",
    ".chapter-content",
];

/// `title` attributes used by next-chapter anchors.
const NEXT_TITLES: [&str; 4] = ["Read Next chapter", "Next Chapter", "Read Next Chapter", "Next"];

const TITLE_FALLBACK_CHARS: usize = 60;
const UNTITLED: &str = "Untitled Chapter";

/// Parse a CSS selector or return a parse error (avoids panics from Selector::parse).
fn parse_selector(sel: &str) -> Result<Selector, ParseError> {
    Selector::parse(sel).map_err(|e| ParseError::Selector {
        selector: sel.to_string(),
        message: e.to_string(),
    })
}

/// Visible text with whitespace collapsed.
fn element_text(e: ElementRef<'_>) -> String {
    e.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_text(scope: ElementRef<'_>, sel: &str) -> Result<Option<String>, ParseError> {
    let s = parse_selector(sel)?;
    Ok(scope
        .select(&s)
        .map(element_text)
        .find(|t| !t.is_empty()))
}

fn doc_text(doc: &Html, sel: &str) -> Result<Option<String>, ParseError> {
    first_text(doc.root_element(), sel)
}

fn meta_content(doc: &Html, property: &str) -> Result<Option<String>, ParseError> {
    let s = parse_selector(&format!("meta[property=\"{}\"]", property))?;
    Ok(doc
        .select(&s)
        .filter_map(|m| m.value().attr("content"))
        .map(|c| c.trim().to_string())
        .find(|c| !c.is_empty()))
}

/// Resolve `href` against `base`; skips fragments and script links.
pub fn absolutize(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    let base = Url::parse(base).ok()?;
    base.join(href).ok().map(String::from)
}

/// Chapter number encoded in a URL, if any.
pub fn chapter_number(url: &str) -> Option<u32> {
    CHAPTER_NUMBER
        .captures(url)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Parser for the "m-read / #article" chapter template.
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlChapterParser;

impl HtmlChapterParser {
    pub fn new() -> Self {
        Self
    }
}

impl ChapterParser for HtmlChapterParser {
    fn parse(&self, raw: &str, url: &str) -> Result<ParsedChapter, ParseError> {
        let doc = Html::parse_document(raw);
        let next_url = find_next_chapter(&doc, url)?;

        let mut container = None;
        for sel in CONTAINER_SELECTORS {
            let s = parse_selector(sel)?;
            if let Some(e) = doc.select(&s).next() {
                container = Some(e);
                break;
            }
        }
        let container = container.ok_or_else(|| ParseError::MissingContainer {
            url: url.to_string(),
        })?;

        // Paragraphs come from the nested #article when the container wraps one.
        let article = if container.value().id() == Some("article") {
            container
        } else {
            let s = parse_selector("div#article")?;
            container.select(&s).next().unwrap_or(container)
        };
        let p = parse_selector("p")?;
        let paragraphs: Vec<String> = article
            .select(&p)
            .map(element_text)
            .filter(|t| !t.is_empty())
            .collect();
        if paragraphs.is_empty() {
            return Err(ParseError::Empty {
                url: url.to_string(),
            });
        }

        let title = match first_text(container, "span.chapter")? {
            Some(t) => t,
            None => match first_text(container, "h1, h2, h3, h4")? {
                Some(t) => t,
                None => fallback_title(&paragraphs[0]),
            },
        };

        Ok(ParsedChapter {
            title,
            paragraphs,
            next_url,
        })
    }

    fn next_link(&self, raw: &str, url: &str) -> Option<String> {
        find_next_chapter(&Html::parse_document(raw), url).ok().flatten()
    }
}

fn fallback_title(first_paragraph: &str) -> String {
    if first_paragraph.chars().count() > 5 {
        let head: String = first_paragraph.chars().take(TITLE_FALLBACK_CHARS).collect();
        format!("{}...", head)
    } else {
        UNTITLED.to_string()
    }
}

/// Next-chapter link: title attribute, then rel=next, then anchor text, then chapter N+1.
fn find_next_chapter(doc: &Html, page_url: &str) -> Result<Option<String>, ParseError> {
    for title in NEXT_TITLES {
        let s = parse_selector(&format!("a[title=\"{}\"][href]", title))?;
        if let Some(url) = doc
            .select(&s)
            .filter_map(|a| a.value().attr("href"))
            .find_map(|h| absolutize(page_url, h))
        {
            return Ok(Some(url));
        }
    }

    let anchors = parse_selector("a[href]")?;
    let rel_next = doc.select(&anchors).find(|a| {
        a.value()
            .attr("rel")
            .map_or(false, |r| r.split_whitespace().any(|v| v.eq_ignore_ascii_case("next")))
    });
    if let Some(url) = rel_next.and_then(|a| a.value().attr("href").and_then(|h| absolutize(page_url, h))) {
        return Ok(Some(url));
    }

    if let Some(url) = doc
        .select(&anchors)
        .filter(|a| NEXT_WORD.is_match(&element_text(*a)))
        .filter_map(|a| a.value().attr("href"))
        .find_map(|h| absolutize(page_url, h))
    {
        return Ok(Some(url));
    }

    let Some(following) = chapter_number(page_url).and_then(|n| n.checked_add(1)) else {
        return Ok(None);
    };
    let Ok(next_pat) = Regex::new(&format!(r"(?i)/chapter[-_]{}(?:\D|$)", following)) else {
        return Ok(None);
    };
    Ok(doc
        .select(&anchors)
        .filter_map(|a| a.value().attr("href"))
        .filter(|h| next_pat.is_match(h))
        .find_map(|h| absolutize(page_url, h)))
}

/// Extract novel metadata from an index page. Missing fields fall back to Open Graph tags,
/// then to placeholders; only the title and author are always present.
pub fn parse_metadata(html: &str, page_url: &str) -> Result<NovelMetadata, ParseError> {
    let doc = Html::parse_document(html);

    let title = match doc_text(&doc, "h1.tit")? {
        Some(t) => t,
        None => match meta_content(&doc, "og:novel:novel_name")? {
            Some(t) => t,
            None => meta_content(&doc, "og:title")?.unwrap_or_else(|| "Unknown Title".to_string()),
        },
    };
    let author = match doc_text(&doc, ".glyphicon-user + .right a")? {
        Some(a) => a,
        None => meta_content(&doc, "og:novel:author")?.unwrap_or_else(|| "Unknown".to_string()),
    };

    let genre_sel = parse_selector(".glyphicon-th-list + .right a")?;
    let mut genres: Vec<String> = doc
        .select(&genre_sel)
        .map(element_text)
        .filter(|g| !g.is_empty())
        .collect();
    if genres.is_empty() {
        if let Some(g) = meta_content(&doc, "og:novel:genre")? {
            genres = g
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    let language = match doc_text(&doc, ".glyphicon-globe + .right a")? {
        Some(l) => Some(l),
        None => meta_content(&doc, "og:novel:category")?,
    };
    let status = match doc_text(&doc, ".glyphicon-time + .right")? {
        Some(s) => Some(s),
        None => meta_content(&doc, "og:novel:status")?,
    };

    let cover_url = match meta_content(&doc, "og:image")? {
        Some(c) => absolutize(page_url, &c),
        None => {
            let s = parse_selector(".m-book1 img")?;
            doc.select(&s)
                .filter_map(|i| i.value().attr("src"))
                .find_map(|src| absolutize(page_url, src))
        }
    };

    let synopsis_sel = parse_selector(".m-desc .txt .inner p")?;
    let synopsis = doc
        .select(&synopsis_sel)
        .map(element_text)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let synopsis = if synopsis.is_empty() {
        meta_content(&doc, "og:description")?
    } else {
        Some(synopsis)
    };

    let read_first_url = match meta_content(&doc, "og:novel:read_url")? {
        Some(u) => absolutize(page_url, &u),
        None => {
            let anchors = parse_selector("a[href]")?;
            doc.select(&anchors)
                .find(|a| {
                    let t = element_text(*a).to_lowercase();
                    t.contains("read") && t.contains("first")
                })
                .and_then(|a| a.value().attr("href"))
                .and_then(|h| absolutize(page_url, h))
        }
    };

    Ok(NovelMetadata {
        title,
        author,
        genres,
        language,
        status,
        cover_url,
        synopsis,
        source_url: page_url.to_string(),
        read_first_url,
    })
}

/// Chapter links on a table-of-contents page as `(number, absolute url)`, de-duplicated
/// by URL (smallest number wins) and sorted by number.
pub fn extract_chapter_links(html: &str, page_url: &str) -> Result<Vec<(u32, String)>, ParseError> {
    let doc = Html::parse_document(html);
    let anchors = parse_selector("a[href]")?;
    let mut seen: HashMap<String, u32> = HashMap::new();
    for href in doc.select(&anchors).filter_map(|a| a.value().attr("href")) {
        let Some(num) = chapter_number(href) else {
            continue;
        };
        let Some(abs) = absolutize(page_url, href) else {
            continue;
        };
        seen.entry(abs)
            .and_modify(|n| *n = (*n).min(num))
            .or_insert(num);
    }
    let mut out: Vec<(u32, String)> = seen.into_iter().map(|(u, n)| (n, u)).collect();
    out.sort();
    Ok(out)
}

/// Link to the next table-of-contents page: `rel=next` or "next" anchor text, excluding
/// links that point at a chapter.
pub fn find_next_index_page(html: &str, page_url: &str) -> Result<Option<String>, ParseError> {
    let doc = Html::parse_document(html);
    let anchors = parse_selector("a[href]")?;
    let candidates = doc.select(&anchors).filter(|a| {
        let rel_next = a
            .value()
            .attr("rel")
            .map_or(false, |r| r.split_whitespace().any(|v| v.eq_ignore_ascii_case("next")));
        rel_next || NEXT_WORD.is_match(&element_text(*a))
    });
    for a in candidates {
        let Some(href) = a.value().attr("href") else {
            continue;
        };
        if chapter_number(href).is_some() {
            continue;
        }
        if let Some(url) = absolutize(page_url, href) {
            if url != page_url {
                return Ok(Some(url));
            }
        }
    }
    Ok(None)
}
