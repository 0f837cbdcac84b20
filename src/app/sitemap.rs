use std::collections::HashSet;

use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use tracing::{debug, warn};

use super::config::ScanLimits;
use super::error::SitemapError;
use super::fetch::RetryingFetcher;
use super::types::{SitemapDocument, SitemapEntry};

const SITEMAP_NS: &str = "http://www.sitemaps.org/schemas/sitemap/0.9";

/// Informational pages listed ahead of the per-record warning pages.
const FIXED_WARNING_PAGES: [(&str, &str, &str); 4] = [
    ("/scam", "daily", "0.8"),
    ("/verification", "weekly", "0.7"),
    ("/emergency-contacts", "monthly", "0.6"),
    ("/report-form", "monthly", "0.6"),
];

#[derive(Clone, Copy, PartialEq, Eq)]
enum Root {
    Index,
    UrlSet,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Field {
    Loc,
    LastMod,
    ChangeFreq,
    Priority,
}

impl Field {
    fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"loc" => Some(Field::Loc),
            b"lastmod" => Some(Field::LastMod),
            b"changefreq" => Some(Field::ChangeFreq),
            b"priority" => Some(Field::Priority),
            _ => None,
        }
    }
}

/// Parses a sitemap, returning an empty url set for anything unusable.
pub fn parse_sitemap(xml: &str) -> SitemapDocument {
    match try_parse_sitemap(xml) {
        Ok(doc) => doc,
        Err(SitemapError::Empty) => SitemapDocument::default(),
        Err(err) => {
            warn!(error = %err, "sitemap ignored");
            SitemapDocument::default()
        }
    }
}

pub fn try_parse_sitemap(xml: &str) -> Result<SitemapDocument, SitemapError> {
    if xml.trim().is_empty() {
        return Err(SitemapError::Empty);
    }

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut root: Option<Root> = None;
    let mut depth = 0usize;
    let mut in_item = false;
    let mut field: Option<Field> = None;
    let mut text = String::new();
    let mut current = SitemapEntry::new(String::new());
    let mut children = Vec::new();
    let mut entries = Vec::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| SitemapError::Malformed(e.to_string()))?;
        match event {
            Event::Start(e) => {
                depth += 1;
                let name = e.local_name();
                let name = name.as_ref();
                match root {
                    None => {
                        root = Some(match name {
                            b"sitemapindex" => Root::Index,
                            b"urlset" => Root::UrlSet,
                            other => {
                                return Err(SitemapError::UnknownRoot(
                                    String::from_utf8_lossy(other).into_owned(),
                                ));
                            }
                        });
                    }
                    Some(kind) if depth == 2 => {
                        in_item = matches!(
                            (kind, name),
                            (Root::Index, b"sitemap") | (Root::UrlSet, b"url")
                        );
                        current = SitemapEntry::new(String::new());
                    }
                    Some(_) if in_item && depth == 3 => {
                        field = Field::from_name(name);
                        text.clear();
                    }
                    Some(_) => {}
                }
            }
            Event::Text(e) if field.is_some() => {
                let unescaped = e
                    .unescape()
                    .map_err(|e| SitemapError::Malformed(e.to_string()))?;
                text.push_str(&unescaped);
            }
            Event::CData(e) if field.is_some() => {
                text.push_str(&String::from_utf8_lossy(&e));
            }
            Event::End(e) => {
                if depth == 3 {
                    if let Some(done) = field.take() {
                        let value = text.trim().to_string();
                        let value = (!value.is_empty()).then_some(value);
                        match done {
                            Field::Loc => current.url = value.unwrap_or_default(),
                            Field::LastMod => current.last_modified = value,
                            Field::ChangeFreq => current.change_freq = value,
                            Field::Priority => current.priority = value,
                        }
                    }
                } else if depth == 2 && in_item {
                    in_item = false;
                    let entry = std::mem::replace(&mut current, SitemapEntry::new(String::new()));
                    if !entry.url.is_empty() {
                        match (root, e.local_name().as_ref()) {
                            (Some(Root::Index), b"sitemap") => children.push(entry.url),
                            (Some(Root::UrlSet), b"url") => entries.push(entry),
                            _ => {}
                        }
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if depth != 0 {
        return Err(SitemapError::Malformed("unclosed element at end of input".to_string()));
    }
    match root {
        Some(Root::Index) => Ok(SitemapDocument::Index(children)),
        Some(Root::UrlSet) => Ok(SitemapDocument::UrlSet(entries)),
        None => Err(SitemapError::Malformed("no root element".to_string())),
    }
}

/// Fetches every source, following sitemap indexes one level deep, and returns the
/// sampled entries without duplicates in first-seen order.
pub async fn collect_entries(
    fetcher: &RetryingFetcher,
    sources: &[String],
    limits: &ScanLimits,
) -> Vec<SitemapEntry> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();

    for source in sources {
        let Some(body) = fetcher.fetch(source).await else {
            continue;
        };
        match parse_sitemap(&body) {
            SitemapDocument::UrlSet(entries) => {
                push_sampled(&mut out, &mut seen, entries, limits.max_urls_per_sitemap);
            }
            SitemapDocument::Index(children) => {
                debug!(sitemap = %source, children = children.len(), "sitemap index");
                for child in children.iter().take(limits.max_nested_sitemaps) {
                    let Some(child_body) = fetcher.fetch(child).await else {
                        continue;
                    };
                    match parse_sitemap(&child_body) {
                        SitemapDocument::UrlSet(entries) => {
                            push_sampled(&mut out, &mut seen, entries, limits.max_urls_per_sitemap);
                        }
                        SitemapDocument::Index(_) => {
                            debug!(sitemap = %child, "nested index beyond one level skipped");
                        }
                    }
                }
            }
        }
    }

    out
}

fn push_sampled(
    out: &mut Vec<SitemapEntry>,
    seen: &mut HashSet<String>,
    entries: Vec<SitemapEntry>,
    cap: usize,
) {
    for entry in entries.into_iter().take(cap) {
        if seen.insert(entry.url.clone()) {
            out.push(entry);
        }
    }
}

/// `/sitemap.xml` plus every `Sitemap:` line announced by `/robots.txt`.
pub async fn discover_sitemap_sources(fetcher: &RetryingFetcher, origin: &str) -> Vec<String> {
    let origin = origin.trim_end_matches('/');
    let mut sources = vec![format!("{origin}/sitemap.xml")];

    if let Some(robots) = fetcher.fetch(&format!("{origin}/robots.txt")).await {
        for url in robots_sitemap_lines(&robots) {
            if !sources.contains(&url) {
                sources.push(url);
            }
        }
    }
    sources
}

fn robots_sitemap_lines(robots: &str) -> Vec<String> {
    robots
        .lines()
        .map(str::trim)
        .filter(|line| line.to_ascii_lowercase().starts_with("sitemap:"))
        .filter_map(|line| line.split_once(':').map(|(_, rhs)| rhs.trim().to_string()))
        .filter(|url| !url.is_empty())
        .collect()
}

/// Renders the `<urlset>` listing the informational pages and one warning page per slug.
pub fn render_warning_sitemap(
    site_url: &str,
    slugs: &[String],
    today: &str,
) -> Result<String, SitemapError> {
    let base = site_url.trim_end_matches('/');
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(render_error)?;
    let mut urlset = BytesStart::new("urlset");
    urlset.push_attribute(("xmlns", SITEMAP_NS));
    writer.write_event(Event::Start(urlset)).map_err(render_error)?;

    let fixed = FIXED_WARNING_PAGES
        .iter()
        .map(|(path, freq, priority)| (format!("{base}{path}"), *freq, *priority));
    let records = slugs
        .iter()
        .map(|slug| (format!("{base}/scam/{slug}"), "weekly", "0.7"));
    for (loc, freq, priority) in fixed.chain(records) {
        writer
            .write_event(Event::Start(BytesStart::new("url")))
            .map_err(render_error)?;
        write_text_element(&mut writer, "loc", &loc)?;
        write_text_element(&mut writer, "lastmod", today)?;
        write_text_element(&mut writer, "changefreq", freq)?;
        write_text_element(&mut writer, "priority", priority)?;
        writer
            .write_event(Event::End(BytesEnd::new("url")))
            .map_err(render_error)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("urlset")))
        .map_err(render_error)?;

    let mut xml = String::from_utf8(writer.into_inner()).map_err(render_error)?;
    xml.push('\n');
    Ok(xml)
}

fn write_text_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    text: &str,
) -> Result<(), SitemapError> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(render_error)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(render_error)?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(render_error)?;
    Ok(())
}

fn render_error(err: impl std::fmt::Display) -> SitemapError {
    SitemapError::Render(err.to_string())
}

/// Adds a `<sitemap>` entry for `scam_sitemap_url` to an existing sitemap index.
///
/// Returns `None` when `main_xml` is not an index or already references the URL.
pub fn link_sitemap_index(main_xml: &str, scam_sitemap_url: &str, today: &str) -> Option<String> {
    let SitemapDocument::Index(children) = try_parse_sitemap(main_xml).ok()? else {
        return None;
    };
    if children.iter().any(|child| child == scam_sitemap_url) {
        return None;
    }
    let close = main_xml.rfind("</sitemapindex>")?;
    let entry = format!(
        "  <sitemap>\n    <loc>{}</loc>\n    <lastmod>{}</lastmod>\n  </sitemap>\n",
        quick_xml::escape::escape(scam_sitemap_url),
        today
    );

    let mut out = String::with_capacity(main_xml.len() + entry.len());
    out.push_str(&main_xml[..close]);
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&entry);
    out.push_str(&main_xml[close..]);
    Some(out)
}
