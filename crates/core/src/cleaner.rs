//! Boilerplate removal for crawled storefront markdown.
//!
//! The line filters below are tuned to one storefront's markup: bilingual
//! banner sentences, page-builder shortcodes, navigation link rows and the
//! usual widget noise. Porting to another corpus means re-deriving these
//! lists and bumping [`CLEANING_VERSION`].

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{CleanedRecord, PageRecord, PageType};

pub const CLEANING_VERSION: &str = "v1.1";

/// Cleaned texts shorter than this are dropped entirely.
pub const MIN_CLEAN_CHARS: usize = 40;

static BANNER_LINE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)^\s*dear customers,?\s*$",
        r"(?i)^\s*dear customer kindly note that all placed orders",
        r"(?i)^\s*thank you for shopping at cell avenue store\.?\s*$",
        r"^\s*العملاء الأعزاء",
        r"^\s*كل عام و انتم بخير",
        r"^\s*يرجى ملاحظة أن جميع الطلبات",
        r"^\s*شكرًا لكم للتسوق في متجر سيل أفينيو",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("static cleaning pattern"))
    .collect()
});

const NOISE_SUBSTRINGS: &[&str] = &[
    "shopping cart",
    "scroll up",
    "start typing to see products you are looking for",
    "ابدا بالكتابة لترى المنتجات التي تبحث عنها",
    "protected by **recaptcha**",
    "recaptcha requires verification",
    "google.com/intl/en/policies/privacy",
    "google.com/intl/en/policies/terms",
    "do not follow this link or you will be banned from the site",
    "blackhole=",
    "facebook social link",
    "linkedin social link",
    "add to wishlist",
    "quick view",
    "read more description",
    "load more products",
    "show sidebar",
];

const STOPLIST: &[&str] = &["close", "search", "menu", "loading...", "previous", "next"];

static LINK_ONLY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\[.*?\]\(https?://.*?\)\s*$").expect("static cleaning pattern"));
static IMAGE_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*!\[.*?\]\(.*?\)\s*$").expect("static cleaning pattern"));
static LINKED_IMAGE_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\[!\[.*?\]\(.*?\)\]\(.*?\)\s*$").expect("static cleaning pattern"));
static MULTI_IMAGE_ONLY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:!\[.*?\]\(.*?\)\s*)+$").expect("static cleaning pattern"));
static MULTI_LINKED_IMAGE_ONLY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:\[!\[.*?\]\(.*?\)\]\(.*?\)\s*)+$").expect("static cleaning pattern")
});
static LISTING_LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*-\s*\[.*?\]\(https?://.*?\)\s*$").expect("static cleaning pattern"));
static SHORTCODE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\\?\[(vc_|la_|contact-form-7|wpum_|ultimatemember|/vc_|/la_)")
        .expect("static cleaning pattern")
});
static TABLE_SEPARATOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\|?(?:\s*:?-{2,}:?\s*\|)+\s*$").expect("static cleaning pattern"));

static SPACE_RUN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t]+").expect("static cleaning pattern"));
static BLANK_RUN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("static cleaning pattern"));

static RELATED_PRODUCTS_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\n###\s*Related products\s*\n",
        r"\n###\s*منتجات ذات صلة\s*\n",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("static cleaning pattern"))
    .collect()
});

pub fn normalize_whitespace(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let collapsed = SPACE_RUN_RE.replace_all(&unified, " ");
    BLANK_RUN_RE.replace_all(&collapsed, "\n\n").trim().to_string()
}

fn should_drop_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return false;
    }
    let lowered = trimmed.to_lowercase();

    if matches!(trimmed, "✕" | "✖" | "x") {
        return true;
    }

    if BANNER_LINE_PATTERNS.iter().any(|pattern| pattern.is_match(trimmed)) {
        return true;
    }

    if SHORTCODE_RE.is_match(trimmed) {
        return true;
    }

    if lowered.contains("<base64-image-removed>") {
        return true;
    }

    if IMAGE_LINE_RE.is_match(trimmed)
        || LINKED_IMAGE_LINE_RE.is_match(trimmed)
        || MULTI_IMAGE_ONLY_RE.is_match(trimmed)
        || MULTI_LINKED_IMAGE_ONLY_RE.is_match(trimmed)
    {
        return true;
    }

    if TABLE_SEPARATOR_RE.is_match(trimmed) {
        return true;
    }

    // Navigation/listing links are boilerplate on every page of this corpus.
    if LISTING_LINK_RE.is_match(trimmed) {
        return true;
    }

    if NOISE_SUBSTRINGS.iter().any(|noise| lowered.contains(noise)) {
        return true;
    }

    if LINK_ONLY_RE.is_match(trimmed)
        && ["privacy", "terms", "close"].iter().any(|key| lowered.contains(key))
    {
        return true;
    }

    STOPLIST.contains(&lowered.as_str())
}

/// Truncates product pages at the first related-products heading, whichever
/// language variant appears earliest.
fn strip_related_products_block(text: &str, page_type: PageType) -> &str {
    if page_type != PageType::Product {
        return text;
    }

    let cut = RELATED_PRODUCTS_MARKERS
        .iter()
        .filter_map(|pattern| pattern.find(text).map(|found| found.start()))
        .min();

    match cut {
        Some(offset) => text[..offset].trim_end(),
        None => text,
    }
}

fn dedupe_consecutive(lines: Vec<&str>) -> Vec<&str> {
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    for line in lines {
        if let Some(previous) = out.last() {
            if *previous == line && !line.trim().is_empty() {
                continue;
            }
        }
        out.push(line);
    }
    out
}

/// Removes navigational and marketing boilerplate from one page's markdown.
/// Deterministic and pure; idempotent over its own output.
pub fn clean_markdown(markdown: &str, page_type: PageType) -> String {
    let normalized = normalize_whitespace(markdown);
    let truncated = strip_related_products_block(&normalized, page_type);

    let kept: Vec<&str> = truncated
        .split('\n')
        .filter(|line| !should_drop_line(line))
        .collect();
    let deduped = dedupe_consecutive(kept);

    normalize_whitespace(&deduped.join("\n"))
}

/// Cleans one crawled record, returning `None` when the remaining text is
/// too short to be useful.
pub fn clean_record(record: &PageRecord) -> Option<CleanedRecord> {
    let text = clean_markdown(&record.markdown, record.page_type);
    if text.chars().count() < MIN_CLEAN_CHARS {
        return None;
    }

    Some(CleanedRecord {
        url: record.url.clone(),
        title: record.title.clone(),
        language: record.language,
        page_type: record.page_type,
        raw_char_count: record.markdown.chars().count(),
        clean_char_count: text.chars().count(),
        text,
        crawled_at: record.crawled_at,
        crawl_job_id: record.crawl_job_id.clone(),
        cleaned_at: Utc::now(),
        cleaning_version: CLEANING_VERSION.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn page(markdown: &str, page_type: PageType) -> PageRecord {
        PageRecord {
            url: "https://store.example/product/phone-x".to_string(),
            title: "Phone X".to_string(),
            language: crate::models::Language::En,
            page_type,
            markdown: markdown.to_string(),
            crawled_at: Utc::now(),
            crawl_job_id: "job-1".to_string(),
        }
    }

    #[test]
    fn whitespace_runs_collapse() {
        let cleaned = clean_markdown("A  \t  phone\n\n\n\nwith   specs", PageType::Other);
        assert_eq!(cleaned, "A phone\n\nwith specs");
    }

    #[test]
    fn banner_and_stoplist_lines_are_dropped() {
        let input = "Dear Customers,\nPhone X costs 89.900 KWD and ships in two working days across the country.\nclose\nMenu\n";
        let cleaned = clean_markdown(input, PageType::Product);
        assert_eq!(
            cleaned,
            "Phone X costs 89.900 KWD and ships in two working days across the country."
        );
    }

    #[test]
    fn image_and_listing_link_lines_are_dropped() {
        let input = "![banner](https://cdn.example/banner.jpg)\n- [All phones](https://store.example/product-category/phones/)\n[![thumb](x.jpg)](https://store.example/p)\nActual description line.";
        let cleaned = clean_markdown(input, PageType::Other);
        assert_eq!(cleaned, "Actual description line.");
    }

    #[test]
    fn shortcodes_and_table_separators_are_dropped() {
        let input = "\\[vc_row full_width=\"stretch\"]\n| --- | --- |\nSpec table follows here.";
        let cleaned = clean_markdown(input, PageType::Other);
        assert_eq!(cleaned, "Spec table follows here.");
    }

    #[test]
    fn related_products_tail_is_cut_for_products_only() {
        let input = "Great phone with a two year warranty.\n\n### Related products\n\nOther phone";
        let as_product = clean_markdown(input, PageType::Product);
        assert_eq!(as_product, "Great phone with a two year warranty.");

        let as_policy = clean_markdown(input, PageType::PolicySupport);
        assert!(as_policy.contains("Other phone"));
    }

    #[test]
    fn earliest_marker_wins_across_language_variants() {
        let input = "Intro.\n\n### منتجات ذات صلة\n\nmiddle\n\n### Related products\n\ntail";
        let cleaned = clean_markdown(input, PageType::Product);
        assert_eq!(cleaned, "Intro.");
    }

    #[test]
    fn consecutive_duplicate_lines_collapse() {
        let input = "Free shipping over 10 KWD\nFree shipping over 10 KWD\nSecond line";
        let cleaned = clean_markdown(input, PageType::Other);
        assert_eq!(cleaned, "Free shipping over 10 KWD\nSecond line");
    }

    #[test]
    fn cleaning_is_idempotent() {
        let input = "Dear Customers,\n\nPhone X has 256 GB of storage and a 5000 mAh battery for 129.900 KWD.\n\nclose\n";
        let once = clean_markdown(input, PageType::Product);
        let twice = clean_markdown(&once, PageType::Product);
        assert_eq!(once, twice);
    }

    #[test]
    fn short_records_are_dropped() {
        let record = page("tiny", PageType::Product);
        assert!(clean_record(&record).is_none());
    }

    #[test]
    fn boilerplate_only_records_are_dropped() {
        let record = page("close\nMenu\n✕\nshopping cart\n", PageType::Other);
        assert!(clean_record(&record).is_none());
    }

    #[test]
    fn surviving_records_carry_char_counts_and_version() {
        let record = page(
            "Phone X ships with a 120 Hz display, 256 GB storage and a two year local warranty.",
            PageType::Product,
        );
        let cleaned = clean_record(&record).expect("record should survive cleaning");
        assert_eq!(cleaned.cleaning_version, CLEANING_VERSION);
        assert_eq!(cleaned.clean_char_count, cleaned.text.chars().count());
        assert!(cleaned.raw_char_count >= cleaned.clean_char_count);
    }
}
