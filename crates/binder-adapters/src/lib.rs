//! Source adapters: the PriceCharting HTML scraper and the TCGdex JSON API
//! client, each composed of a paced client, defensive parsers and the match
//! scorer into a single `resolve` operation.

use std::sync::Arc;

use async_trait::async_trait;
use binder_core::{
    select_best_match, CandidateRecord, CardDetails, CardIdentity, MatchQuery, PriceData,
    Resolution, ResolvedRecord,
};
use binder_storage::{
    FetchError, PacedClient, Store, StoreError, SOURCE_PRICECHARTING, SOURCE_TCGDEX,
};
use chrono::Utc;
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "binder-adapters";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One external source's resolve operation for a single inventory card.
#[async_trait]
pub trait ItemResolver: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Cheap liveness probe; jobs skip a source that fails it.
    async fn healthcheck(&self) -> bool {
        true
    }

    async fn resolve(&self, card: &CardIdentity) -> Result<Resolution, ResolveError>;
}

fn sel(selector: &str) -> Option<Selector> {
    Selector::parse(selector).ok()
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Parse a price like "$12.34" or "$1,234.56" into cents. Returns `None`
/// for placeholder cells ("-", "N/A") and anything else unparseable.
pub fn parse_price_cents(text: &str) -> Option<i64> {
    let dollar = text.find('$')?;
    let mut digits = String::new();
    let mut seen_dot = false;
    for ch in text[dollar + 1..].chars() {
        match ch {
            '0'..='9' => digits.push(ch),
            ',' if !seen_dot => {}
            '.' if !seen_dot => {
                digits.push('.');
                seen_dot = true;
            }
            _ => break,
        }
    }
    if digits.is_empty() || digits == "." {
        return None;
    }
    let value: f64 = digits.parse().ok()?;
    Some((value * 100.0).round() as i64)
}

/// Pull a card number out of free text: "57/111" yields "57", "#GG44"
/// yields "GG44", and a trailing digit-bearing token ("Buzzwole GX 57")
/// yields "57".
pub fn extract_card_number(text: &str) -> Option<String> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    for token in &tokens {
        if let Some((head, tail)) = token.split_once('/') {
            if !head.is_empty()
                && head.chars().all(|c| c.is_ascii_digit())
                && tail.chars().take_while(|c| c.is_ascii_digit()).count() > 0
            {
                return Some(head.to_string());
            }
        }
    }
    for token in &tokens {
        if let Some(rest) = token.strip_prefix('#') {
            if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Some(rest.to_ascii_uppercase());
            }
        }
    }
    if let Some(last) = tokens.last() {
        let looks_numeric = !last.is_empty()
            && last.chars().all(|c| c.is_ascii_alphanumeric())
            && last.chars().any(|c| c.is_ascii_digit())
            && last.len() <= 6;
        if looks_numeric && tokens.len() > 1 {
            return Some(last.to_ascii_uppercase());
        }
    }
    None
}

// ---------------------------------------------------------------------------
// PriceCharting
// ---------------------------------------------------------------------------

pub const PRICECHARTING_BASE: &str = "https://www.pricecharting.com";

/// Set names as printed in the catalog mapped to PriceCharting URL slugs.
/// Anything missing here falls back to a slug derived from the name itself.
const SET_SLUGS: &[(&str, &str)] = &[
    ("base", "base-set"),
    ("base set", "base-set"),
    ("jungle", "jungle"),
    ("fossil", "fossil"),
    ("base set 2", "base-set-2"),
    ("team rocket", "team-rocket"),
    ("gym heroes", "gym-heroes"),
    ("gym challenge", "gym-challenge"),
    ("neo genesis", "neo-genesis"),
    ("neo discovery", "neo-discovery"),
    ("neo revelation", "neo-revelation"),
    ("neo destiny", "neo-destiny"),
    ("expedition base set", "expedition"),
    ("aquapolis", "aquapolis"),
    ("skyridge", "skyridge"),
    ("ruby & sapphire", "ruby-sapphire"),
    ("firered & leafgreen", "firered-leafgreen"),
    ("team rocket returns", "team-rocket-returns"),
    ("diamond & pearl", "diamond-pearl"),
    ("heartgold & soulsilver", "heartgold-soulsilver"),
    ("black & white", "black-white"),
    ("legendary treasures", "legendary-treasures"),
    ("xy", "xy"),
    ("flashfire", "flashfire"),
    ("phantom forces", "phantom-forces"),
    ("primal clash", "primal-clash"),
    ("roaring skies", "roaring-skies"),
    ("ancient origins", "ancient-origins"),
    ("breakthrough", "breakthrough"),
    ("evolutions", "evolutions"),
    ("sun & moon", "sun-moon"),
    ("guardians rising", "guardians-rising"),
    ("burning shadows", "burning-shadows"),
    ("crimson invasion", "crimson-invasion"),
    ("ultra prism", "ultra-prism"),
    ("celestial storm", "celestial-storm"),
    ("lost thunder", "lost-thunder"),
    ("team up", "team-up"),
    ("unbroken bonds", "unbroken-bonds"),
    ("unified minds", "unified-minds"),
    ("hidden fates", "hidden-fates"),
    ("cosmic eclipse", "cosmic-eclipse"),
    ("sword & shield", "sword-shield"),
    ("darkness ablaze", "darkness-ablaze"),
    ("champions path", "champions-path"),
    ("vivid voltage", "vivid-voltage"),
    ("shining fates", "shining-fates"),
    ("chilling reign", "chilling-reign"),
    ("evolving skies", "evolving-skies"),
    ("celebrations", "celebrations"),
    ("fusion strike", "fusion-strike"),
    ("brilliant stars", "brilliant-stars"),
    ("astral radiance", "astral-radiance"),
    ("lost origin", "lost-origin"),
    ("silver tempest", "silver-tempest"),
    ("crown zenith", "crown-zenith"),
    ("scarlet & violet", "scarlet-violet"),
    ("paldea evolved", "paldea-evolved"),
    ("obsidian flames", "obsidian-flames"),
    ("paradox rift", "paradox-rift"),
    ("paldean fates", "paldean-fates"),
    ("temporal forces", "temporal-forces"),
    ("pokemon 151", "151"),
    ("151", "151"),
    ("generations", "generations"),
];

fn derived_slug(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

pub fn set_slug(set_name: &str) -> Option<String> {
    let key = set_name.trim().to_ascii_lowercase();
    if let Some((_, slug)) = SET_SLUGS.iter().find(|(name, _)| *name == key) {
        return Some((*slug).to_string());
    }
    let derived = derived_slug(&key);
    if derived.is_empty() {
        None
    } else {
        Some(derived)
    }
}

fn card_slug(name: &str, number: Option<&str>) -> String {
    let mut slug = derived_slug(name);
    if let Some(number) = number {
        let head: String = number.chars().take_while(|c| c.is_ascii_digit()).collect();
        if !head.is_empty() {
            slug.push('-');
            slug.push_str(&head);
        }
    }
    slug
}

/// Direct product-page URL built from catalog data, the cheapest lookup
/// when no external id is cached yet.
pub fn product_url(card: &CardIdentity) -> Option<String> {
    let set = set_slug(card.set_name.as_deref()?)?;
    let slug = card_slug(&card.name, card.number.as_deref());
    if slug.is_empty() {
        return None;
    }
    Some(format!("{PRICECHARTING_BASE}/game/pokemon-{set}/{slug}"))
}

pub fn offers_url(product_id: &str) -> String {
    format!("{PRICECHARTING_BASE}/offers?product={product_id}")
}

fn absolute_url(href: &str) -> String {
    if href.starts_with("http") {
        href.to_string()
    } else {
        format!("{PRICECHARTING_BASE}{href}")
    }
}

fn external_id_from_href(href: &str) -> Option<String> {
    if let Some(idx) = href.find("product=") {
        let id: String = href[idx + "product=".len()..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if !id.is_empty() {
            return Some(id);
        }
    }
    let path = href
        .trim_start_matches(PRICECHARTING_BASE)
        .trim_matches('/');
    if path.starts_with("game/") {
        return Some(path.to_string());
    }
    None
}

fn candidate_from_result_row(row: scraper::ElementRef<'_>, query_text: &str) -> Option<CandidateRecord> {
    let mut candidate = CandidateRecord::default();

    let name_link = sel("td.meta h2.product_name a")?;
    let link = row.select(&name_link).next()?;
    candidate.name = text_or_none(link.text().collect::<String>());
    candidate.name.as_ref()?;
    if let Some(href) = link.value().attr("href") {
        candidate.detail_url = Some(absolute_url(href));
        candidate.external_id = external_id_from_href(href);
    }

    // The set name is the h2 text after the product link, usually prefixed
    // with the franchise name.
    if let Some(h2) = sel("td.meta h2.product_name").and_then(|s| row.select(&s).next()) {
        let lines: Vec<String> = h2
            .text()
            .collect::<String>()
            .lines()
            .filter_map(|line| text_or_none(line.to_string()))
            .collect();
        if lines.len() >= 2 {
            candidate.set_name = Some(lines[1].replace("Pokemon ", "").trim().to_string());
        }
    }

    if let Some(img) = sel("td.photo img").and_then(|s| row.select(&s).next()) {
        if let Some(src) = img.value().attr("src") {
            candidate.image_url = Some(absolute_url(src));
        }
    }

    if let Some(price) = sel("td.pricebox p.price").and_then(|s| row.select(&s).next()) {
        candidate.ungraded_cents = parse_price_cents(&price.text().collect::<String>());
    }

    // Numbers rarely appear in a dedicated column; mine the query first,
    // then the product name.
    candidate.number = extract_card_number(query_text)
        .or_else(|| candidate.name.as_deref().and_then(extract_card_number));

    Some(candidate)
}

/// Parse a PriceCharting search-results page into candidates. Strategies in
/// priority order: rows marked as offers, then any table rows past the
/// header. Never fails; unparseable input yields an empty list.
pub fn parse_search_results(html: &str, query_text: &str) -> Vec<CandidateRecord> {
    let document = Html::parse_document(html);

    let mut rows: Vec<scraper::ElementRef<'_>> = Vec::new();
    if let Some(offer_rows) = sel("tr.offer") {
        rows.extend(document.select(&offer_rows));
    }
    if rows.is_empty() {
        if let Some(any_rows) = sel("table tr") {
            rows.extend(document.select(&any_rows).skip(1));
        }
    }

    rows.into_iter()
        .take(10)
        .filter_map(|row| candidate_from_result_row(row, query_text))
        .collect()
}

fn page_is_not_found(document: &Html) -> bool {
    for selector in ["h1", "title"] {
        let Some(selector) = sel(selector) else {
            continue;
        };
        for element in document.select(&selector) {
            let text = element.text().collect::<String>().to_ascii_lowercase();
            if text.contains("404") || text.contains("not found") {
                return true;
            }
        }
    }
    false
}

fn grade_for_row_text(row_text: &str) -> Option<&'static str> {
    if row_text.contains("ungraded") {
        let is_sub_grade = (1..=7).any(|g| row_text.contains(&format!("grade {g}")));
        if !is_sub_grade {
            return Some("ungraded");
        }
    } else if row_text.contains("psa 10") {
        if !row_text.contains("black") && !row_text.contains("pristine") {
            return Some("psa10");
        }
    } else if row_text.contains("psa 9") {
        return Some("psa9");
    } else if row_text.contains("bgs 10") && !row_text.contains("black") {
        return Some("bgs10");
    }
    None
}

fn assign_price(prices: &mut PriceData, grade: &str, cents: i64) {
    let slot = match grade {
        "ungraded" => &mut prices.ungraded_cents,
        "psa9" => &mut prices.psa9_cents,
        "psa10" => &mut prices.psa10_cents,
        "bgs10" => &mut prices.bgs10_cents,
        _ => return,
    };
    if slot.is_none() {
        *slot = Some(cents);
    }
}

/// Parse grade prices out of a product page. First strategy: the price
/// cells the site marks up (`td.price`) classified by their row text.
/// Fallback: any label/value table rows. `None` when the page carries no
/// prices or is a not-found page.
pub fn parse_price_page(html: &str) -> Option<PriceData> {
    let document = Html::parse_document(html);
    if page_is_not_found(&document) {
        return None;
    }

    let mut prices = PriceData::default();

    if let (Some(row_sel), Some(price_sel)) = (sel("tr"), sel("td.price")) {
        for row in document.select(&row_sel) {
            let Some(cell) = row.select(&price_sel).next() else {
                continue;
            };
            let Some(cents) = parse_price_cents(&cell.text().collect::<String>()) else {
                continue;
            };
            let row_text = row.text().collect::<String>().to_ascii_lowercase();
            if let Some(grade) = grade_for_row_text(&row_text) {
                assign_price(&mut prices, grade, cents);
            }
        }
    }

    if prices.is_empty() {
        if let (Some(row_sel), Some(cell_sel)) = (sel("table tr"), sel("td, th")) {
            for row in document.select(&row_sel) {
                let cells: Vec<_> = row.select(&cell_sel).collect();
                if cells.len() < 2 {
                    continue;
                }
                let label = cells[0].text().collect::<String>().to_ascii_lowercase();
                let Some(cents) =
                    parse_price_cents(&cells[cells.len() - 1].text().collect::<String>())
                else {
                    continue;
                };
                if label.contains("ungraded") || label.contains("loose") || label.contains("raw") {
                    assign_price(&mut prices, "ungraded", cents);
                } else if label.contains("psa 10") || label.contains("gem mint") {
                    assign_price(&mut prices, "psa10", cents);
                } else if label.contains("psa 9") {
                    assign_price(&mut prices, "psa9", cents);
                } else if label.contains("bgs 10") {
                    assign_price(&mut prices, "bgs10", cents);
                }
            }
        }
    }

    if prices.is_empty() {
        None
    } else {
        Some(prices)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductMeta {
    pub card_number: Option<String>,
    pub notes: Option<String>,
}

fn meta_from_pairs(label: &str, value: &str, meta: &mut ProductMeta) {
    let label = label.to_ascii_lowercase().replace(':', "");
    if label.contains("card number") && meta.card_number.is_none() {
        meta.card_number = text_or_none(value.replace('#', ""));
    } else if label.contains("notes") && meta.notes.is_none() {
        meta.notes = text_or_none(value.to_string());
    }
}

/// Extract card number and variant notes from the product-details section.
/// Strategies in order: definition list pairs, table pairs, then the page
/// title's "#NNN" suffix, then the URL's trailing slug segment.
pub fn parse_product_metadata(html: &str, url: &str) -> ProductMeta {
    let document = Html::parse_document(html);
    let mut meta = ProductMeta::default();

    if let (Some(dt_sel), Some(dd_sel)) = (sel("dl dt"), sel("dl dd")) {
        let labels: Vec<String> = document
            .select(&dt_sel)
            .map(|dt| dt.text().collect::<String>())
            .collect();
        let values: Vec<String> = document
            .select(&dd_sel)
            .map(|dd| dd.text().collect::<String>())
            .collect();
        for (label, value) in labels.iter().zip(values.iter()) {
            meta_from_pairs(label, value, &mut meta);
        }
    }

    if meta.card_number.is_none() && meta.notes.is_none() {
        if let (Some(row_sel), Some(cell_sel)) = (sel("table tr"), sel("td, th")) {
            for row in document.select(&row_sel) {
                let cells: Vec<_> = row.select(&cell_sel).collect();
                if cells.len() >= 2 {
                    let label = cells[0].text().collect::<String>();
                    let value = cells[1].text().collect::<String>();
                    meta_from_pairs(&label, &value, &mut meta);
                }
            }
        }
    }

    if meta.card_number.is_none() {
        if let Some(title_sel) = sel("title") {
            if let Some(title) = document.select(&title_sel).next() {
                let text = title.text().collect::<String>();
                if let Some(hash) = text.find('#') {
                    let number: String = text[hash + 1..]
                        .chars()
                        .take_while(|c| c.is_ascii_alphanumeric())
                        .collect();
                    if !number.is_empty() {
                        meta.card_number = Some(number.to_ascii_uppercase());
                    }
                }
            }
        }
    }

    if meta.card_number.is_none() {
        if let Some(last_segment) = url.trim_end_matches('/').rsplit('/').next() {
            if let Some(tail) = last_segment.rsplit('-').next() {
                let looks_like_number = !tail.is_empty()
                    && tail.chars().all(|c| c.is_ascii_alphanumeric())
                    && tail.chars().any(|c| c.is_ascii_digit());
                if looks_like_number {
                    meta.card_number = Some(tail.to_ascii_uppercase());
                }
            }
        }
    }

    meta
}

/// An offers page links to the actual pricing ("game") page; find it.
pub fn extract_pricing_page_url(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let link_sel = sel("a[href]")?;
    // Prefer the explicit historic-prices link, then any game-page link.
    for element in document.select(&link_sel) {
        let text = element.text().collect::<String>().to_ascii_lowercase();
        if text.contains("see historic prices") {
            if let Some(href) = element.value().attr("href") {
                return Some(absolute_url(href));
            }
        }
    }
    for element in document.select(&link_sel) {
        if let Some(href) = element.value().attr("href") {
            if href.contains("/game/pokemon-") {
                return Some(absolute_url(href));
            }
        }
    }
    None
}

pub struct PriceChartingAdapter {
    client: Arc<PacedClient>,
    store: Store,
}

struct ProductPage {
    final_url: String,
    prices: Option<PriceData>,
    meta: ProductMeta,
    not_found: bool,
}

impl PriceChartingAdapter {
    pub fn new(client: Arc<PacedClient>, store: Store) -> Self {
        Self { client, store }
    }

    fn search_text(card: &CardIdentity) -> String {
        let mut query = card.name.clone();
        if let Some(number) = card.number.as_deref() {
            let head: String = number.chars().take_while(|c| c.is_ascii_digit()).collect();
            if !head.is_empty() {
                query.push(' ');
                query.push_str(&head);
            }
        }
        query
    }

    fn lookup_url(cached_id: &str, detail_url: Option<&str>) -> String {
        if let Some(url) = detail_url {
            return url.to_string();
        }
        if cached_id.chars().all(|c| c.is_ascii_digit()) {
            offers_url(cached_id)
        } else {
            format!("{PRICECHARTING_BASE}/{cached_id}")
        }
    }

    /// Fetch one product page, following the offers-page hop when needed,
    /// and parse prices + details out of it.
    async fn fetch_product_page(&self, url: &str) -> Result<ProductPage, ResolveError> {
        let mut body = self.client.get(url).await?;

        if body.final_url.contains("/offers") || url.contains("/offers") {
            if let Some(pricing_url) = extract_pricing_page_url(&body.text) {
                debug!(offers_url = url, pricing_url = %pricing_url, "following offers page to pricing page");
                body = self.client.get(&pricing_url).await?;
            }
        }

        let prices = parse_price_page(&body.text);
        let meta = parse_product_metadata(&body.text, &body.final_url);
        let not_found = prices.is_none() && meta == ProductMeta::default();
        Ok(ProductPage {
            final_url: body.final_url,
            prices,
            meta,
            not_found,
        })
    }

    fn page_to_record(
        &self,
        external_id: &str,
        page: ProductPage,
        card: &CardIdentity,
    ) -> Option<ResolvedRecord> {
        let prices = page.prices?;
        // The full page knows the printed number; a contradiction means the
        // search landed on the wrong card.
        if let (Some(query_number), Some(page_number)) =
            (card.number.as_deref(), page.meta.card_number.as_deref())
        {
            if binder_core::number_key(query_number) != binder_core::number_key(page_number) {
                warn!(
                    card_id = card.id,
                    query_number, page_number, "product page number contradicts catalog"
                );
                return None;
            }
        }
        Some(ResolvedRecord {
            source: SOURCE_PRICECHARTING.to_string(),
            external_id: external_id.to_string(),
            detail_url: Some(page.final_url),
            prices: Some(prices),
            details: None,
            fetched_at: Utc::now(),
        })
    }
}

#[async_trait]
impl ItemResolver for PriceChartingAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_PRICECHARTING
    }

    async fn resolve(&self, card: &CardIdentity) -> Result<Resolution, ResolveError> {
        // Phase 1: direct lookup via the cached external id; strictly faster
        // and more reliable than searching again.
        if let Some(cached) = self
            .store
            .cached_external_id(card.id, SOURCE_PRICECHARTING)
            .await?
        {
            let url = Self::lookup_url(&cached.external_id, cached.detail_url.as_deref());
            match self.fetch_product_page(&url).await {
                Ok(page) if !page.not_found => {
                    if let Some(record) = self.page_to_record(&cached.external_id, page, card) {
                        if let Some(final_url) = record.detail_url.as_deref() {
                            if final_url.contains("/game/") {
                                self.store
                                    .cache_external_id(
                                        card.id,
                                        SOURCE_PRICECHARTING,
                                        &cached.external_id,
                                        Some(final_url),
                                    )
                                    .await?;
                            }
                        }
                        return Ok(Resolution::Resolved(record));
                    }
                }
                Ok(_) => debug!(card_id = card.id, "cached id led to an empty page, searching"),
                Err(ResolveError::Fetch(FetchError::HttpStatus { status: 404, .. })) => {
                    debug!(card_id = card.id, "cached id is stale (404), searching");
                }
                Err(err) => return Err(err),
            }
        }

        // Phase 2: a slug URL built straight from catalog data, the way the
        // site structures its pages. Cheap and often exact.
        if let Some(url) = product_url(card) {
            match self.fetch_product_page(&url).await {
                Ok(page) if page.prices.is_some() => {
                    if let Some(id) = external_id_from_href(&page.final_url) {
                        self.store
                            .cache_external_id(
                                card.id,
                                SOURCE_PRICECHARTING,
                                &id,
                                Some(page.final_url.as_str()),
                            )
                            .await?;
                        if let Some(record) = self.page_to_record(&id, page, card) {
                            return Ok(Resolution::Resolved(record));
                        }
                    }
                }
                Ok(_) => {}
                Err(ResolveError::Fetch(FetchError::HttpStatus { status: 404, .. })) => {}
                Err(err) => return Err(err),
            }
        }

        // Phase 3: search, score, cache the winner, then fetch the full page.
        let query_text = Self::search_text(card);
        let body = self
            .client
            .get_with_query(
                &format!("{PRICECHARTING_BASE}/search-products"),
                &[("q", query_text.as_str())],
            )
            .await?;
        let candidates = parse_search_results(&body.text, &query_text);
        let query = MatchQuery::from_identity(card);
        let Some(best) = select_best_match(&query, &candidates) else {
            return Ok(Resolution::NotFound);
        };
        let Some(external_id) = best.external_id.clone() else {
            return Ok(Resolution::NotFound);
        };
        self.store
            .cache_external_id(
                card.id,
                SOURCE_PRICECHARTING,
                &external_id,
                best.detail_url.as_deref(),
            )
            .await?;

        let url = Self::lookup_url(&external_id, best.detail_url.as_deref());
        let page = self.fetch_product_page(&url).await?;
        match self.page_to_record(&external_id, page, card) {
            Some(record) => Ok(Resolution::Resolved(record)),
            None => Ok(Resolution::NotFound),
        }
    }
}

// ---------------------------------------------------------------------------
// TCGdex
// ---------------------------------------------------------------------------

pub const TCGDEX_BASE: &str = "https://api.tcgdex.net/v2/en";

fn json_str(value: &JsonValue, path: &[&str]) -> Option<String> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str().map(ToString::to_string)
}

fn json_i64(value: &JsonValue, key: &str) -> Option<i64> {
    let field = value.get(key)?;
    field
        .as_i64()
        .or_else(|| field.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Convert a card-list response into scorer candidates. The list endpoint
/// returns brief records; missing fields stay `None`.
pub fn parse_card_summaries(json: &str) -> Vec<CandidateRecord> {
    let Ok(value) = serde_json::from_str::<JsonValue>(json) else {
        return Vec::new();
    };
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let external_id = json_str(item, &["id"])?;
            Some(CandidateRecord {
                name: json_str(item, &["name"]),
                set_name: json_str(item, &["set", "name"]),
                number: json_str(item, &["localId"]),
                variant: json_str(item, &["rarity"]),
                external_id: Some(external_id),
                detail_url: None,
                image_url: json_str(item, &["image"]),
                ungraded_cents: None,
            })
        })
        .collect()
}

/// Normalize a full card record. Field names follow the API's vocabulary:
/// `category` is the supertype, `illustrator` the artist, `description` the
/// flavor text, `localId` the printed number.
pub fn parse_card_details(json: &str) -> Option<CardDetails> {
    let value: JsonValue = serde_json::from_str(json).ok()?;
    let external_id = json_str(&value, &["id"])?;
    let types = value
        .get("types")
        .and_then(|t| t.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    Some(CardDetails {
        external_id,
        name: json_str(&value, &["name"]),
        set_id: json_str(&value, &["set", "id"]),
        set_name: json_str(&value, &["set", "name"]),
        number: json_str(&value, &["localId"]),
        supertype: json_str(&value, &["category"]),
        rarity: json_str(&value, &["rarity"]),
        hp: json_i64(&value, "hp"),
        retreat_cost: json_i64(&value, "retreat"),
        types,
        artist: json_str(&value, &["illustrator"]),
        flavor_text: json_str(&value, &["description"]),
        evolves_from: json_str(&value, &["evolveFrom"]),
        image_url: json_str(&value, &["image"]),
        attacks: value.get("attacks").cloned(),
        weaknesses: value.get("weaknesses").cloned(),
        resistances: value.get("resistances").cloned(),
        legalities: value.get("legal").cloned(),
    })
}

fn search_number(number: &str) -> &str {
    number.split('/').next().unwrap_or(number).trim()
}

pub struct TcgdexAdapter {
    client: Arc<PacedClient>,
    store: Store,
}

impl TcgdexAdapter {
    pub fn new(client: Arc<PacedClient>, store: Store) -> Self {
        Self { client, store }
    }

    /// Direct lookup by card id. `Ok(None)` means the id no longer exists;
    /// transport failures bubble up.
    async fn fetch_card(&self, external_id: &str) -> Result<Option<CardDetails>, ResolveError> {
        let url = format!("{TCGDEX_BASE}/cards/{external_id}");
        match self.client.get(&url).await {
            Ok(body) => Ok(parse_card_details(&body.text)),
            Err(FetchError::HttpStatus { status: 404, .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn search(
        &self,
        name: &str,
        set_name: Option<&str>,
        number: Option<&str>,
    ) -> Result<Vec<CandidateRecord>, ResolveError> {
        let url = format!("{TCGDEX_BASE}/cards");
        let number_filter = number.map(|n| format!("eq:{}", search_number(n)));
        let mut query: Vec<(&str, &str)> = vec![("name", name.trim())];
        if let Some(set_name) = set_name {
            query.push(("set.name", set_name.trim()));
        }
        if let Some(filter) = number_filter.as_deref() {
            query.push(("localId", filter));
        }
        query.push(("pagination:itemsPerPage", "20"));

        let body = self.client.get_with_query(&url, &query).await?;
        Ok(parse_card_summaries(&body.text))
    }

    /// Progressive search: all filters, then without the set name, then by
    /// name alone. Set names in personal catalogs rarely match the API's
    /// spelling exactly, so the narrower queries often come back empty.
    async fn search_with_fallback(
        &self,
        card: &CardIdentity,
    ) -> Result<Vec<CandidateRecord>, ResolveError> {
        let number = card.number.as_deref();
        let mut candidates = self
            .search(&card.name, card.set_name.as_deref(), number)
            .await?;
        if candidates.is_empty() && card.set_name.is_some() {
            debug!(card_id = card.id, "retrying search without set filter");
            candidates = self.search(&card.name, None, number).await?;
        }
        if candidates.is_empty() && number.is_some() {
            debug!(card_id = card.id, "retrying search by name only");
            candidates = self.search(&card.name, None, None).await?;
        }
        Ok(candidates)
    }

    fn record_from_details(&self, details: CardDetails) -> ResolvedRecord {
        ResolvedRecord {
            source: SOURCE_TCGDEX.to_string(),
            external_id: details.external_id.clone(),
            detail_url: Some(format!("{TCGDEX_BASE}/cards/{}", details.external_id)),
            prices: None,
            details: Some(details),
            fetched_at: Utc::now(),
        }
    }
}

#[async_trait]
impl ItemResolver for TcgdexAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_TCGDEX
    }

    async fn healthcheck(&self) -> bool {
        let url = format!("{TCGDEX_BASE}/cards");
        self.client
            .get_with_query(&url, &[("pagination:itemsPerPage", "1")])
            .await
            .is_ok()
    }

    async fn resolve(&self, card: &CardIdentity) -> Result<Resolution, ResolveError> {
        if let Some(cached) = self.store.cached_external_id(card.id, SOURCE_TCGDEX).await? {
            if let Some(details) = self.fetch_card(&cached.external_id).await? {
                return Ok(Resolution::Resolved(self.record_from_details(details)));
            }
            debug!(card_id = card.id, cached_id = %cached.external_id, "cached card id is gone, searching");
        }

        let candidates = self.search_with_fallback(card).await?;
        if candidates.is_empty() {
            return Ok(Resolution::NotFound);
        }

        let query = MatchQuery::from_identity(card);
        let Some(best) = select_best_match(&query, &candidates) else {
            return Ok(Resolution::NotFound);
        };
        let Some(external_id) = best.external_id.clone() else {
            return Ok(Resolution::NotFound);
        };
        self.store
            .cache_external_id(card.id, SOURCE_TCGDEX, &external_id, None)
            .await?;

        // Search briefs are abbreviated; fetch the full record for metadata
        // completeness before writing anything back.
        match self.fetch_card(&external_id).await? {
            Some(details) => Ok(Resolution::Resolved(self.record_from_details(details))),
            None => Ok(Resolution::NotFound),
        }
    }
}
