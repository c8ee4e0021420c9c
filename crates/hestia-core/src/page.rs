use serde::Serialize;

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageResult<T> {
    pub entries: Vec<T>,
    /// Present iff more entries remain after this page
    #[serde(rename = "page", skip_serializing_if = "Option::is_none")]
    pub next_page: Option<usize>,
}

/// Slice `items` to `[page * page_size, (page + 1) * page_size)`.
pub fn paginate<T>(items: Vec<T>, page: usize, page_size: usize) -> PageResult<T> {
    let total = items.len();
    let start = page.saturating_mul(page_size).min(total);
    let end = start.saturating_add(page_size).min(total);

    let entries = items.into_iter().skip(start).take(end - start).collect();
    let next_page = if end < total { Some(page + 1) } else { None };

    PageResult { entries, next_page }
}
