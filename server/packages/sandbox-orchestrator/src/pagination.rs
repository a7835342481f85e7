//! Cursor helpers shared by every search operation.
//!
//! Two cursor styles exist: a stringified offset (sandboxes, specs, stored
//! records) and the id of the first item of the next page (in-memory logs).
//! Both are opaque to clients.

pub const MAX_PAGE_LIMIT: usize = 100;

pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(MAX_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
}

/// Unparseable offsets restart from the beginning.
pub fn parse_offset(page_id: Option<&str>) -> usize {
    page_id
        .and_then(|page_id| page_id.trim().parse::<usize>().ok())
        .unwrap_or(0)
}

pub fn paginate_offset<T>(
    items: Vec<T>,
    page_id: Option<&str>,
    limit: usize,
) -> (Vec<T>, Option<String>) {
    let limit = limit.max(1);
    let start = parse_offset(page_id);
    let total = items.len();
    let end = start.saturating_add(limit);
    let page = items.into_iter().skip(start).take(limit).collect();
    let next_page_id = (end < total).then(|| end.to_string());
    (page, next_page_id)
}

/// Pages starting at the item whose key equals `page_id`. An unknown cursor
/// yields an empty page.
pub fn paginate_from_key<T, F>(
    items: Vec<T>,
    page_id: Option<&str>,
    limit: usize,
    key: F,
) -> (Vec<T>, Option<String>)
where
    F: Fn(&T) -> String,
{
    let limit = limit.max(1);
    let start = match page_id {
        None => 0,
        Some(page_id) => match items.iter().position(|item| key(item) == page_id) {
            Some(index) => index,
            None => return (Vec::new(), None),
        },
    };
    let mut rest = items.into_iter().skip(start);
    let page: Vec<T> = rest.by_ref().take(limit).collect();
    let next_page_id = rest.next().map(|item| key(&item));
    (page, next_page_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_clamped() {
        assert_eq!(clamp_limit(None), MAX_PAGE_LIMIT);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(1_000)), MAX_PAGE_LIMIT);
        assert_eq!(clamp_limit(Some(7)), 7);
    }

    #[test]
    fn offset_pages_cover_everything_once() {
        let items: Vec<u32> = (0..10).collect();
        for limit in 1..=11 {
            let mut collected = Vec::new();
            let mut page_id: Option<String> = None;
            loop {
                let (page, next) = paginate_offset(items.clone(), page_id.as_deref(), limit);
                collected.extend(page);
                match next {
                    Some(next) => page_id = Some(next),
                    None => break,
                }
            }
            assert_eq!(collected, items, "limit {limit}");
        }
    }

    #[test]
    fn garbage_offset_restarts() {
        let (page, next) = paginate_offset(vec![1, 2, 3], Some("nope"), 2);
        assert_eq!(page, vec![1, 2]);
        assert_eq!(next.as_deref(), Some("2"));
    }

    #[test]
    fn key_cursor_points_at_next_item() {
        let items = vec!["a", "b", "c", "d"];
        let (page, next) = paginate_from_key(items.clone(), None, 3, |s| s.to_string());
        assert_eq!(page, vec!["a", "b", "c"]);
        assert_eq!(next.as_deref(), Some("d"));

        let (page, next) = paginate_from_key(items.clone(), Some("d"), 3, |s| s.to_string());
        assert_eq!(page, vec!["d"]);
        assert!(next.is_none());

        let (page, next) = paginate_from_key(items, Some("zz"), 3, |s| s.to_string());
        assert!(page.is_empty());
        assert!(next.is_none());
    }
}
