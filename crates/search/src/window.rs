//! 1-indexed pagination over a derived row list.

use serde::Serialize;

/// Page count for `count` rows. A `page_size` of 0 is treated as 1.
pub fn total_pages(count: usize, page_size: usize) -> usize {
    let size = page_size.max(1);
    (count + size - 1) / size
}

/// Clamp into `[1, max(total_pages, 1)]`.
pub fn clamp_page(page: usize, total_pages: usize) -> usize { page.clamp(1, total_pages.max(1)) }

/// Rows on `page` and the page count. Empty when `page > total_pages`.
pub fn slice<T>(items: &[T], page: usize, page_size: usize) -> (&[T], usize) {
    let size = page_size.max(1);
    let pages = total_pages(items.len(), size);
    let start = (page.max(1) - 1).saturating_mul(size);
    if start >= items.len() {
        return (&[], pages);
    }
    let end = (start + size).min(items.len());
    (&items[start..end], pages)
}

/// For kinds paginated on the server the fetched items already are the window; only the
/// page count is derived, from the server's total.
pub fn server_window(total_count: usize, page: usize, page_size: usize) -> (usize, usize) {
    let pages = total_pages(total_count, page_size);
    (clamp_page(page, pages), pages)
}

/// What the view layer renders: the clamped page and its rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Window<T> {
    pub rows: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
    pub total_count: usize,
}

impl<T: Clone> Window<T> {
    /// Clamp, then slice.
    pub fn of(items: &[T], page: usize, page_size: usize) -> Self {
        let size = page_size.max(1);
        let page = clamp_page(page, total_pages(items.len(), size));
        let (rows, total_pages) = slice(items, page, size);
        Self { rows: rows.to_vec(), page, page_size: size, total_pages, total_count: items.len() }
    }

    /// Rows already sliced by the server.
    pub fn from_server(rows: Vec<T>, total_count: usize, page: usize, page_size: usize) -> Self {
        let (page, total_pages) = server_window(total_count, page, page_size);
        Self { rows, page, page_size: page_size.max(1), total_pages, total_count }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_round_up() {
        assert_eq!(total_pages(0, 10), 0);
        assert_eq!(total_pages(10, 10), 1);
        assert_eq!(total_pages(11, 10), 2);
        assert_eq!(total_pages(3, 0), 3);
    }

    #[test]
    fn slice_tail_page() {
        let v: Vec<u32> = (1..=23).collect();
        let (w, pages) = slice(&v, 3, 10);
        assert_eq!(pages, 3);
        assert_eq!(w, &[21, 22, 23]);
        let (w, _) = slice(&v, 4, 10);
        assert!(w.is_empty());
    }

    #[test]
    fn clamp_keeps_page_in_range() {
        assert_eq!(clamp_page(0, 5), 1);
        assert_eq!(clamp_page(9, 5), 5);
        assert_eq!(clamp_page(3, 0), 1);
    }

    #[test]
    fn window_clamps_after_shrink() {
        // e.g. deleting the last row on the last page
        let v: Vec<u32> = (1..=20).collect();
        let w = Window::of(&v, 3, 10);
        assert_eq!(w.page, 2);
        assert_eq!(w.rows.len(), 10);
        let empty: Vec<u32> = Vec::new();
        let w = Window::of(&empty, 4, 10);
        assert_eq!((w.page, w.total_pages, w.rows.len()), (1, 0, 0));
    }

    #[test]
    fn server_window_uses_server_count() {
        assert_eq!(server_window(95, 12, 10), (10, 10));
        let w = Window::from_server(vec!['a', 'b'], 12, 2, 10);
        assert_eq!((w.page, w.total_pages, w.total_count), (2, 2, 12));
    }
}
