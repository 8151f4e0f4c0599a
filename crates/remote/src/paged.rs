//! Lazy reader over paginated remote collections
//!
//! A `PagedSequence` wraps a fetch function `(page_index, page_size) -> Page`
//! and exposes the whole collection as one forward-only stream. Pages are
//! fetched one at a time, only when the consumer has drained the previous
//! page. Each call to `stream()` starts a fresh traversal at page 0.
//!
//! The traversal ends on the first empty page, or once the number of yielded
//! items reaches the total reported by the first page, whichever comes first.

use std::collections::VecDeque;
use std::future::Future;

use futures_util::Stream;
use futures_util::stream;
use tracing::trace;

/// One page of a remote collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Total item count across all pages, if the remote reports it
    pub total: Option<u64>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: Option<u64>) -> Self {
        Self { items, total }
    }
}

/// Traversal state of a single `stream()` call.
struct PageCursor<T> {
    /// Index of the last fetched page; -1 before the first fetch
    index: i64,
    page_size: u32,
    total: Option<u64>,
    items: VecDeque<T>,
    yielded: u64,
    finished: bool,
}

impl<T> PageCursor<T> {
    fn new(page_size: u32) -> Self {
        Self {
            index: -1,
            page_size,
            total: None,
            items: VecDeque::new(),
            yielded: 0,
            finished: false,
        }
    }

    fn total_reached(&self) -> bool {
        self.total.is_some_and(|total| self.yielded >= total)
    }
}

/// Lazy, restartable-per-call view over a paginated endpoint.
pub struct PagedSequence<F> {
    page_size: u32,
    fetch: F,
}

impl<F> PagedSequence<F> {
    /// Create a sequence reading `page_size` items per request.
    ///
    /// A zero page size would never make progress and is raised to 1.
    pub fn new(page_size: u32, fetch: F) -> Self {
        Self {
            page_size: page_size.max(1),
            fetch,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Start a new traversal from page 0.
    ///
    /// A fetch error is yielded once and ends the traversal.
    pub fn stream<'a, T: 'a, E, Fut>(&'a self) -> impl Stream<Item = Result<T, E>> + 'a
    where
        F: Fn(u32, u32) -> Fut,
        Fut: Future<Output = Result<Page<T>, E>>,
    {
        let cursor = PageCursor::new(self.page_size);
        stream::unfold((cursor, &self.fetch), |(mut cursor, fetch)| async move {
            loop {
                if cursor.total_reached() {
                    return None;
                }
                if let Some(item) = cursor.items.pop_front() {
                    cursor.yielded += 1;
                    return Some((Ok(item), (cursor, fetch)));
                }
                if cursor.finished {
                    return None;
                }

                let next = cursor.index + 1;
                trace!(page = next, size = cursor.page_size, "fetching page");
                match fetch(next as u32, cursor.page_size).await {
                    Ok(page) => {
                        cursor.index = next;
                        if next == 0 {
                            cursor.total = page.total;
                        }
                        if page.items.is_empty() {
                            return None;
                        }
                        cursor.items = page.items.into();
                    }
                    Err(e) => {
                        cursor.finished = true;
                        return Some((Err(e), (cursor, fetch)));
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RemoteError;
    use futures_util::{StreamExt, TryStreamExt};
    use std::future::{Ready, ready};
    use std::sync::Mutex;

    /// In-memory collection of `len` numbered items, recording every fetch.
    struct FakeRemote {
        len: usize,
        report_total: bool,
        fail_on_page: Option<u32>,
        fetches: Mutex<Vec<(u32, u32)>>,
    }

    impl FakeRemote {
        fn new(len: usize, report_total: bool) -> Self {
            Self {
                len,
                report_total,
                fail_on_page: None,
                fetches: Mutex::new(Vec::new()),
            }
        }

        fn fetch(&self, page: u32, size: u32) -> Ready<Result<Page<usize>, RemoteError>> {
            self.fetches.lock().unwrap().push((page, size));
            if self.fail_on_page == Some(page) {
                return ready(Err(RemoteError::transient("connection reset")));
            }
            let start = (page * size) as usize;
            let end = (start + size as usize).min(self.len);
            let items = (start.min(end)..end).collect();
            let total = self.report_total.then_some(self.len as u64);
            ready(Ok(Page::new(items, total)))
        }

        fn fetch_count(&self) -> usize {
            self.fetches.lock().unwrap().len()
        }
    }

    #[tokio::test]
    async fn total_five_page_size_two_takes_three_fetches() {
        let remote = FakeRemote::new(5, true);
        let seq = PagedSequence::new(2, |page, size| remote.fetch(page, size));

        let items: Vec<usize> = seq.stream().try_collect().await.unwrap();

        assert_eq!(items, vec![0, 1, 2, 3, 4]);
        assert_eq!(
            *remote.fetches.lock().unwrap(),
            vec![(0, 2), (1, 2), (2, 2)]
        );
    }

    #[tokio::test]
    async fn unknown_total_stops_on_first_empty_page() {
        let remote = FakeRemote::new(3, false);
        let seq = PagedSequence::new(2, |page, size| remote.fetch(page, size));

        let items: Vec<usize> = seq.stream().try_collect().await.unwrap();

        assert_eq!(items, vec![0, 1, 2]);
        // pages 0 and 1 have items, page 2 is empty
        assert_eq!(remote.fetch_count(), 3);
    }

    #[tokio::test]
    async fn stops_at_total_even_if_page_has_more() {
        let remote = FakeRemote::new(10, false);
        let seq = PagedSequence::new(4, |page, size| {
            let mut page = remote.fetch(page, size).into_inner();
            if let Ok(p) = page.as_mut() {
                p.total = Some(3);
            }
            ready(page)
        });

        let items: Vec<usize> = seq.stream().try_collect().await.unwrap();

        assert_eq!(items, vec![0, 1, 2]);
        assert_eq!(remote.fetch_count(), 1);
    }

    #[tokio::test]
    async fn empty_collection_yields_nothing() {
        let remote = FakeRemote::new(0, true);
        let seq = PagedSequence::new(5, |page, size| remote.fetch(page, size));

        let items: Vec<usize> = seq.stream().try_collect().await.unwrap();

        assert!(items.is_empty());
        assert_eq!(remote.fetch_count(), 1);
    }

    #[tokio::test]
    async fn pages_are_fetched_lazily() {
        let remote = FakeRemote::new(100, true);
        let seq = PagedSequence::new(10, |page, size| remote.fetch(page, size));

        let first: Vec<Result<usize, RemoteError>> = seq.stream().take(3).collect().await;

        assert_eq!(first.len(), 3);
        assert_eq!(remote.fetch_count(), 1, "only the first page is needed");
    }

    #[tokio::test]
    async fn each_traversal_restarts_at_page_zero() {
        let remote = FakeRemote::new(3, true);
        let seq = PagedSequence::new(2, |page, size| remote.fetch(page, size));

        let a: Vec<usize> = seq.stream().try_collect().await.unwrap();
        let b: Vec<usize> = seq.stream().try_collect().await.unwrap();

        assert_eq!(a, b);
        let pages: Vec<u32> = remote
            .fetches
            .lock()
            .unwrap()
            .iter()
            .map(|(p, _)| *p)
            .collect();
        assert_eq!(pages, vec![0, 1, 0, 1]);
    }

    #[tokio::test]
    async fn fetch_error_is_yielded_once_and_ends_stream() {
        let mut remote = FakeRemote::new(6, true);
        remote.fail_on_page = Some(1);
        let seq = PagedSequence::new(2, |page, size| remote.fetch(page, size));

        let results: Vec<Result<usize, RemoteError>> = seq.stream().collect().await;

        assert_eq!(results.len(), 3);
        assert_eq!(*results[0].as_ref().unwrap(), 0);
        assert_eq!(*results[1].as_ref().unwrap(), 1);
        assert!(results[2].is_err());
        assert_eq!(remote.fetch_count(), 2);
    }

    #[test]
    fn zero_page_size_is_raised_to_one() {
        let seq = PagedSequence::new(0, |_: u32, _: u32| {
            ready(Ok::<_, RemoteError>(Page::<u8>::new(vec![], None)))
        });
        assert_eq!(seq.page_size(), 1);
    }
}
