//! Infinite (paginated) queries: a chain of pages addressed by a generic
//! `pageParam`, following TanStack's `getNextPageParam`/
//! `getPreviousPageParam` contract rather than the teacher's page-index-only
//! design (`infinite::InfiniteQueryOptions` used a plain `page: u32`).
//! Grounded on `infinite::use_infinite_query` for the observer shape
//! (loading/error/has-next signals, `fetch_next_page`), generalized to an
//! arbitrary page-param type so callers aren't limited to numeric paging
//! (cursor-based APIs are common enough that baking in `u32` pages would be
//! a regression from the spec).

use crate::cancellation::FetchContext;
use crate::observer::{Observer, ObserverOptions};
use crate::query::{BoxFuture, ErasedData, ErasedFetcher};
use crate::retry::{QueryError, RetryConfig};
use std::future::Future;
use std::sync::Arc;

/// One fetched page and the param that produced it.
#[derive(Clone)]
pub struct Page<TData, TPageParam> {
    pub data: Arc<TData>,
    pub param: TPageParam,
}

/// The accumulated, cached value of an infinite query: every page fetched
/// so far, in order.
#[derive(Clone)]
pub struct InfiniteData<TData, TPageParam> {
    pub pages: Vec<Page<TData, TPageParam>>,
}

impl<TData, TPageParam> InfiniteData<TData, TPageParam> {
    pub fn flatten(&self) -> Vec<Arc<TData>> {
        self.pages.iter().map(|p| p.data.clone()).collect()
    }
}

type PageParamFn<TData, TPageParam> =
    Arc<dyn Fn(&InfiniteData<TData, TPageParam>) -> Option<TPageParam> + Send + Sync>;
type PageFetcher<TData, TPageParam> = Arc<
    dyn Fn(TPageParam, FetchContext) -> BoxFuture<Result<TData, QueryError>> + Send + Sync,
>;

pub struct InfiniteQueryOptions<TData, TPageParam> {
    pub initial_page_param: TPageParam,
    pub get_next_page_param: PageParamFn<TData, TPageParam>,
    pub get_previous_page_param: Option<PageParamFn<TData, TPageParam>>,
    pub max_pages: Option<usize>,
    pub retry: RetryConfig,
}

/// A live subscription to a paginated query.
pub struct InfiniteObserver<TData, TPageParam> {
    observer: Arc<Observer<InfiniteData<TData, TPageParam>>>,
    fetch_page: PageFetcher<TData, TPageParam>,
    get_next_page_param: PageParamFn<TData, TPageParam>,
    get_previous_page_param: Option<PageParamFn<TData, TPageParam>>,
    max_pages: Option<usize>,
    retry: RetryConfig,
}

impl<TData, TPageParam> InfiniteObserver<TData, TPageParam>
where
    TData: Send + Sync + 'static,
    TPageParam: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(
        cache: crate::cache::QueryCache,
        coordinator: Arc<crate::fetch::FetchCoordinator>,
        key: crate::key::QueryKey,
        fetch_page: F,
        options: InfiniteQueryOptions<TData, TPageParam>,
    ) -> Arc<Self>
    where
        F: Fn(TPageParam, FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TData, QueryError>> + Send + 'static,
    {
        let fetch_page: PageFetcher<TData, TPageParam> =
            Arc::new(move |param, ctx| Box::pin(fetch_page(param, ctx)));
        let initial_param = options.initial_page_param.clone();
        let first_page_fetcher = fetch_page.clone();
        let observer_options = ObserverOptions {
            retry: options.retry.clone(),
            ..ObserverOptions::default()
        };
        let observer = Observer::new(
            cache,
            coordinator,
            key,
            move |ctx: FetchContext| {
                let fetch_page = first_page_fetcher.clone();
                let param = initial_param.clone();
                async move {
                    let data = fetch_page(param.clone(), ctx).await?;
                    Ok(InfiniteData {
                        pages: vec![Page {
                            data: Arc::new(data),
                            param,
                        }],
                    })
                }
            },
            observer_options,
        );

        Arc::new(Self {
            observer,
            fetch_page,
            get_next_page_param: options.get_next_page_param,
            get_previous_page_param: options.get_previous_page_param,
            max_pages: options.max_pages,
            retry: options.retry,
        })
    }

    pub fn result(&self) -> Result<crate::state::QueryState<InfiniteData<TData, TPageParam>>, QueryError> {
        self.observer.result()
    }

    pub fn has_next_page(&self) -> bool {
        match self.result() {
            Ok(state) => match state.data {
                Some(d) => (self.get_next_page_param)(&d).is_some(),
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn has_previous_page(&self) -> bool {
        match (&self.get_previous_page_param, self.result()) {
            (Some(f), Ok(state)) => match state.data {
                Some(d) => f(&d).is_some(),
                None => false,
            },
            _ => false,
        }
    }

    /// Fetches one more page and appends (or prepends) it. Routed through
    /// the query's own single-flight lease rather than running its own
    /// ad hoc fetch, so a concurrent `fetch_next_page`/`fetch_previous_page`
    /// call joins this one instead of racing it — only one page fetch runs
    /// at a time per query, matching the rest of the engine's single-flight
    /// guarantee.
    async fn append_page(
        &self,
        param: TPageParam,
        prepend: bool,
    ) -> Result<Arc<InfiniteData<TData, TPageParam>>, QueryError> {
        let fetch_page = self.fetch_page.clone();
        let observer = self.observer.clone();
        let max_pages = self.max_pages;

        let override_fetcher: ErasedFetcher = Arc::new(move |ctx: FetchContext| {
            let fetch_page = fetch_page.clone();
            let observer = observer.clone();
            let param = param.clone();
            Box::pin(async move {
                let data = fetch_page(param.clone(), ctx).await?;
                let current = observer.result()?.data;
                let mut pages = current.map(|d| d.pages.clone()).unwrap_or_default();
                let new_page = Page {
                    data: Arc::new(data),
                    param,
                };
                if prepend {
                    pages.insert(0, new_page);
                } else {
                    pages.push(new_page);
                }
                if let Some(max) = max_pages {
                    while pages.len() > max {
                        if prepend {
                            pages.pop();
                        } else {
                            pages.remove(0);
                        }
                    }
                }
                Ok(Arc::new(InfiniteData { pages }) as ErasedData)
            })
        });

        let result = self
            .observer
            .query()
            .ensure_fetch(Some(override_fetcher), Some(self.retry.clone()), false)
            .await?;
        result
            .downcast::<InfiniteData<TData, TPageParam>>()
            .map_err(|_| QueryError::TypeMismatch {
                expected: std::any::type_name::<InfiniteData<TData, TPageParam>>().to_string(),
                actual: "<erased>".to_string(),
            })
    }

    pub async fn fetch_next_page(&self) -> Result<Arc<InfiniteData<TData, TPageParam>>, QueryError> {
        let current = self
            .observer
            .result()?
            .data
            .ok_or_else(|| QueryError::custom("no pages loaded yet"))?;
        let param = (self.get_next_page_param)(&current)
            .ok_or_else(|| QueryError::custom("no next page"))?;
        self.append_page(param, false).await
    }

    pub async fn fetch_previous_page(
        &self,
    ) -> Result<Arc<InfiniteData<TData, TPageParam>>, QueryError> {
        let f = self
            .get_previous_page_param
            .as_ref()
            .ok_or_else(|| QueryError::custom("no previous-page-param function configured"))?;
        let current = self
            .observer
            .result()?
            .data
            .ok_or_else(|| QueryError::custom("no pages loaded yet"))?;
        let param = f(&current).ok_or_else(|| QueryError::custom("no previous page"))?;
        self.append_page(param, true).await
    }

    pub async fn refetch(&self) -> Result<Arc<InfiniteData<TData, TPageParam>>, QueryError> {
        self.observer.refetch().await
    }
}
