use std::collections::VecDeque;
use std::future::Future;

use futures::Stream;
use tracing::{debug, warn};

use crate::source::SourceStateQuery;
use crate::strategy::WorkUnit;

/// Pages through work units in order, never emitting more than `limit` records in total.
///
/// The resulting stream is lazy: the next page is only requested once the previous one
/// has been consumed. It stops at the first fetch error.
pub struct FlowConverter<F> {
    batch_size: usize,
    limit: usize,
    fetch: F,
}

struct FlowState<T> {
    units: VecDeque<WorkUnit>,
    offset: usize,
    processed: usize,
    buffer: VecDeque<T>,
    failed: bool,
}

impl<F, Fut, T, E> FlowConverter<F>
where
    F: Fn(SourceStateQuery) -> Fut,
    Fut: Future<Output = Result<Vec<T>, E>>,
{
    pub fn new(batch_size: usize, limit: usize, fetch: F) -> Self {
        Self {
            batch_size,
            limit,
            fetch,
        }
    }

    pub fn execute<'a>(&'a self, units: Vec<WorkUnit>) -> impl Stream<Item = Result<T, E>> + 'a
    where
        Fut: 'a,
        T: 'a,
        E: 'a,
    {
        let state = FlowState {
            units: units.into(),
            offset: 0,
            processed: 0,
            buffer: VecDeque::new(),
            failed: false,
        };

        futures::stream::unfold(state, move |mut state| async move {
            loop {
                if let Some(item) = state.buffer.pop_front() {
                    return Some((Ok(item), state));
                }
                if state.failed || self.batch_size == 0 || state.processed >= self.limit {
                    return None;
                }

                let unit = state.units.front()?;
                let requested = self.batch_size.min(self.limit - state.processed);
                let query = SourceStateQuery {
                    from: unit.from,
                    entity_ids: unit.entity_ids.clone(),
                    offset: state.offset,
                    limit: requested,
                };

                let mut page = match (self.fetch)(query).await {
                    Ok(page) => page,
                    Err(e) => {
                        state.failed = true;
                        return Some((Err(e), state));
                    }
                };

                if page.len() > requested {
                    warn!(requested, received = page.len(), "source returned an oversized page");
                    page.truncate(requested);
                }

                let received = page.len();
                state.processed += received;
                state.offset += received;
                if received < requested {
                    debug!(processed = state.processed, "work unit exhausted");
                    state.units.pop_front();
                    state.offset = 0;
                }

                state.buffer.extend(page);
            }
        })
    }
}
