//! N-way merge over per-stream iterators, yielding events in global
//! `(created_at, no)` order with the source stream attached.

use crate::error::Error;
use crate::event::RecordedEvent;
use crate::store::EventIterator;
use crate::stream::StreamName;

struct Source {
    stream_name: StreamName,
    iterator: EventIterator,
    head: Option<RecordedEvent>,
    exhausted: bool,
}

pub(crate) struct MergedEventIterator {
    sources: Vec<Source>,
}

impl MergedEventIterator {
    pub(crate) fn new(sources: Vec<(StreamName, EventIterator)>) -> Self {
        Self {
            sources: sources
                .into_iter()
                .map(|(stream_name, iterator)| Source {
                    stream_name,
                    iterator,
                    head: None,
                    exhausted: false,
                })
                .collect(),
        }
    }

    /// The next event in merged order, together with its stream name.
    pub(crate) async fn next(&mut self) -> Option<Result<(StreamName, RecordedEvent), Error>> {
        for source in &mut self.sources {
            if source.head.is_none() && !source.exhausted {
                match source.iterator.next().await {
                    Some(Ok(event)) => source.head = Some(event),
                    Some(Err(err)) => return Some(Err(err)),
                    None => source.exhausted = true,
                }
            }
        }

        let next = self
            .sources
            .iter()
            .enumerate()
            .filter_map(|(index, source)| source.head.as_ref().map(|head| (index, head)))
            .min_by(|(_, a), (_, b)| a.created_at.cmp(&b.created_at).then(a.no.cmp(&b.no)))
            .map(|(index, _)| index)?;

        let source = &mut self.sources[next];
        let event = source.head.take().expect("head checked above");
        Some(Ok((source.stream_name.clone(), event)))
    }
}
