// src/ingest/pager.rs
//! Lazy page walk over a [`FeedSource`].
//!
//! Pages are pulled one request at a time, so a cycle only ever holds one
//! page of records in memory. The resume marker is tracked while walking and
//! is only meaningful once the walk is exhausted.
//!
//! Timestamp feeds resume from the newest record time seen. Cursor feeds
//! resume from the last cursor that moved past a page. Pages fetched after
//! that cursor (a final page with no cursor of its own, or a whole walk over
//! an upstream that never reports one) are re-read next cycle, so their
//! record fingerprints are carried with the marker and those records are
//! skipped on the way back.
//!
//! Records are ordered within a page. Across pages the order is whatever the
//! upstream returns; the marker is the maximum over the whole walk either way.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::error::IngestError;
use crate::ingest::types::{
    record_fingerprint, FeedDefinition, FeedSource, Marker, MarkerMode, PageRequest, PageToken,
    RawRecord,
};

/// Guard against upstreams that never stop paginating.
pub const MAX_PAGES_PER_CYCLE: u32 = 10_000;

/// Start walking `source` from `since`.
pub fn fetch_since<'a>(
    source: &'a dyn FeedSource,
    def: &'a FeedDefinition,
    since: Option<Marker>,
) -> FeedPages<'a> {
    let token = match (&def.marker, &since) {
        (MarkerMode::Cursor, Some(Marker::Cursor(c))) => PageToken::Cursor(c.clone()),
        _ => PageToken::Number(1),
    };
    let floor = since.as_ref().and_then(Marker::timestamp);
    let resume_cursor = match &since {
        Some(Marker::Cursor(c)) => Some(c.clone()),
        _ => None,
    };
    FeedPages {
        source,
        def,
        since,
        token: Some(token),
        pages: 0,
        floor,
        newest: None,
        resume_cursor,
        delivered: HashSet::new(),
        reread: Vec::new(),
    }
}

pub struct FeedPages<'a> {
    source: &'a dyn FeedSource,
    def: &'a FeedDefinition,
    since: Option<Marker>,
    token: Option<PageToken>,
    pages: u32,
    /// Records at or below this were already delivered.
    floor: Option<DateTime<Utc>>,
    newest: Option<DateTime<Utc>>,
    resume_cursor: Option<String>,
    /// Fingerprints delivered by earlier cycles at the stored cursor.
    delivered: HashSet<String>,
    /// Fingerprints of every record a resume from `resume_cursor` re-reads.
    reread: Vec<String>,
}

impl<'a> FeedPages<'a> {
    /// Skip records with these fingerprints. Cursor feeds only.
    pub fn skipping(mut self, delivered: &[String]) -> FeedPages<'a> {
        if self.def.marker == MarkerMode::Cursor {
            self.delivered = delivered.iter().cloned().collect();
        }
        self
    }

    /// Next page of new records, ordered by marker ascending.
    /// `Ok(None)` once the upstream reports no further pages.
    pub async fn next_page(&mut self) -> Result<Option<Vec<RawRecord>>, IngestError> {
        let Some(token) = self.token.take() else {
            return Ok(None);
        };
        if self.pages >= MAX_PAGES_PER_CYCLE {
            return Err(IngestError::Protocol(format!(
                "{}: more than {MAX_PAGES_PER_CYCLE} pages in one cycle",
                self.def.id()
            )));
        }

        let request = PageRequest {
            since: self.since.clone(),
            token: token.clone(),
            page_size: self.def.page_size,
        };
        let page = self.source.fetch_page(&request).await?;
        self.pages += 1;

        if page.next.as_ref() == Some(&token) {
            return Err(IngestError::Protocol(format!(
                "{}: upstream returned the same page token twice ({token:?})",
                self.def.id()
            )));
        }
        self.token = page.next;

        if self.def.marker == MarkerMode::Cursor {
            return Ok(Some(self.cursor_page(&token, page.cursor, page.records)));
        }

        let mut keyed: Vec<(Option<DateTime<Utc>>, RawRecord)> = page
            .records
            .into_iter()
            .map(|r| (self.def.record_timestamp(&r), r))
            .filter(|(at, _)| match (at, self.floor) {
                (Some(at), Some(floor)) => *at > floor,
                _ => true,
            })
            .collect();
        // Stable: equal or missing timestamps keep upstream order.
        keyed.sort_by_key(|(at, _)| *at);

        if let Some(max) = keyed.iter().filter_map(|(at, _)| *at).max() {
            self.newest = Some(self.newest.map_or(max, |n| n.max(max)));
        }

        Ok(Some(keyed.into_iter().map(|(_, r)| r).collect()))
    }

    fn cursor_page(
        &mut self,
        fetched_with: &PageToken,
        reported: Option<String>,
        records: Vec<RawRecord>,
    ) -> Vec<RawRecord> {
        // A cursor equal to the one that fetched this page has not moved.
        let advanced = reported.filter(|c| *fetched_with != PageToken::Cursor(c.clone()));
        let fingerprints: Vec<String> = records.iter().map(record_fingerprint).collect();
        match advanced {
            Some(c) => {
                self.resume_cursor = Some(c);
                self.reread.clear();
            }
            None => self.reread.extend(fingerprints.iter().cloned()),
        }
        records
            .into_iter()
            .zip(fingerprints)
            .filter(|(_, fp)| !self.delivered.contains(fp))
            .map(|(r, _)| r)
            .collect()
    }

    /// Number of pages fetched so far.
    pub fn pages(&self) -> u32 {
        self.pages
    }

    /// Fingerprints to persist with [`FeedPages::next_marker`]. Empty for
    /// timestamp feeds and for cursor walks that ended on a fresh cursor.
    pub fn delivered(&self) -> Vec<String> {
        self.reread.clone()
    }

    /// Marker to persist after every page has been emitted.
    pub fn next_marker(&self) -> Option<Marker> {
        match self.def.marker {
            MarkerMode::Cursor => self.resume_cursor.clone().map(Marker::Cursor),
            MarkerMode::Timestamp { .. } => {
                let seen = self.newest.map(Marker::Timestamp);
                match (self.since.clone(), seen) {
                    (Some(since), Some(seen)) => Some(Marker::advance(Some(&since), seen)),
                    (since, seen) => seen.or(since),
                }
            }
        }
    }
}
