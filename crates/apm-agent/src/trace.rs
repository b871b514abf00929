// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Segment tree of a single transaction.
//!
//! Segments live in an arena owned by the [`Trace`]; index 0 is the synthetic
//! root. Children are kept in call order. A segment's timing is fixed once it
//! ends and later attempts to change it are ignored.

use crate::constants::ROOT_SEGMENT_NAME;
use crate::recorder::{Recorder, SegmentTiming};
use serde::ser::{Serialize, SerializeTuple, Serializer};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SegmentId(usize);

#[derive(Clone, Debug)]
pub struct Segment {
    name: String,
    parent: Option<SegmentId>,
    children: Vec<SegmentId>,
    started_at: Instant,
    /// Offset from the start of the trace.
    start: Duration,
    duration: Option<Duration>,
    /// Exclusive time supplied by instrumentation, if any.
    exclusive: Option<Duration>,
    recorder: Option<Recorder>,
}

impl Segment {
    fn new(
        name: String,
        parent: Option<SegmentId>,
        start: Duration,
        recorder: Option<Recorder>,
    ) -> Self {
        Self {
            name,
            parent,
            children: Vec::new(),
            started_at: Instant::now(),
            start,
            duration: None,
            exclusive: None,
            recorder,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<SegmentId> {
        self.parent
    }

    pub fn children(&self) -> &[SegmentId] {
        &self.children
    }

    pub fn start(&self) -> Duration {
        self.start
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn is_finished(&self) -> bool {
        self.duration.is_some()
    }

    pub fn recorder(&self) -> Option<&Recorder> {
        self.recorder.as_ref()
    }
}

#[derive(Clone, Debug)]
pub struct Trace {
    segments: Vec<Segment>,
    started_at: Instant,
    start_time: SystemTime,
    duration: Option<Duration>,
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

impl Trace {
    pub fn new() -> Self {
        Self {
            segments: vec![Segment::new(
                ROOT_SEGMENT_NAME.to_string(),
                None,
                Duration::ZERO,
                None,
            )],
            started_at: Instant::now(),
            start_time: SystemTime::now(),
            duration: None,
        }
    }

    pub fn root(&self) -> SegmentId {
        SegmentId(0)
    }

    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    pub fn segment(&self, id: SegmentId) -> Option<&Segment> {
        self.segments.get(id.0)
    }

    pub fn segments(&self) -> impl Iterator<Item = (SegmentId, &Segment)> {
        self.segments
            .iter()
            .enumerate()
            .map(|(index, segment)| (SegmentId(index), segment))
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.len() <= 1
    }

    /// Opens a child of `parent`. Unknown parents fall back to the root.
    pub fn add(
        &mut self,
        parent: SegmentId,
        name: impl Into<String>,
        recorder: Option<Recorder>,
    ) -> SegmentId {
        let parent = if parent.0 < self.segments.len() {
            parent
        } else {
            self.root()
        };
        let id = SegmentId(self.segments.len());
        let start = self.started_at.elapsed();
        self.segments.push(Segment::new(name.into(), Some(parent), start, recorder));
        self.segments[parent.0].children.push(id);
        id
    }

    /// Places a segment explicitly: `start` is the offset from the trace start.
    pub fn set_timing(&mut self, id: SegmentId, start: Duration, duration: Duration) {
        if let Some(segment) = self.unfinished_mut(id) {
            segment.start = start;
            segment.duration = Some(duration);
        }
    }

    /// Fixes a segment's total and, optionally, its exclusive duration.
    /// A supplied exclusive duration larger than the total is capped to it.
    pub fn set_duration(&mut self, id: SegmentId, total: Duration, exclusive: Option<Duration>) {
        if let Some(segment) = self.unfinished_mut(id) {
            if exclusive.is_some_and(|exclusive| exclusive > total) {
                warn!(
                    "Segment {} reported exclusive time above its total, capping",
                    segment.name
                );
            }
            segment.duration = Some(total);
            segment.exclusive = exclusive.map(|exclusive| exclusive.min(total));
        }
    }

    /// Ends a segment with the wall time elapsed since it was opened.
    pub fn end_segment(&mut self, id: SegmentId) {
        if let Some(segment) = self.unfinished_mut(id) {
            segment.duration = Some(segment.started_at.elapsed());
        }
    }

    /// Ends the trace. The trace lasts as long as the root, or the elapsed
    /// wall time when the root was never timed. Open segments are closed at
    /// the end of the trace.
    pub fn end(&mut self) {
        if self.duration.is_some() {
            return;
        }
        let duration = self.segments[0]
            .duration
            .unwrap_or_else(|| self.started_at.elapsed());
        for segment in &mut self.segments {
            if segment.duration.is_none() {
                segment.duration = Some(duration.saturating_sub(segment.start));
            }
        }
        self.duration = Some(duration);
    }

    pub fn is_ended(&self) -> bool {
        self.duration.is_some()
    }

    /// Transaction-wide duration; the elapsed time while still running.
    pub fn duration(&self) -> Duration {
        self.duration.unwrap_or_else(|| self.started_at.elapsed())
    }

    /// Total time minus the time covered by the segment's immediate children.
    ///
    /// Child intervals are clipped to the parent's span and overlapping
    /// children are counted once, so the result lies in `[0, total]`.
    pub fn exclusive_duration(&self, id: SegmentId) -> Duration {
        let Some(segment) = self.segment(id) else {
            return Duration::ZERO;
        };
        let Some(total) = segment.duration else {
            return Duration::ZERO;
        };
        if let Some(exclusive) = segment.exclusive {
            return exclusive;
        }

        let span_start = segment.start;
        let span_end = segment.start.saturating_add(total);
        let mut children_total = Duration::ZERO;
        let mut intervals: Vec<(Duration, Duration)> = segment
            .children
            .iter()
            .filter_map(|child| {
                let child = &self.segments[child.0];
                let duration = child.duration?;
                children_total = children_total.saturating_add(duration);
                let start = child.start.max(span_start);
                let end = child.start.saturating_add(duration).min(span_end);
                (start < end).then_some((start, end))
            })
            .collect();
        if children_total > total {
            debug!(
                "Children of segment {} exceed its duration ({:?} > {:?})",
                segment.name, children_total, total
            );
        }

        intervals.sort_unstable();
        let mut covered = Duration::ZERO;
        let mut current: Option<(Duration, Duration)> = None;
        for (start, end) in intervals {
            current = match current {
                Some((open_start, open_end)) if start <= open_end => {
                    Some((open_start, open_end.max(end)))
                }
                Some((open_start, open_end)) => {
                    covered += open_end - open_start;
                    Some((start, end))
                }
                None => Some((start, end)),
            };
        }
        if let Some((open_start, open_end)) = current {
            covered += open_end - open_start;
        }
        total.saturating_sub(covered)
    }

    /// Duration and exclusive duration of a segment, in seconds.
    pub fn timing(&self, id: SegmentId) -> SegmentTiming {
        let duration = self
            .segment(id)
            .and_then(Segment::duration)
            .unwrap_or_default();
        SegmentTiming {
            duration: duration.as_secs_f64(),
            exclusive: self.exclusive_duration(id).as_secs_f64(),
        }
    }

    /// Encodes the tree for a transaction trace. The root's children are
    /// wrapped in a node named after `scope`.
    pub fn to_node(&self, scope: &str) -> TraceNode {
        let mut node = self.node(self.root());
        node.children = vec![TraceNode {
            start_ms: 0,
            end_ms: node.end_ms,
            name: scope.to_string(),
            children: std::mem::take(&mut node.children),
        }];
        node
    }

    fn node(&self, id: SegmentId) -> TraceNode {
        let segment = &self.segments[id.0];
        let start = segment.start;
        let end = start.saturating_add(segment.duration.unwrap_or_default());
        TraceNode {
            start_ms: millis(start),
            end_ms: millis(end),
            name: segment.name.clone(),
            children: segment.children.iter().map(|child| self.node(*child)).collect(),
        }
    }

    fn unfinished_mut(&mut self, id: SegmentId) -> Option<&mut Segment> {
        match self.segments.get_mut(id.0) {
            Some(segment) if segment.duration.is_none() => Some(segment),
            Some(segment) => {
                debug!("Segment {} already ended, ignoring new timing", segment.name);
                None
            }
            None => None,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Wire form of a trace node: `[start_ms, end_ms, name, {}, [children]]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceNode {
    pub start_ms: u64,
    pub end_ms: u64,
    pub name: String,
    pub children: Vec<TraceNode>,
}

impl Serialize for TraceNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(5)?;
        tuple.serialize_element(&self.start_ms)?;
        tuple.serialize_element(&self.end_ms)?;
        tuple.serialize_element(&self.name)?;
        tuple.serialize_element(&serde_json::Map::new())?;
        tuple.serialize_element(&self.children)?;
        tuple.end()
    }
}
