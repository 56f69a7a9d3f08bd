//! Planning of range responses.
//!
//! Turns the client's `Range` header and the upstream's size into the exact byte interval
//! and status that will be sent. Planning never touches the upstream and never fails on a
//! malformed header: anything that is not a single well-formed `bytes` range is served as
//! full content.
//!
//! See <https://developer.mozilla.org/en-US/docs/Web/HTTP/Range_requests>

use axum::http::header::RANGE;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum_extra::headers::ContentRange;

use crate::upstream::ResourceSize;

/// The only range unit the proxy understands
const BYTES_UNIT: &str = "bytes";

/// The requested range lies completely outside a resource of known size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("Requested range not satisfiable for a resource of {total} bytes")]
pub struct RangeNotSatisfiable {
    pub total: u64,
}

impl RangeNotSatisfiable {
    /// The `Content-Range: bytes */<total>` value that accompanies a 416
    pub fn content_range(self) -> ContentRange {
        ContentRange::unsatisfied_bytes(self.total)
    }
}

/// A single byte range as written by the client, not yet resolved against a size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteRangeSpec {
    /// `bytes=<start>-` or `bytes=<start>-<end>`, end inclusive
    FromTo { start: u64, end: Option<u64> },

    /// `bytes=-<len>`, the last `len` bytes
    Suffix { len: u64 },
}

/// The parsed `Range` header of one request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeRequest {
    raw: Option<String>,
    spec: Option<ByteRangeSpec>,
}

impl RangeRequest {
    /// Request without a `Range` header
    pub const fn full() -> Self {
        Self {
            raw: None,
            spec: None,
        }
    }

    pub fn from_headers(headers: &HeaderMap) -> Self {
        match headers.get(RANGE).map(|value| value.to_str()) {
            Some(Ok(value)) => Self::parse(value),
            Some(Err(_)) => {
                tracing::debug!("Ignoring non-ASCII range header");
                Self::full()
            }
            None => Self::full(),
        }
    }

    /// Parse a `Range` header value.
    ///
    /// Supports:
    /// - `bytes=start-end`
    /// - `bytes=start-`
    /// - `bytes=-suffix_len`
    ///
    /// Everything else (other units, multiple ranges, `end < start`, non-digits) keeps the
    /// raw value but carries no range.
    pub fn parse(raw: &str) -> Self {
        let spec = parse_spec(raw);

        if spec.is_none() {
            tracing::debug!("Malformed or unsupported range {raw:?}, serving full content");
        }

        Self {
            raw: Some(raw.to_owned()),
            spec,
        }
    }

    #[inline]
    pub fn raw(&self) -> Option<&str> {
        self.raw.as_deref()
    }

    #[inline]
    pub const fn spec(&self) -> Option<ByteRangeSpec> {
        self.spec
    }
}

fn parse_number(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    value.parse().ok()
}

fn parse_spec(raw: &str) -> Option<ByteRangeSpec> {
    let (unit, set) = raw.trim().split_once('=')?;

    if unit.trim() != BYTES_UNIT {
        return None;
    }

    // only a single range is supported
    if set.contains(',') {
        return None;
    }

    let (start, end) = set.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        return Some(ByteRangeSpec::Suffix {
            len: parse_number(end)?,
        });
    }

    let start = parse_number(start)?;

    let end = if end.is_empty() {
        None
    } else {
        let end = parse_number(end)?;

        if end < start {
            return None;
        }

        Some(end)
    };

    Some(ByteRangeSpec::FromTo { start, end })
}

/// The outcome of planning: which bytes will be sent and with what status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangePlan {
    status: StatusCode,
    start: u64,
    length: Option<u64>,
    total: ResourceSize,
}

impl RangePlan {
    fn full(total: ResourceSize) -> Self {
        Self {
            status: StatusCode::OK,
            start: 0,
            length: total.known(),
            total,
        }
    }

    fn partial(start: u64, end: u64, total: ResourceSize) -> Self {
        Self {
            status: StatusCode::PARTIAL_CONTENT,
            start,
            length: Some((end - start).saturating_add(1)),
            total,
        }
    }

    /// Either `200 OK` or `206 Partial Content`
    #[inline]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    #[inline]
    pub fn is_partial(&self) -> bool {
        self.status == StatusCode::PARTIAL_CONTENT
    }

    /// First byte that will be sent
    #[inline]
    pub const fn start(&self) -> u64 {
        self.start
    }

    /// Last byte that will be sent (inclusive), unknown for an unbounded full response
    pub fn end(&self) -> Option<u64> {
        self.length
            .and_then(|length| length.checked_sub(1))
            .map(|last| self.start + last)
    }

    /// Number of bytes the body will carry, `None` when the upstream size is unknown and
    /// the full content is streamed until it ends
    #[inline]
    pub const fn content_length(&self) -> Option<u64> {
        self.length
    }

    /// `Content-Range` for partial responses
    pub fn content_range(&self) -> Option<ContentRange> {
        if !self.is_partial() {
            return None;
        }

        let end = self.end()?;

        ContentRange::bytes(self.start..=end, self.total.known()).ok()
    }
}

/// Resolves range requests against resource sizes.
#[derive(Clone, Copy, Debug)]
pub struct RangePlanner {
    open_ended_window: u64,
}

impl RangePlanner {
    /// `open_ended_window` bounds `bytes=<start>-` requests when the total size is unknown.
    pub const fn new(open_ended_window: u64) -> Self {
        Self { open_ended_window }
    }

    /// Plan the response for `request` on a resource of the given size.
    ///
    /// # Errors
    ///
    /// Fails with [`RangeNotSatisfiable`] when the size is known and the range starts at or
    /// beyond it.
    pub fn plan(
        &self,
        request: &RangeRequest,
        total: ResourceSize,
    ) -> Result<RangePlan, RangeNotSatisfiable> {
        let Some(spec) = request.spec() else {
            return Ok(RangePlan::full(total));
        };

        let plan = match total {
            ResourceSize::Known(size) => Self::plan_known(spec, size)?,
            ResourceSize::Unknown => self.plan_unknown(spec),
        };

        tracing::trace!(
            "Planned {:?} as {} start: {}, length: {:?}",
            request.raw(),
            plan.status,
            plan.start,
            plan.length,
        );

        Ok(plan)
    }

    fn plan_known(spec: ByteRangeSpec, size: u64) -> Result<RangePlan, RangeNotSatisfiable> {
        let total = ResourceSize::Known(size);

        // nothing to slice, probes from the first byte get the empty body
        if size == 0 {
            return match spec {
                ByteRangeSpec::FromTo { start: 0, .. } | ByteRangeSpec::Suffix { len: 1.. } => {
                    Ok(RangePlan::full(total))
                }
                _ => Err(RangeNotSatisfiable { total: 0 }),
            };
        }

        let last = size - 1;

        match spec {
            ByteRangeSpec::FromTo { start, end } => {
                if start >= size {
                    return Err(RangeNotSatisfiable { total: size });
                }

                let end = end.map_or(last, |end| end.min(last));

                Ok(RangePlan::partial(start, end, total))
            }

            ByteRangeSpec::Suffix { len: 0 } => Err(RangeNotSatisfiable { total: size }),

            ByteRangeSpec::Suffix { len } => {
                Ok(RangePlan::partial(size.saturating_sub(len), last, total))
            }
        }
    }

    fn window_end(&self, start: u64) -> u64 {
        start.saturating_add(self.open_ended_window.max(1) - 1)
    }

    fn plan_unknown(&self, spec: ByteRangeSpec) -> RangePlan {
        let total = ResourceSize::Unknown;

        match spec {
            ByteRangeSpec::FromTo {
                start,
                end: Some(end),
            } => RangePlan::partial(start, end, total),

            ByteRangeSpec::FromTo { start, end: None } => {
                RangePlan::partial(start, self.window_end(start), total)
            }

            // the tail cannot be located without a size, stay within the window
            ByteRangeSpec::Suffix { .. } => {
                tracing::debug!("Suffix range on a resource of unknown size, serving first window");

                RangePlan::partial(0, self.window_end(0), total)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLANNER: RangePlanner = RangePlanner::new(1024);

    fn plan(header: &str, size: u64) -> Result<RangePlan, RangeNotSatisfiable> {
        PLANNER.plan(&RangeRequest::parse(header), ResourceSize::Known(size))
    }

    #[test]
    fn parse_range_header_start_end() {
        assert_eq!(
            RangeRequest::parse("bytes=0-1023").spec(),
            Some(ByteRangeSpec::FromTo {
                start: 0,
                end: Some(1023)
            })
        );
    }

    #[test]
    fn parse_range_header_open_ended() {
        assert_eq!(
            RangeRequest::parse("bytes=500-").spec(),
            Some(ByteRangeSpec::FromTo {
                start: 500,
                end: None
            })
        );
    }

    #[test]
    fn parse_range_header_suffix() {
        assert_eq!(
            RangeRequest::parse("bytes=-1024").spec(),
            Some(ByteRangeSpec::Suffix { len: 1024 })
        );
    }

    #[test]
    fn parse_range_header_invalid() {
        for header in [
            "invalid",
            "bytes=abc-xyz",
            "bytes=-",
            "bytes=+5-10",
            "bytes=10-5",
            "bytes=0-1,5-6",
            "items=0-10",
            "bytes 0-10",
        ] {
            let request = RangeRequest::parse(header);

            assert_eq!(request.spec(), None, "{header}");
            assert_eq!(request.raw(), Some(header));
        }
    }

    #[test]
    fn missing_header_is_full_request() {
        let request = RangeRequest::from_headers(&HeaderMap::new());

        assert_eq!(request, RangeRequest::full());
        assert_eq!(request.raw(), None);
    }

    #[test]
    fn header_is_read_from_map() {
        let mut headers = HeaderMap::new();
        headers.insert(RANGE, "bytes=5-9".parse().unwrap());

        assert_eq!(
            RangeRequest::from_headers(&headers).spec(),
            Some(ByteRangeSpec::FromTo {
                start: 5,
                end: Some(9)
            })
        );
    }

    #[test]
    fn no_range_is_full_content() {
        let plan = PLANNER
            .plan(&RangeRequest::full(), ResourceSize::Known(1000))
            .unwrap();

        assert_eq!(plan.status(), StatusCode::OK);
        assert_eq!(plan.start(), 0);
        assert_eq!(plan.end(), Some(999));
        assert_eq!(plan.content_length(), Some(1000));
        assert!(plan.content_range().is_none());
    }

    #[test]
    fn malformed_range_is_full_content() {
        let plan = plan("bytes=abc-xyz", 1000).unwrap();

        assert_eq!(plan.status(), StatusCode::OK);
        assert_eq!(plan.content_length(), Some(1000));
    }

    #[test]
    fn valid_ranges_are_partial() {
        let size = 1000;

        for (start, end) in [(0, 0), (0, 999), (100, 199), (999, 999), (500, 998)] {
            let plan = plan(&format!("bytes={start}-{end}"), size).unwrap();

            assert_eq!(plan.status(), StatusCode::PARTIAL_CONTENT);
            assert_eq!(plan.start(), start);
            assert_eq!(plan.end(), Some(end));
            assert_eq!(plan.content_length(), Some(end - start + 1));
        }
    }

    #[test]
    fn first_byte_probe_is_one_byte() {
        let plan = plan("bytes=0-0", 1000).unwrap();

        assert_eq!(plan.content_length(), Some(1));
        assert_eq!(
            plan.content_range(),
            Some(ContentRange::bytes(0..=0, 1000).unwrap())
        );
    }

    #[test]
    fn start_beyond_size_is_not_satisfiable() {
        for start in [1000, 1001, u64::MAX] {
            assert_eq!(
                plan(&format!("bytes={start}-"), 1000),
                Err(RangeNotSatisfiable { total: 1000 })
            );
        }
    }

    #[test]
    fn end_is_clamped_to_size() {
        let plan = plan("bytes=900-5000", 1000).unwrap();

        assert_eq!(plan.end(), Some(999));
        assert_eq!(plan.content_length(), Some(100));
    }

    #[test]
    fn open_ended_range_runs_to_the_end() {
        let plan = plan("bytes=250-", 1000).unwrap();

        assert_eq!(plan.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(plan.end(), Some(999));
        assert_eq!(plan.content_length(), Some(750));
    }

    #[test]
    fn suffix_range_is_the_tail() {
        let plan = plan("bytes=-100", 1000).unwrap();

        assert_eq!(plan.start(), 900);
        assert_eq!(plan.end(), Some(999));

        let plan = self::plan("bytes=-5000", 1000).unwrap();

        assert_eq!(plan.start(), 0);
        assert_eq!(plan.content_length(), Some(1000));
        assert_eq!(plan.status(), StatusCode::PARTIAL_CONTENT);
    }

    #[test]
    fn empty_suffix_is_not_satisfiable() {
        assert_eq!(
            plan("bytes=-0", 1000),
            Err(RangeNotSatisfiable { total: 1000 })
        );
    }

    #[test]
    fn empty_resource_answers_with_empty_body() {
        let plan = plan("bytes=0-0", 0).unwrap();

        assert_eq!(plan.status(), StatusCode::OK);
        assert_eq!(plan.content_length(), Some(0));
        assert_eq!(plan.end(), None);

        for header in ["bytes=0-", "bytes=-10"] {
            assert_eq!(self::plan(header, 0).unwrap().content_length(), Some(0));
        }
    }

    #[test]
    fn empty_resource_rejects_ranges_past_the_end() {
        for header in ["bytes=500-999", "bytes=1-", "bytes=-0"] {
            assert_eq!(
                plan(header, 0),
                Err(RangeNotSatisfiable { total: 0 }),
                "{header}"
            );
        }
    }

    #[test]
    fn unknown_size_honors_explicit_end() {
        let plan = PLANNER
            .plan(&RangeRequest::parse("bytes=10-19"), ResourceSize::Unknown)
            .unwrap();

        assert_eq!(plan.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(plan.content_length(), Some(10));
        assert_eq!(
            plan.content_range(),
            Some(ContentRange::bytes(10..=19, None::<u64>).unwrap())
        );
    }

    #[test]
    fn unknown_size_bounds_open_ended_range() {
        let plan = PLANNER
            .plan(&RangeRequest::parse("bytes=4096-"), ResourceSize::Unknown)
            .unwrap();

        assert_eq!(plan.start(), 4096);
        assert_eq!(plan.content_length(), Some(1024));
        assert_eq!(plan.end(), Some(4096 + 1023));
    }

    #[test]
    fn unknown_size_bounds_suffix_range_to_window() {
        let plan = PLANNER
            .plan(&RangeRequest::parse("bytes=-100"), ResourceSize::Unknown)
            .unwrap();

        assert_eq!(plan.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(plan.start(), 0);
        assert_eq!(plan.content_length(), Some(1024));
        assert_eq!(
            plan.content_range(),
            Some(ContentRange::bytes(0..=1023, None::<u64>).unwrap())
        );
    }

    #[test]
    fn unsatisfiable_content_range() {
        assert_eq!(
            RangeNotSatisfiable { total: 42 }.content_range(),
            ContentRange::unsatisfied_bytes(42)
        );
    }
}
