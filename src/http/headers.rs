use headers::{Header, HeaderName, HeaderValue};

/// `Range: <start>-<end>` as reported on upload PATCH responses: the span
/// of bytes the registry has received for the session so far.
///
/// Decoding rejects inverted spans, so a value like `50-10` never makes it
/// past the header boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

impl Range {
    /// The span `0-<total>` for a session that has received `total` bytes.
    pub fn received(total: u64) -> Self {
        Self {
            start: 0,
            end: total,
        }
    }
}

impl std::fmt::Display for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

static RANGE_NAME: HeaderName = HeaderName::from_static("range");

impl Header for Range {
    fn name() -> &'static HeaderName {
        &RANGE_NAME
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let s = value.to_str().map_err(|_| headers::Error::invalid())?;

        let (start, end) = s.split_once('-').ok_or_else(headers::Error::invalid)?;
        let range = Range {
            start: start.parse().map_err(|_| headers::Error::invalid())?,
            end: end.parse().map_err(|_| headers::Error::invalid())?,
        };
        if range.start > range.end {
            return Err(headers::Error::invalid());
        }
        Ok(range)
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        // digits and a dash are always a valid header value
        values.extend(HeaderValue::from_str(&self.to_string()).ok());
    }
}
