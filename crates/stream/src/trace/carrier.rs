use super::SpanContext;

use crate::message::Metadata;

use thiserror::Error;

/// Single-header B3 key.
pub const HEADER_B3: &str = "b3";
/// Multi-header B3 trace id key.
pub const HEADER_TRACE_ID: &str = "x-b3-traceid";
/// Multi-header B3 span id key.
pub const HEADER_SPAN_ID: &str = "x-b3-spanid";
/// Multi-header B3 parent span id key.
pub const HEADER_PARENT_SPAN_ID: &str = "x-b3-parentspanid";
/// Multi-header B3 sampling key.
pub const HEADER_SAMPLED: &str = "x-b3-sampled";

/// Why a carrier could not be read.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CarrierError {
    /// No B3 fields present.
    #[error("no trace context found")]
    NoTrace,

    /// B3 fields present but unusable.
    #[error("invalid trace context: {0}")]
    InvalidTrace(&'static str),
}

#[derive(Default)]
struct Fields {
    trace_id: Option<String>,
    span_id: Option<String>,
    parent_span_id: Option<String>,
    sampled: Option<String>,
}

impl Fields {
    fn from_single(value: &str) -> Result<Self, CarrierError> {
        let parts: Vec<&str> = value.splitn(4, '-').collect();
        if parts.len() < 3 {
            return Err(CarrierError::InvalidTrace("invalid b3 header"));
        }

        let non_empty = |part: &str| (!part.is_empty()).then(|| part.to_string());

        Ok(Self {
            trace_id: non_empty(parts[0]),
            span_id: non_empty(parts[1]),
            sampled: non_empty(parts[2]),
            parent_span_id: parts.get(3).and_then(|part| non_empty(part)),
        })
    }

    fn from_multi(metadata: &Metadata) -> Result<Self, CarrierError> {
        let mut fields = Self::default();
        let mut found = false;

        for (key, value) in metadata {
            let value = Some(value.trim_matches('"').to_string());
            match key.to_lowercase().as_str() {
                HEADER_TRACE_ID => fields.trace_id = value,
                HEADER_SPAN_ID => fields.span_id = value,
                HEADER_PARENT_SPAN_ID => fields.parent_span_id = value,
                HEADER_SAMPLED => fields.sampled = value,
                _ => continue,
            }
            found = true;
        }

        if found {
            Ok(fields)
        } else {
            Err(CarrierError::NoTrace)
        }
    }
}

fn single_header(metadata: &Metadata) -> Option<&str> {
    metadata
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(HEADER_B3))
        .map(|(_, value)| value.trim_matches('"'))
}

/// Reads a B3 span context from message metadata.
///
/// The single `b3` header wins over the multi-header form.
///
/// # Errors
/// [`CarrierError::NoTrace`] if no B3 field is present and
/// [`CarrierError::InvalidTrace`] if the fields cannot form a span context.
pub fn extract(metadata: &Metadata) -> Result<SpanContext, CarrierError> {
    let fields = match single_header(metadata) {
        Some(value) => Fields::from_single(value)?,
        None => Fields::from_multi(metadata)?,
    };

    let trace_id = fields
        .trace_id
        .ok_or(CarrierError::InvalidTrace("missing trace id"))?;
    let span_id = fields
        .span_id
        .ok_or(CarrierError::InvalidTrace("missing span id"))?;

    Ok(SpanContext {
        trace_id,
        span_id,
        parent_span_id: fields.parent_span_id,
        sampled: fields
            .sampled
            .is_none_or(|sampled| matches!(sampled.as_str(), "1" | "d" | "true")),
    })
}

/// Writes a span context into message metadata in both B3 forms.
pub fn inject(span: &SpanContext, metadata: &mut Metadata) {
    let sampled = if span.sampled { "1" } else { "0" };

    let mut single = format!("{}-{}-{sampled}", span.trace_id, span.span_id);
    if let Some(parent) = &span.parent_span_id {
        single.push('-');
        single.push_str(parent);
        metadata.insert(HEADER_PARENT_SPAN_ID.to_string(), parent.clone());
    } else {
        metadata.remove(HEADER_PARENT_SPAN_ID);
    }

    metadata.insert(HEADER_TRACE_ID.to_string(), span.trace_id.clone());
    metadata.insert(HEADER_SPAN_ID.to_string(), span.span_id.clone());
    metadata.insert(HEADER_SAMPLED.to_string(), sampled.to_string());
    metadata.insert(HEADER_B3.to_string(), single);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(entries: &[(&str, &str)]) -> Metadata {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_extract_single_header() {
        let span = extract(&metadata(&[(
            "b3",
            "80f198ee56343ba864fe8b2a57d3eff7-e457b5a2e4d86bd1-1-05e3ac9a4f6e3b90",
        )]))
        .unwrap();

        assert_eq!(span.trace_id, "80f198ee56343ba864fe8b2a57d3eff7");
        assert_eq!(span.span_id, "e457b5a2e4d86bd1");
        assert_eq!(span.parent_span_id.as_deref(), Some("05e3ac9a4f6e3b90"));
        assert!(span.sampled);
    }

    #[test]
    fn test_extract_single_header_without_parent() {
        let span = extract(&metadata(&[("B3", "abc-def-0")])).unwrap();

        assert_eq!(span.parent_span_id, None);
        assert!(!span.sampled);
    }

    #[test]
    fn test_extract_single_header_too_short() {
        assert_eq!(
            extract(&metadata(&[("b3", "abc-def")])),
            Err(CarrierError::InvalidTrace("invalid b3 header"))
        );
    }

    #[test]
    fn test_extract_multi_header_is_case_insensitive_and_trims_quotes() {
        let span = extract(&metadata(&[
            ("X-B3-TraceId", "\"463ac35c9f6413ad\""),
            ("X-B3-SpanId", "a2fb4a1d1a96d312"),
            ("X-B3-Sampled", "1"),
            ("unrelated", "value"),
        ]))
        .unwrap();

        assert_eq!(span.trace_id, "463ac35c9f6413ad");
        assert_eq!(span.span_id, "a2fb4a1d1a96d312");
        assert!(span.sampled);
    }

    #[test]
    fn test_extract_without_trace_headers() {
        assert_eq!(
            extract(&metadata(&[("k", "v")])),
            Err(CarrierError::NoTrace)
        );
    }

    #[test]
    fn test_extract_missing_span_id() {
        assert_eq!(
            extract(&metadata(&[("x-b3-traceid", "463ac35c9f6413ad")])),
            Err(CarrierError::InvalidTrace("missing span id"))
        );
    }

    #[test]
    fn test_inject_then_extract() {
        let span = SpanContext {
            trace_id: "463ac35c9f6413ad48485a3953bb6124".to_string(),
            span_id: "a2fb4a1d1a96d312".to_string(),
            parent_span_id: Some("0020000000000001".to_string()),
            sampled: true,
        };
        let mut carrier = Metadata::new();

        inject(&span, &mut carrier);

        assert_eq!(
            carrier.get("b3").map(String::as_str),
            Some("463ac35c9f6413ad48485a3953bb6124-a2fb4a1d1a96d312-1-0020000000000001")
        );
        assert_eq!(extract(&carrier).unwrap(), span);
    }
}
