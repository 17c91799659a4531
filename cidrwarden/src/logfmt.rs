//! Access-log format templates.
//!
//! A template mixes literal text with `%`-tokens, e.g. the combined log
//! format `%h %^ %^ [%t] "%r" %s %b "%^" "%u"`. Exactly one `%h` (client
//! address) is required. `%t` matches the classic bracketed
//! `DD/MMM/YYYY:HH:MM:SS +ZZZZ` timestamp; whitespace, quotes and
//! brackets in the template must appear verbatim in the log line.

use chrono::{DateTime, Utc};
use thiserror::Error;

const TIMESTAMP_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LogFmtError {
    #[error("template has no %h token")]
    NoHostToken,
    #[error("template has more than one %h token")]
    MultipleHostTokens,
    #[error("unknown template token %{0}")]
    UnknownToken(char),
    #[error("template ends with a bare %")]
    DanglingPercent,
    #[error("template has two tokens with no literal between them")]
    AdjacentTokens,
    #[error("log line does not match template literal {expected:?}")]
    LiteralMismatch { expected: String },
    #[error("unterminated [timestamp] field")]
    UnterminatedTimestamp,
    #[error("unparsable timestamp {0:?}")]
    BadTimestamp(String),
    #[error("unparsable status code {0:?}")]
    BadStatus(String),
    #[error("unparsable byte count {0:?}")]
    BadBytes(String),
    #[error("log line has trailing input {0:?}")]
    TrailingInput(String),
}

impl LogFmtError {
    /// Stable short label for reject aggregation in reports.
    pub fn kind_label(&self) -> &'static str {
        match self {
            LogFmtError::NoHostToken
            | LogFmtError::MultipleHostTokens
            | LogFmtError::UnknownToken(_)
            | LogFmtError::DanglingPercent
            | LogFmtError::AdjacentTokens => "invalid log format template",
            LogFmtError::LiteralMismatch { .. } | LogFmtError::TrailingInput(_) => {
                "malformed log line"
            }
            LogFmtError::UnterminatedTimestamp | LogFmtError::BadTimestamp(_) => {
                "unparsable timestamp"
            }
            LogFmtError::BadStatus(_) => "unparsable status code",
            LogFmtError::BadBytes(_) => "unparsable byte count",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Host,
    Timestamp,
    RequestLine,
    Method,
    Url,
    Status,
    Bytes,
    UserAgent,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(FieldKind),
}

/// One parsed request line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRecord {
    pub ip: String,
    pub ts: Option<DateTime<Utc>>,
    pub method: Option<String>,
    pub url: Option<String>,
    pub request_line: Option<String>,
    pub status: Option<u16>,
    pub bytes: Option<u64>,
    pub user_agent: Option<String>,
}

impl HttpRecord {
    /// The request path, from `%U` or derived from `%r`.
    pub fn endpoint(&self) -> &str {
        self.url.as_deref().unwrap_or("")
    }

    pub fn agent(&self) -> &str {
        self.user_agent.as_deref().unwrap_or("")
    }
}

/// A compiled log-format template.
#[derive(Debug, Clone)]
pub struct LogFormat {
    segments: Vec<Segment>,
    template: String,
}

impl LogFormat {
    pub fn parse(template: &str) -> Result<Self, LogFmtError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars();
        let mut hosts = 0usize;

        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            let token = chars.next().ok_or(LogFmtError::DanglingPercent)?;
            let kind = match token {
                'h' => FieldKind::Host,
                't' => FieldKind::Timestamp,
                'r' => FieldKind::RequestLine,
                'm' => FieldKind::Method,
                'U' => FieldKind::Url,
                's' => FieldKind::Status,
                'b' => FieldKind::Bytes,
                'u' => FieldKind::UserAgent,
                '^' => FieldKind::Skip,
                other => return Err(LogFmtError::UnknownToken(other)),
            };
            if kind == FieldKind::Host {
                hosts += 1;
            }
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            } else if matches!(segments.last(), Some(Segment::Field(k)) if *k != FieldKind::Timestamp)
            {
                // Only a bracketed %t can delimit itself.
                return Err(LogFmtError::AdjacentTokens);
            }
            segments.push(Segment::Field(kind));
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        match hosts {
            0 => Err(LogFmtError::NoHostToken),
            1 => Ok(Self {
                segments,
                template: template.to_string(),
            }),
            _ => Err(LogFmtError::MultipleHostTokens),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn parse_line(&self, line: &str) -> Result<HttpRecord, LogFmtError> {
        let mut rest = line;
        let mut record = HttpRecord::default();
        let mut segments = self.segments.iter().peekable();

        while let Some(segment) = segments.next() {
            match segment {
                Segment::Literal(lit) => {
                    rest = rest
                        .strip_prefix(lit.as_str())
                        .ok_or_else(|| LogFmtError::LiteralMismatch {
                            expected: lit.clone(),
                        })?;
                }
                Segment::Field(kind) => {
                    let value;
                    if *kind == FieldKind::Timestamp && rest.starts_with('[') {
                        let end = rest.find(']').ok_or(LogFmtError::UnterminatedTimestamp)?;
                        value = &rest[1..end];
                        rest = &rest[end + 1..];
                    } else {
                        match segments.peek() {
                            Some(Segment::Literal(lit)) => {
                                let pos = rest.find(lit.as_str()).ok_or_else(|| {
                                    LogFmtError::LiteralMismatch {
                                        expected: lit.clone(),
                                    }
                                })?;
                                value = &rest[..pos];
                                rest = &rest[pos..];
                            }
                            None => {
                                value = rest;
                                rest = "";
                            }
                            Some(Segment::Field(_)) => return Err(LogFmtError::AdjacentTokens),
                        }
                    }
                    set_field(&mut record, *kind, value)?;
                }
            }
        }

        if !rest.trim().is_empty() {
            return Err(LogFmtError::TrailingInput(rest.to_string()));
        }
        Ok(record)
    }
}

fn set_field(record: &mut HttpRecord, kind: FieldKind, value: &str) -> Result<(), LogFmtError> {
    match kind {
        FieldKind::Host => record.ip = value.to_string(),
        FieldKind::Timestamp => {
            let ts = DateTime::parse_from_str(value, TIMESTAMP_FORMAT)
                .map_err(|_| LogFmtError::BadTimestamp(value.to_string()))?;
            record.ts = Some(ts.with_timezone(&Utc));
        }
        FieldKind::RequestLine => {
            record.request_line = Some(value.to_string());
            let mut parts = value.split_whitespace();
            let method = parts.next();
            let url = parts.next();
            if record.method.is_none() {
                record.method = method.map(str::to_string);
            }
            if record.url.is_none() {
                record.url = url.map(str::to_string);
            }
        }
        FieldKind::Method => record.method = Some(value.to_string()),
        FieldKind::Url => record.url = Some(value.to_string()),
        FieldKind::Status => {
            if value != "-" {
                let status = value
                    .parse::<u16>()
                    .map_err(|_| LogFmtError::BadStatus(value.to_string()))?;
                record.status = Some(status);
            }
        }
        FieldKind::Bytes => {
            record.bytes = Some(if value == "-" {
                0
            } else {
                value
                    .parse::<u64>()
                    .map_err(|_| LogFmtError::BadBytes(value.to_string()))?
            });
        }
        FieldKind::UserAgent => record.user_agent = Some(value.to_string()),
        FieldKind::Skip => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const COMBINED: &str = "%h %^ %^ [%t] \"%r\" %s %b \"%^\" \"%u\"";

    #[test]
    fn parses_a_combined_log_line() {
        let fmt = LogFormat::parse(COMBINED).unwrap();
        let record = fmt
            .parse_line(
                "203.0.113.9 - frank [10/Oct/2023:13:55:36 -0700] \"GET /apache_pb.gif HTTP/1.0\" 200 2326 \"http://example.com/start.html\" \"Mozilla/4.08 [en] (Win98; I ;Nav)\"",
            )
            .unwrap();
        assert_eq!(record.ip, "203.0.113.9");
        assert_eq!(record.method.as_deref(), Some("GET"));
        assert_eq!(record.url.as_deref(), Some("/apache_pb.gif"));
        assert_eq!(record.endpoint(), "/apache_pb.gif");
        assert_eq!(record.status, Some(200));
        assert_eq!(record.bytes, Some(2326));
        assert_eq!(record.agent(), "Mozilla/4.08 [en] (Win98; I ;Nav)");
        assert_eq!(
            record.ts,
            Some(Utc.with_ymd_and_hms(2023, 10, 10, 20, 55, 36).unwrap())
        );
    }

    #[test]
    fn timestamp_token_accepts_its_own_brackets() {
        let fmt = LogFormat::parse("%h %t").unwrap();
        let record = fmt
            .parse_line("10.0.0.1 [10/Oct/2023:13:55:36 +0000]")
            .unwrap();
        assert_eq!(
            record.ts,
            Some(Utc.with_ymd_and_hms(2023, 10, 10, 13, 55, 36).unwrap())
        );
    }

    #[test]
    fn method_url_status_tokens() {
        let fmt = LogFormat::parse("%h %m %U %s").unwrap();
        let record = fmt.parse_line("10.0.0.1 POST /login 403").unwrap();
        assert_eq!(record.method.as_deref(), Some("POST"));
        assert_eq!(record.url.as_deref(), Some("/login"));
        assert_eq!(record.status, Some(403));
    }

    #[test]
    fn dash_byte_count_means_zero() {
        let fmt = LogFormat::parse("%h %b").unwrap();
        assert_eq!(fmt.parse_line("10.0.0.1 -").unwrap().bytes, Some(0));
        assert_eq!(fmt.parse_line("10.0.0.1 512").unwrap().bytes, Some(512));
        assert!(fmt.parse_line("10.0.0.1 many").is_err());
    }

    #[test]
    fn template_must_have_exactly_one_host() {
        assert_eq!(
            LogFormat::parse("%t %r").unwrap_err(),
            LogFmtError::NoHostToken
        );
        assert_eq!(
            LogFormat::parse("%h %h").unwrap_err(),
            LogFmtError::MultipleHostTokens
        );
    }

    #[test]
    fn template_rejects_unknown_and_dangling_tokens() {
        assert_eq!(
            LogFormat::parse("%h %x").unwrap_err(),
            LogFmtError::UnknownToken('x')
        );
        assert_eq!(
            LogFormat::parse("%h %").unwrap_err(),
            LogFmtError::DanglingPercent
        );
        assert_eq!(
            LogFormat::parse("%h%u").unwrap_err(),
            LogFmtError::AdjacentTokens
        );
    }

    #[test]
    fn literal_mismatch_is_reported() {
        let fmt = LogFormat::parse("%h \"%u\"").unwrap();
        let err = fmt.parse_line("10.0.0.1 no-quotes-here").unwrap_err();
        assert!(matches!(err, LogFmtError::LiteralMismatch { .. }));
        assert_eq!(err.kind_label(), "malformed log line");
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let fmt = LogFormat::parse("%h %s").unwrap();
        assert!(matches!(
            fmt.parse_line("10.0.0.1 200 extra"),
            Err(LogFmtError::BadStatus(_)) | Err(LogFmtError::TrailingInput(_))
        ));
    }

    #[test]
    fn bad_timestamp_is_rejected() {
        let fmt = LogFormat::parse("%h [%t]").unwrap();
        let err = fmt.parse_line("10.0.0.1 [yesterday]").unwrap_err();
        assert!(matches!(err, LogFmtError::BadTimestamp(_)));
        assert_eq!(err.kind_label(), "unparsable timestamp");
    }

    #[test]
    fn quoted_user_agent_keeps_inner_spaces() {
        let fmt = LogFormat::parse("%h \"%u\"").unwrap();
        let record = fmt
            .parse_line("10.0.0.1 \"Mozilla/5.0 (X11; Linux x86_64)\"")
            .unwrap();
        assert_eq!(record.agent(), "Mozilla/5.0 (X11; Linux x86_64)");
    }
}
