#![forbid(unsafe_code)]

//! Marker-aware splitter for raw archive records.
//!
//! A record is one line shaped like
//! `123;gvibirIDTitle;gvibirDESCText;gvibirLEN01:30;gvibirDATE20210615120000,PDT;gvibirPICurl;gvibirURLurl`.
//! The delimiter character also shows up inside free-text fields, so the
//! split is anchored on the fixed field markers instead of the delimiter
//! itself. Field content between two markers survives verbatim, embedded
//! delimiters included.

/// Delimiter used by the archive dump between id, markers and URLs.
pub const DELIMITER: char = ';';

/// The six field markers, in the order they appear in every record. The id
/// is the unmarked text before the first marker.
const FIELD_MARKERS: [&str; 6] = [
    "gvibirID",
    "gvibirDESC",
    "gvibirLEN",
    "gvibirDATE",
    "gvibirPIC",
    "gvibirURL",
];

/// Index of `gvibirLEN` in [`FIELD_MARKERS`]; the only field allowed to be
/// empty, in which case it contributes no token at all.
const LENGTH_MARKER_INDEX: usize = 2;

const AMP_ESCAPE: &str = "&amp;";
const AMP_PLACEHOLDER: &str = "&amp-placeholder";

/// One record with every field under its own name.
///
/// Downstream code only ever consumes this struct; token positions stop
/// mattering the moment it exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFields {
    pub id: String,
    pub title: String,
    pub description: String,
    /// `None` when the source omitted the length; the true duration then has
    /// to be probed from the downloaded file.
    pub length: Option<String>,
    /// Unparsed upload date field (`YYYYMMDDHHMMSS`, optional `,TZ` tail).
    pub date: String,
    pub thumbnail_url: String,
    pub video_url: String,
}

impl RawFields {
    /// Maps an ordered token list onto named fields.
    ///
    /// Exactly two shapes are valid: seven tokens (full record) or six
    /// (length absent from the source). Anything else returns `None`, which
    /// is the caller's cue to escalate to the extraction service.
    pub fn from_tokens(tokens: &[String]) -> Option<Self> {
        match tokens {
            [id, title, description, length, date, thumbnail_url, video_url] => Some(Self {
                id: id.clone(),
                title: title.clone(),
                description: description.clone(),
                length: Some(length.clone()),
                date: date.clone(),
                thumbnail_url: thumbnail_url.clone(),
                video_url: video_url.clone(),
            }),
            [id, title, description, date, thumbnail_url, video_url] => Some(Self {
                id: id.clone(),
                title: title.clone(),
                description: description.clone(),
                length: None,
                date: date.clone(),
                thumbnail_url: thumbnail_url.clone(),
                video_url: video_url.clone(),
            }),
            _ => None,
        }
    }

    /// Tokenizes and shape-checks a raw record in one step.
    pub fn parse(raw: &str) -> Option<Self> {
        Self::from_tokens(&split_record(raw, DELIMITER))
    }
}

/// Strips non-breaking spaces and protects literal `&amp;` sequences behind a
/// placeholder so they cannot be misread as markup while splitting.
fn normalize(text: &str) -> String {
    text.replace('\u{a0}', "").replace(AMP_ESCAPE, AMP_PLACEHOLDER)
}

/// Trims boundary delimiters and trailing whitespace off a field segment and
/// restores protected ampersands.
fn clean_segment(segment: &str, delimiter: char) -> String {
    segment
        .trim_matches(delimiter)
        .trim_end()
        .replace(AMP_PLACEHOLDER, AMP_ESCAPE)
}

/// Splits one raw record into ordered field tokens: the id first, then the
/// content following each marker, in marker order.
///
/// An empty or missing length field contributes no token, so callers can
/// detect the degraded shape by count (six elements instead of seven). The
/// function never fails and returns whatever it produced; shape validation
/// belongs to the field extractor.
pub fn split_record(raw: &str, delimiter: char) -> Vec<String> {
    let text = normalize(raw.trim_end());

    // Locate markers left to right. A marker that is absent simply does not
    // contribute a token; the next marker search continues from the same
    // cursor so field order is preserved.
    let mut found: Vec<(usize, usize, usize)> = Vec::new();
    let mut cursor = 0;
    for (index, marker) in FIELD_MARKERS.iter().enumerate() {
        if let Some(rel) = text[cursor..].find(marker) {
            let start = cursor + rel;
            let end = start + marker.len();
            found.push((index, start, end));
            cursor = end;
        }
    }

    let mut tokens = Vec::with_capacity(found.len() + 1);
    let id_end = found.first().map_or(text.len(), |&(_, start, _)| start);
    tokens.push(clean_segment(&text[..id_end], delimiter));

    for (position, &(index, _, content_start)) in found.iter().enumerate() {
        let content_end = found
            .get(position + 1)
            .map_or(text.len(), |&(_, next_start, _)| next_start);
        let content = clean_segment(&text[content_start..content_end], delimiter);
        if index == LENGTH_MARKER_INDEX && content.is_empty() {
            continue;
        }
        tokens.push(content);
    }

    tokens
}
